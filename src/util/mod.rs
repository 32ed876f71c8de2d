//! Small shared utilities

pub mod bitvec;
