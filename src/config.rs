//! Configuration for opening a Btree handle.

use crate::storage::btree::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Largest page count accepted before the free-list is considered corrupt.
pub const DEFAULT_MAX_PAGE_COUNT: u32 = 1_073_741_823;

/// Options applied when a Btree handle is opened.
#[derive(Debug, Clone)]
pub struct BtreeConfig {
    /// Page size used when the file is created. Ignored for existing files.
    pub page_size: u32,
    /// Bytes reserved at the end of every page.
    pub reserve: u8,
    /// Overwrite freed content with zeros.
    pub secure_delete: bool,
    /// Share the underlying file state with other handles on the same path.
    pub shared_cache: bool,
    /// Refuse write transactions.
    pub read_only: bool,
    /// Read through other handles' write locks in shared-cache mode.
    pub read_uncommitted: bool,
    /// Upper bound on the number of pages in the file.
    pub max_page_count: u32,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reserve: 0,
            secure_delete: false,
            shared_cache: false,
            read_only: false,
            read_uncommitted: false,
            max_page_count: DEFAULT_MAX_PAGE_COUNT,
        }
    }
}

impl BtreeConfig {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn reserve(mut self, reserve: u8) -> Self {
        self.reserve = reserve;
        self
    }

    pub fn secure_delete(mut self, on: bool) -> Self {
        self.secure_delete = on;
        self
    }

    pub fn shared_cache(mut self, on: bool) -> Self {
        self.shared_cache = on;
        self
    }

    pub fn read_only(mut self, on: bool) -> Self {
        self.read_only = on;
        self
    }

    pub fn read_uncommitted(mut self, on: bool) -> Self {
        self.read_uncommitted = on;
        self
    }

    pub fn max_page_count(mut self, max: u32) -> Self {
        self.max_page_count = max;
        self
    }

    /// Page size and reserve must describe a legal page with at least 480 usable bytes.
    pub fn is_valid_geometry(&self) -> bool {
        (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            && self.page_size.is_power_of_two()
            && self.page_size - self.reserve as u32 >= 480
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_validation() {
        assert!(BtreeConfig::default().is_valid_geometry());
        assert!(BtreeConfig::default().page_size(512).is_valid_geometry());
        assert!(!BtreeConfig::default().page_size(1000).is_valid_geometry());
        assert!(!BtreeConfig::default().page_size(512).reserve(40).is_valid_geometry());
    }
}
