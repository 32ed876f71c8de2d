//! Index key comparison
//!
//! Index cells carry a serialized record: a varint header length, one varint
//! serial type per field, then the field bodies. Index seeks compare the
//! record stored in a cell against an [`UnpackedRecord`] probe using the
//! collations and sort orders in [`KeyInfo`].

use std::cmp::Ordering;
use std::sync::Arc;

use super::encoding::read_varint_at;

/// Sort-order flag: the field sorts descending.
pub const KEYINFO_ORDER_DESC: u8 = 0x01;

/// Collation sequence for text fields
#[derive(Clone)]
pub enum CollSeq {
    /// memcmp order
    Binary,
    /// ASCII case folded
    NoCase,
    /// Trailing spaces ignored
    RTrim,
    Custom {
        name: String,
        cmp: Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>,
    },
}

impl CollSeq {
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            CollSeq::Binary => a.cmp(b),
            CollSeq::NoCase => a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()),
            CollSeq::RTrim => a.trim_end_matches(' ').cmp(b.trim_end_matches(' ')),
            CollSeq::Custom { cmp, .. } => cmp(a, b),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CollSeq::Binary => "BINARY",
            CollSeq::NoCase => "NOCASE",
            CollSeq::RTrim => "RTRIM",
            CollSeq::Custom { name, .. } => name,
        }
    }
}

impl std::fmt::Debug for CollSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollSeq({})", self.name())
    }
}

impl Default for CollSeq {
    fn default() -> Self {
        CollSeq::Binary
    }
}

/// One decoded field of a record
#[derive(Clone, Debug, PartialEq)]
pub enum RecordField {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Per-index comparison rules
#[derive(Clone, Debug)]
pub struct KeyInfo {
    /// Fields that take part in the comparison; 0 compares them all
    pub n_key_field: u16,
    pub sort_flags: Vec<u8>,
    pub collations: Vec<CollSeq>,
}

impl KeyInfo {
    pub fn new(n_key_field: u16) -> Self {
        let n = n_key_field as usize;
        Self {
            n_key_field,
            sort_flags: vec![0; n],
            collations: vec![CollSeq::Binary; n],
        }
    }

    pub fn with_collations(n_key_field: u16, mut collations: Vec<CollSeq>) -> Self {
        let n = n_key_field as usize;
        collations.resize(n, CollSeq::Binary);
        Self {
            n_key_field,
            sort_flags: vec![0; n],
            collations,
        }
    }

    pub fn descending(mut self, field: usize) -> Self {
        if let Some(flags) = self.sort_flags.get_mut(field) {
            *flags |= KEYINFO_ORDER_DESC;
        }
        self
    }

    /// Compare two serialized records field by field.
    pub fn compare_records(&self, a: &[u8], b: &[u8]) -> Ordering {
        let fields_a = parse_record_fields(a);
        let fields_b = parse_record_fields(b);
        match self.compare_fields(&fields_a, &fields_b) {
            Ordering::Equal => fields_a.len().cmp(&fields_b.len()),
            other => other,
        }
    }

    /// Compare the common prefix of two field lists.
    fn compare_fields(&self, a: &[RecordField], b: &[RecordField]) -> Ordering {
        let limit = match self.n_key_field {
            0 => usize::MAX,
            n => n as usize,
        };
        let n = limit.min(a.len()).min(b.len());
        for i in 0..n {
            let collation = self.collations.get(i).cloned().unwrap_or_default();
            let cmp = compare_record_fields(&a[i], &b[i], &collation);
            if cmp != Ordering::Equal {
                let desc = self
                    .sort_flags
                    .get(i)
                    .map_or(false, |flags| flags & KEYINFO_ORDER_DESC != 0);
                return if desc { cmp.reverse() } else { cmp };
            }
        }
        Ordering::Equal
    }
}

/// A search key for an index tree
#[derive(Clone, Debug)]
pub struct UnpackedRecord {
    /// Serialized record bytes
    pub key: Vec<u8>,
    pub fields: Vec<RecordField>,
    pub key_info: Option<Arc<KeyInfo>>,
    /// Result returned when every probe field matches a longer cell record
    pub default_rc: Ordering,
    /// Set by a seek when some compared cell matched on every probe field
    pub eq_seen: bool,
}

impl UnpackedRecord {
    /// Probe compared byte-wise against cell keys.
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            fields: Vec::new(),
            key_info: None,
            default_rc: Ordering::Equal,
            eq_seen: false,
        }
    }

    pub fn with_key_info(key: Vec<u8>, key_info: Arc<KeyInfo>) -> Self {
        let fields = parse_record_fields(&key);
        Self {
            key,
            fields,
            key_info: Some(key_info),
            default_rc: Ordering::Equal,
            eq_seen: false,
        }
    }

    pub fn with_default_rc(mut self, rc: Ordering) -> Self {
        self.default_rc = rc;
        self
    }

    /// Order of the cell record `cell` relative to this probe.
    pub fn compare_cell(&mut self, cell: &[u8]) -> Ordering {
        match &self.key_info {
            Some(key_info) => {
                let cell_fields = parse_record_fields(cell);
                let n = self.fields.len().min(cell_fields.len());
                match key_info.compare_fields(&cell_fields[..n], &self.fields[..n]) {
                    Ordering::Equal if cell_fields.len() >= self.fields.len() => {
                        self.eq_seen = true;
                        self.default_rc
                    }
                    Ordering::Equal => Ordering::Less,
                    other => other,
                }
            }
            None => match cell.cmp(&self.key) {
                Ordering::Equal => {
                    self.eq_seen = true;
                    self.default_rc
                }
                other => other,
            },
        }
    }
}

/// Serialize `fields` as a record.
pub fn make_record(fields: &[RecordField]) -> Vec<u8> {
    use super::encoding::{varint_len, write_varint};

    let mut header = Vec::new();
    let mut body = Vec::new();
    for field in fields {
        let serial_type: u64 = match field {
            RecordField::Null => 0,
            RecordField::Int(0) => 8,
            RecordField::Int(1) => 9,
            RecordField::Int(v) => {
                body.extend_from_slice(&v.to_be_bytes());
                6
            }
            RecordField::Float(f) => {
                body.extend_from_slice(&f.to_bits().to_be_bytes());
                7
            }
            RecordField::Text(s) => {
                body.extend_from_slice(s.as_bytes());
                s.len() as u64 * 2 + 13
            }
            RecordField::Blob(b) => {
                body.extend_from_slice(b);
                b.len() as u64 * 2 + 12
            }
        };
        write_varint(serial_type, &mut header);
    }
    let mut len_bytes = 1;
    while varint_len((header.len() + len_bytes) as u64) > len_bytes {
        len_bytes += 1;
    }
    let hdr_len = header.len() + len_bytes;
    let mut out = Vec::with_capacity(hdr_len + body.len());
    write_varint(hdr_len as u64, &mut out);
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    out
}

/// Decode every field of a record. Truncated records yield the fields that
/// could be decoded.
pub fn parse_record_fields(data: &[u8]) -> Vec<RecordField> {
    if data.is_empty() {
        return Vec::new();
    }
    let (header_size, mut offset) = read_varint_at(data, 0);
    let header_size = header_size as usize;
    if header_size > data.len() || header_size < offset {
        return Vec::new();
    }
    let mut serial_types = Vec::new();
    while offset < header_size {
        let (serial_type, n) = read_varint_at(data, offset);
        if n == 0 {
            break;
        }
        serial_types.push(serial_type);
        offset += n;
    }

    let mut fields = Vec::with_capacity(serial_types.len());
    let mut body = header_size;
    for serial_type in serial_types {
        match deserialize_field(&data[body.min(data.len())..], serial_type) {
            Some((field, size)) => {
                fields.push(field);
                body += size;
            }
            None => break,
        }
    }
    fields
}

fn be_int(bytes: &[u8]) -> i64 {
    let mut v: i64 = if bytes.first().map_or(false, |b| b & 0x80 != 0) {
        -1
    } else {
        0
    };
    for &b in bytes {
        v = (v << 8) | b as i64;
    }
    v
}

fn deserialize_field(data: &[u8], serial_type: u64) -> Option<(RecordField, usize)> {
    let int_width = match serial_type {
        1..=4 => Some(serial_type as usize),
        5 => Some(6),
        6 => Some(8),
        _ => None,
    };
    if let Some(width) = int_width {
        let bytes = data.get(..width)?;
        return Some((RecordField::Int(be_int(bytes)), width));
    }
    match serial_type {
        0 | 10 | 11 => Some((RecordField::Null, 0)),
        7 => {
            let bytes = data.get(..8)?;
            let bits = be_int(bytes) as u64;
            Some((RecordField::Float(f64::from_bits(bits)), 8))
        }
        8 => Some((RecordField::Int(0), 0)),
        9 => Some((RecordField::Int(1), 0)),
        n if n % 2 == 0 => {
            let len = ((n - 12) / 2) as usize;
            Some((RecordField::Blob(data.get(..len)?.to_vec()), len))
        }
        n => {
            let len = ((n - 13) / 2) as usize;
            let text = String::from_utf8_lossy(data.get(..len)?).into_owned();
            Some((RecordField::Text(text), len))
        }
    }
}

/// NULL < numbers < text < blob
fn compare_record_fields(a: &RecordField, b: &RecordField, collation: &CollSeq) -> Ordering {
    use RecordField::*;

    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Int(x), Int(y)) => x.cmp(y),
        (Float(x), Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Text(x), Text(y)) => collation.compare(x, y),
        (Blob(x), Blob(y)) => x.cmp(y),
        (Int(_) | Float(_), Text(_) | Blob(_)) => Ordering::Less,
        (Text(_) | Blob(_), Int(_) | Float(_)) => Ordering::Greater,
        (Text(_), Blob(_)) => Ordering::Less,
        (Blob(_), Text(_)) => Ordering::Greater,
    }
}
