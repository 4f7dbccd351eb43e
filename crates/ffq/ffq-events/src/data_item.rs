#![forbid(unsafe_code)]

use crate::{FixedStr, ItemKind, Sentinel};

/// Generic sample record, as manufactured by the test and benchmark producers.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct DataItem {
    pub id: u64,
    pub value: f64,
    pub timestamp_ns: u64,
    pub source: FixedStr<32>,
    pub kind: ItemKind,
}

impl DataItem {
    pub fn new(id: u64, value: f64, timestamp_ns: u64, source: &str) -> Self {
        Self {
            id,
            value,
            timestamp_ns,
            source: FixedStr::new(source),
            kind: ItemKind::DATA,
        }
    }
}

impl Sentinel for DataItem {
    fn sentinel() -> Self {
        Self {
            id: u64::MAX,
            value: -1.0,
            timestamp_ns: u64::MAX,
            source: FixedStr::new("sentinel"),
            kind: ItemKind::SENTINEL,
        }
    }

    #[inline]
    fn is_sentinel(&self) -> bool {
        self.kind == ItemKind::SENTINEL
    }
}
