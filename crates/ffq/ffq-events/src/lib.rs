pub mod data_item;
pub mod fixed_str;
pub mod weather;

pub use data_item::DataItem;
pub use fixed_str::FixedStr;
pub use weather::{ParseError, WeatherReading, SENTINEL_CITY};

// Payloads travel through the queue by bitwise copy, so every record here is
// `#[repr(C)]`, `Copy` and fixed-size. Which records are end-of-stream markers
// is encoded in a dedicated `kind` field rather than in the data itself.

/// Marker byte stored in every payload record.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ItemKind(pub u8);

impl ItemKind {
    pub const DATA: ItemKind = ItemKind(0);
    pub const SENTINEL: ItemKind = ItemKind(1);
}

/// A payload type with one reserved end-of-stream value.
///
/// A producer enqueues one sentinel per consumer when its input is exhausted;
/// a consumer that dequeues a sentinel stops polling.
pub trait Sentinel: Copy {
    fn sentinel() -> Self;

    fn is_sentinel(&self) -> bool;
}
