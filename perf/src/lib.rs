use ffq_events::DataItem;
use std::sync::OnceLock;
use std::time::Instant;

pub fn temp_shm_path(label: &str) -> String {
    let pid = std::process::id();
    format!("/tmp/ffq_bench_{label}_{pid}")
}

pub fn make_test_item(id: u64) -> DataItem {
    DataItem::new(id, id as f64 * 1.5, mono_now_ns(), "bench")
}

/// Nanoseconds since the first call in this process.
#[inline]
pub fn mono_now_ns() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
