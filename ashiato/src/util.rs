use std::path::Path;

pub mod account;

/// Converts a nanosecond count into a chrono duration, saturating on
/// values which do not fit.
#[inline]
pub fn ns_duration(ns: u64) -> chrono::Duration {
    chrono::Duration::nanoseconds(i64::try_from(ns).unwrap_or(i64::MAX))
}

/// Returns the last component of an executable path, or the path itself
/// when it has none (kernel threads, empty paths).
#[inline]
pub fn basename<S: AsRef<str>>(path: S) -> String {
    let path = path.as_ref();
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or(path.to_string())
}
