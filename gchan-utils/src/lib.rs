use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rstest::*;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use tracing_subscriber::layer::SubscriberExt;

/// Test fixture that wires up the tracing stack once per process.
///
/// `GCHAN_LOG` controls the filter, defaulting to `info`. Safe to call from
/// every test; later calls are no-ops.
#[fixture]
pub fn setup_tracing() {
    _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(true)
                .with_file(false)
                .without_time()
                .with_test_writer()
                .with_line_number(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_filter(
                    EnvFilter::builder()
                        .with_env_var("GCHAN_LOG")
                        .with_default_directive("info".parse().unwrap())
                        .from_env_lossy(),
                ),
        )
        .try_init();

    std::panic::set_hook(Box::new(|info| {
        let (file, line) = info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or_default();
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or_default();
        tracing::error!(src.file = file, src.line = line, panic = %payload);
    }));
}

/// Formats an integer the way it reads in a memory dump: `0xDEADBEEF`.
pub struct Hex(String);

impl std::fmt::Display for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.0)
    }
}

impl std::fmt::Debug for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.0)
    }
}

pub fn hex<T: Copy>(x: T) -> Hex {
    let size = size_of::<T>();
    let mut bytes = vec![0u8; size];
    // SAFETY: T is Copy and we only read its size_of bytes.
    unsafe {
        std::ptr::copy_nonoverlapping(&x as *const T as *const u8, bytes.as_mut_ptr(), size);
    }
    if cfg!(target_endian = "little") {
        bytes.reverse();
    }
    Hex(const_hex::encode_upper(&bytes))
}

pub trait IgnorePoison<'a> {
    type Output;
    type OutputMut;

    fn get(&'a self) -> Self::Output;
    fn get_mut(&'a self) -> Self::OutputMut;
}

impl<'a, T> IgnorePoison<'a> for Mutex<T>
where
    T: 'a,
{
    type Output = MutexGuard<'a, T>;
    type OutputMut = MutexGuard<'a, T>;

    fn get(&'a self) -> Self::Output {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_mut(&'a self) -> Self::OutputMut {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<'a, T> IgnorePoison<'a> for RwLock<T>
where
    T: 'a,
{
    type Output = RwLockReadGuard<'a, T>;
    type OutputMut = RwLockWriteGuard<'a, T>;

    fn get(&'a self) -> Self::Output {
        self.read().unwrap_or_else(|e| e.into_inner())
    }

    fn get_mut(&'a self) -> Self::OutputMut {
        self.write().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn default<T: Default>() -> T {
    T::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hex_encode() {
        let number = 0xDEAD_BEEFu32;
        assert_eq!(hex(number).to_string(), "0xDEADBEEF");
        assert_eq!(hex(0x20u8).to_string(), "0x20");
    }
}
