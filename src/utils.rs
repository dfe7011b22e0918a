use std::sync::{Once, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// copy from https://github.com/tikv/tikv/blob/b15ea3b1cd766375cb52019e35c195ed797124df/components/tikv_util/src/lib.rs#L171-L186
///
/// A handy shortcut to replace the `RwLock` write/read().unwrap() pattern
/// with `.wl()` and `.rl()`.
pub trait HandyRwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T>;
    fn rl(&self) -> RwLockReadGuard<'_, T>;
}

impl<T> HandyRwLock<T> for RwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap()
    }

    fn rl(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap()
    }
}

static LOG_INIT: Once = Once::new();

/// Configure `env_logger` with a timestamped, leveled format. Safe to
/// call more than once; only the first call takes effect.
pub fn init_log() {
    LOG_INIT.call_once(|| {
        use std::io::Write;

        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format_timestamp_millis()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}
