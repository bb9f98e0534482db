//! Shared helpers for tests that touch process-wide state (environment
//! variables drive the path layout, so those tests must not interleave).

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) struct EnvGuard {
    _lock: MutexGuard<'static, ()>,
    saved: HashMap<String, Option<String>>,
}

/// Take the process-wide env lock and start tracking mutations; every
/// variable touched through the guard is restored on drop.
pub(crate) fn env_guard() -> EnvGuard {
    let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    EnvGuard {
        _lock: lock,
        saved: HashMap::new(),
    }
}

impl EnvGuard {
    fn remember(&mut self, key: &str) {
        self.saved
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }

    pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
        self.remember(key);
        std::env::set_var(key, value.as_ref());
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.remember(key);
        std::env::remove_var(key);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain() {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Point the whole path layout at a scratch directory.
pub(crate) fn scoped_paths(guard: &mut EnvGuard, root: &std::path::Path) {
    let root_str = root.to_string_lossy().into_owned();
    guard.set("WARDEN_PATH_HOME", &root_str);
    guard.remove("WARDEN_PATH_DATA");
    guard.remove("WARDEN_PATH_CONFIG");
    guard.remove("WARDEN_PATH_DOWNLOADS");
    guard.remove("WARDEN_PATH_INSTALL");
}
