//! Process-wide shared-cache switch and the registry of open shared files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;

use crate::storage::btree::BtShared;

static SHARED_CACHE_ENABLED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref SHARED_CACHE_REGISTRY: Mutex<HashMap<PathBuf, Weak<Mutex<BtShared>>>> =
        Mutex::new(HashMap::new());
}

pub fn set_shared_cache_enabled(enabled: bool) {
    SHARED_CACHE_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn shared_cache_enabled() -> bool {
    SHARED_CACHE_ENABLED.load(Ordering::SeqCst)
}

fn registry_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Find a live shared file for `path`, pruning the entry if it has died.
pub(crate) fn lookup(path: &Path) -> Option<Arc<Mutex<BtShared>>> {
    let key = registry_key(path);
    let mut registry = SHARED_CACHE_REGISTRY.lock().ok()?;
    if let Some(shared) = registry.get(&key).and_then(|entry| entry.upgrade()) {
        return Some(shared);
    }
    registry.remove(&key);
    None
}

pub(crate) fn insert(path: &Path, shared: &Arc<Mutex<BtShared>>) {
    let key = registry_key(path);
    if let Ok(mut registry) = SHARED_CACHE_REGISTRY.lock() {
        registry.retain(|_, entry| entry.strong_count() > 0);
        registry.insert(key, Arc::downgrade(shared));
    }
}
