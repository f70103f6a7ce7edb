use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Lazily-populated map of named mutexes with stable identity.
///
/// Entries are never removed: the set of keys is bounded by tenants x
/// regions, and stable identity is what makes two callers with the same key
/// actually contend.
#[derive(Default)]
pub struct KeyedMutex {
    entries: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut entries = self.entries.lock().expect("keyed mutex registry poisoned");
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}
