use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// Per-user turn serializer: a concurrent map of lazily allocated mutexes.
///
/// The gateway holds a user's mutex across `process_turn`, which serializes
/// that user's turns while leaving unrelated users fully parallel. Entries
/// live for the process lifetime.
#[derive(Clone, Default)]
pub struct UserSerializer {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl UserSerializer {
    pub fn new() -> UserSerializer {
        UserSerializer::default()
    }

    /// Returns the user's mutex, allocating it on first access.
    pub fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
