use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use user_memory_schemas::UserId;

/// Prune idle entries once the map grows past this many users.
const PRUNE_THRESHOLD: usize = 1024;

/// One mutex per user id. Mutations for the same user are serialized;
/// different users never contend.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock handle for `user_id`, creating it on first use.
    pub fn handle(&self, user_id: &UserId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locks a handle. Poisoning is ignored; the lock guards no data.
pub fn acquire(handle: &Mutex<()>) -> MutexGuard<'_, ()> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_user_shares_lock() {
        let locks = UserLocks::new();
        let a = locks.handle(&UserId("u_1".into()));
        let b = locks.handle(&UserId("u_1".into()));
        let c = locks.handle(&UserId("u_2".into()));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn test_distinct_users_do_not_block() {
        let locks = UserLocks::new();
        let a = locks.handle(&UserId("u_1".into()));
        let b = locks.handle(&UserId("u_2".into()));

        let _guard_a = acquire(&a);
        assert!(b.try_lock().is_ok());
        assert!(a.try_lock().is_err());
    }
}
