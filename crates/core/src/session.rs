//! Caller-owned upload session state

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Content hashes that reached storage during this session.
///
/// Shared by every worker of a run (and by successive runs when the caller
/// reuses the session). Writes take the lock exclusively; lookups share it.
#[derive(Debug, Default)]
pub struct UploadSession {
    completed: RwLock<HashSet<String>>,
}

impl UploadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self, hash: &str) -> bool {
        self.completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(hash)
    }

    /// Record a hash; returns `false` if it was already present
    pub fn mark_completed(&self, hash: &str) -> bool {
        self.completed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash.to_string())
    }

    pub fn completed_count(&self) -> usize {
        self.completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_once() {
        let session = UploadSession::new();
        assert!(session.mark_completed("abc"));
        assert!(!session.mark_completed("abc"));
        assert!(session.is_completed("abc"));
        assert_eq!(session.completed_count(), 1);
    }

    #[test]
    fn test_concurrent_marks_are_not_lost() {
        let session = Arc::new(UploadSession::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = Arc::clone(&session);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        s.mark_completed(&format!("{}-{}", t, i));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(session.completed_count(), 800);
    }
}
