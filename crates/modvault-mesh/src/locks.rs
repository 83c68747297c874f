//! Per-content mutual exclusion and the compliance blocklist.
//!
//! The keyed lock map guarantees at most one fetch per content id in flight
//! per process. The blocklist is an in-memory set backed by an append-only
//! audit log; on construction the log is replayed so takedowns survive
//! restarts. Blocklist scope is mesh-only: a blocked id is never fetched
//! through the mesh nor registered for re-sharing, but provider fetches of
//! the same content stay allowed.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use modvault_core::{CachePaths, ContentId};

/// Guard proving exclusive access to one content id.
///
/// Dropping the guard releases the key for the next waiter.
#[derive(Debug)]
pub struct ContentKeyGuard {
    _permit: OwnedSemaphorePermit,
}

/// Keyed semaphore map serializing fetches per content id.
#[derive(Debug, Default)]
pub struct ContentKeyLocks {
    keys: Mutex<HashMap<ContentId, Arc<Semaphore>>>,
}

impl ContentKeyLocks {
    /// Create an empty lock map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `content_id`, waiting until the current holder
    /// releases it.
    pub async fn acquire(&self, content_id: &ContentId) -> ContentKeyGuard {
        let semaphore = {
            let mut keys = self.keys.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(
                keys.entry(content_id.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        // The semaphore is never closed, so acquisition can only wait.
        let permit = semaphore
            .acquire_owned()
            .await
            .expect("content key semaphore closed");
        ContentKeyGuard { _permit: permit }
    }
}

/// Compliance takedown list with an audit trail.
#[derive(Debug)]
pub struct Blocklist {
    blocked: Mutex<HashSet<String>>,
    audit_path: PathBuf,
}

impl Blocklist {
    /// Create the blocklist, replaying any existing audit log.
    #[must_use]
    pub fn load(paths: &CachePaths) -> Self {
        let audit_path = paths.audit_log();
        let mut blocked = HashSet::new();
        if let Ok(log) = std::fs::read_to_string(&audit_path) {
            for line in log.lines() {
                let mut parts = line.split('|');
                if let (Some(_ts), Some("BLOCK"), Some(id)) =
                    (parts.next(), parts.next(), parts.next())
                {
                    blocked.insert(id.to_string());
                }
            }
        }
        Self {
            blocked: Mutex::new(blocked),
            audit_path,
        }
    }

    /// Block a content id and append an audit line.
    pub fn block(&self, content_id: &ContentId, reason: Option<&str>) -> io::Result<()> {
        let newly_blocked = self
            .blocked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(content_id.as_str().to_string());
        if !newly_blocked {
            return Ok(());
        }

        let line = format!(
            "{}|BLOCK|{}|{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            content_id,
            reason.unwrap_or("manual"),
        );
        if let Some(parent) = self.audit_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)?;
        file.write_all(line.as_bytes())?;
        tracing::warn!(
            target: "modvault.mesh",
            content_id = %content_id,
            reason = reason.unwrap_or("manual"),
            "content id blocklisted"
        );
        Ok(())
    }

    /// Whether a content id is blocked.
    #[must_use]
    pub fn is_blocked(&self, content_id: &ContentId) -> bool {
        self.blocked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(content_id.as_str())
    }

    /// Number of blocked ids.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.blocked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(hex_char: char) -> ContentId {
        ContentId::new(hex_char.to_string().repeat(40)).unwrap()
    }

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(ContentKeyLocks::new());
        let key = id('a');

        let guard = locks.acquire(&key).await;

        let locks2 = Arc::clone(&locks);
        let key2 = key.clone();
        let contender = tokio::spawn(async move {
            let _guard = locks2.acquire(&key2).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished(), "second acquire must wait");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("second acquire should complete after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let locks = ContentKeyLocks::new();
        let _a = locks.acquire(&id('a')).await;
        // Acquiring a different key must not block.
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&id('b')))
            .await
            .expect("different key should not wait");
    }

    #[tokio::test]
    async fn test_reacquire_after_drop() {
        let locks = ContentKeyLocks::new();
        let key = id('c');
        drop(locks.acquire(&key).await);
        drop(locks.acquire(&key).await);
    }

    fn blocklist() -> (tempfile::TempDir, CachePaths, Blocklist) {
        let dir = tempfile::tempdir().unwrap();
        let paths = CachePaths::new(dir.path().join("Cache"));
        paths.ensure_dirs().unwrap();
        let list = Blocklist::load(&paths);
        (dir, paths, list)
    }

    #[test]
    fn test_block_and_query() {
        let (_dir, _paths, list) = blocklist();
        let target = id('d');
        assert!(!list.is_blocked(&target));
        list.block(&target, None).unwrap();
        assert!(list.is_blocked(&target));
        assert_eq!(list.blocked_count(), 1);
    }

    #[test]
    fn test_audit_line_format() {
        let (_dir, paths, list) = blocklist();
        let target = id('e');
        list.block(&target, None).unwrap();

        let log = std::fs::read_to_string(paths.audit_log()).unwrap();
        let line = log.lines().next().unwrap();
        let parts: Vec<&str> = line.split('|').collect();
        assert_eq!(parts.len(), 4);
        // Timestamp is RFC3339 with a Z suffix and no offset characters.
        assert!(parts[0].ends_with('Z'));
        assert!(parts[0].chars().all(|c| c.is_ascii_digit() || "T:-.Z".contains(c)));
        assert_eq!(parts[1], "BLOCK");
        assert_eq!(parts[2], target.as_str());
        assert_eq!(parts[3], "manual");
    }

    #[test]
    fn test_block_is_idempotent_in_audit() {
        let (_dir, paths, list) = blocklist();
        let target = id('f');
        list.block(&target, Some("dmca")).unwrap();
        list.block(&target, Some("dmca")).unwrap();
        let log = std::fs::read_to_string(paths.audit_log()).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn test_rehydration_from_audit_log() {
        let (_dir, paths, list) = blocklist();
        let target = id('a');
        list.block(&target, Some("court order")).unwrap();
        drop(list);

        let revived = Blocklist::load(&paths);
        assert!(revived.is_blocked(&target));
        assert_eq!(revived.blocked_count(), 1);
    }
}
