//! Atomic multi-file write buffer.
//!
//! Completion touches the WU YAML, both markdown summaries, the stamp, and
//! sometimes an initiative file; either all of them land or none do. Writes
//! are buffered, validated as a set, then flushed sequentially; the snapshot
//! captures pre-transaction bytes so a post-commit git failure can restore
//! every touched path.

use std::path::{Path, PathBuf};

use crate::error::{LumenError, Result};

/// One buffered write.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub path: PathBuf,
    /// `None` models a write whose content was never produced; validation
    /// rejects the whole transaction in that case.
    pub content: Option<String>,
    pub description: String,
}

/// Result of [`WuTransaction::validate`].
#[derive(Debug)]
pub struct TransactionValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Result of [`WuTransaction::commit`].
#[derive(Debug)]
pub struct CommitReport {
    pub success: bool,
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

#[derive(Debug, Default)]
pub struct WuTransaction {
    writes: Vec<PendingWrite>,
    committed: bool,
    aborted: bool,
}

impl WuTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a pending write. Fails once the transaction is committed or
    /// aborted.
    pub fn add_write(
        &mut self,
        path: impl Into<PathBuf>,
        content: impl Into<Option<String>>,
        description: impl Into<String>,
    ) -> Result<()> {
        if self.committed {
            return Err(LumenError::Transaction {
                message: "cannot add writes to a committed transaction".to_string(),
                restored: false,
            });
        }
        if self.aborted {
            return Err(LumenError::Transaction {
                message: "cannot add writes to an aborted transaction".to_string(),
                restored: false,
            });
        }
        self.writes.push(PendingWrite {
            path: path.into(),
            content: content.into(),
            description: description.into(),
        });
        Ok(())
    }

    pub fn pending(&self) -> &[PendingWrite] {
        &self.writes
    }

    pub fn pending_paths(&self) -> Vec<PathBuf> {
        self.writes.iter().map(|w| w.path.clone()).collect()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Invalid iff there are zero pending writes or any write has no content.
    pub fn validate(&self) -> TransactionValidation {
        let mut errors = Vec::new();
        if self.writes.is_empty() {
            errors.push("transaction has no pending writes".to_string());
        }
        for write in &self.writes {
            if write.content.is_none() {
                errors.push(format!(
                    "write '{}' ({}) has no content",
                    write.description,
                    write.path.display()
                ));
            }
        }
        TransactionValidation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Flush every pending write, creating parent directories as needed.
    ///
    /// Stops at the first failure; the caller restores from its snapshot in
    /// that case. On success the buffer is cleared and the transaction is
    /// marked committed.
    pub fn commit(&mut self) -> Result<CommitReport> {
        let validation = self.validate();
        if !validation.valid {
            return Err(LumenError::Transaction {
                message: validation.errors.join("; "),
                restored: false,
            });
        }

        let mut written = Vec::new();
        let mut failed = Vec::new();

        for write in &self.writes {
            let content = write.content.as_deref().unwrap_or_default();
            let result = write
                .path
                .parent()
                .map(std::fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|()| std::fs::write(&write.path, content));
            match result {
                Ok(()) => written.push(write.path.clone()),
                Err(e) => {
                    failed.push((write.path.clone(), e.to_string()));
                    break;
                }
            }
        }

        let success = failed.is_empty();
        if success {
            self.writes.clear();
            self.committed = true;
        }
        Ok(CommitReport {
            success,
            written,
            failed,
        })
    }

    /// Discard pending writes. A no-op (with a warning) on committed
    /// transactions.
    pub fn abort(&mut self) {
        if self.committed {
            log::warn!("abort called on a committed transaction; ignoring");
            return;
        }
        self.writes.clear();
        self.aborted = true;
    }
}

/// Pre-transaction contents of a set of paths. `None` marks a path that did
/// not exist.
#[derive(Debug)]
pub struct TransactionSnapshot {
    entries: Vec<(PathBuf, Option<Vec<u8>>)>,
}

impl TransactionSnapshot {
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(p, _)| p.as_path())
    }
}

/// Capture the current bytes of every path (or their absence) for rollback.
pub fn create_transaction_snapshot(paths: &[PathBuf]) -> Result<TransactionSnapshot> {
    let mut entries = Vec::with_capacity(paths.len());
    for path in paths {
        let content = match std::fs::read(path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(LumenError::Transaction {
                    message: format!("snapshot read {}: {e}", path.display()),
                    restored: false,
                });
            }
        };
        entries.push((path.clone(), content));
    }
    Ok(TransactionSnapshot { entries })
}

/// Restore every snapshotted path to its pre-transaction state: contents
/// rewritten, previously-absent files removed.
pub fn restore_from_snapshot(snapshot: &TransactionSnapshot) -> Result<()> {
    for (path, content) in &snapshot.entries {
        let result = match content {
            Some(bytes) => path
                .parent()
                .map(std::fs::create_dir_all)
                .unwrap_or(Ok(()))
                .and_then(|()| std::fs::write(path, bytes)),
            None => match std::fs::remove_file(path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            return Err(LumenError::Transaction {
                message: format!("snapshot restore {}: {e}", path.display()),
                restored: false,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_transaction_is_invalid() {
        let tx = WuTransaction::new();
        let validation = tx.validate();
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 1);
    }

    #[test]
    fn missing_content_is_invalid_and_commit_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = WuTransaction::new();
        tx.add_write(dir.path().join("a.txt"), Some("a".to_string()), "a")
            .unwrap();
        tx.add_write(dir.path().join("b.txt"), None, "b").unwrap();

        assert!(!tx.validate().valid);
        assert!(tx.commit().is_err());
        // validate failure must leave no file touched
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn commit_writes_all_files_and_clears_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = WuTransaction::new();
        tx.add_write(
            dir.path().join("nested/dir/wu.yaml"),
            Some("status: done\n".to_string()),
            "WU YAML",
        )
        .unwrap();
        tx.add_write(
            dir.path().join("stamp.done"),
            Some("WU WU-1 — t\n".to_string()),
            "stamp",
        )
        .unwrap();

        let report = tx.commit().unwrap();
        assert!(report.success);
        assert_eq!(report.written.len(), 2);
        assert!(report.failed.is_empty());
        assert!(tx.is_committed());
        assert!(tx.pending().is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/dir/wu.yaml")).unwrap(),
            "status: done\n"
        );
    }

    #[test]
    fn add_write_after_commit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = WuTransaction::new();
        tx.add_write(dir.path().join("a"), Some("x".to_string()), "a")
            .unwrap();
        tx.commit().unwrap();
        assert!(tx
            .add_write(dir.path().join("b"), Some("y".to_string()), "b")
            .is_err());
    }

    #[test]
    fn abort_discards_pending_and_blocks_future_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = WuTransaction::new();
        tx.add_write(dir.path().join("a"), Some("x".to_string()), "a")
            .unwrap();
        tx.abort();
        assert!(tx.pending().is_empty());
        assert!(tx
            .add_write(dir.path().join("a"), Some("x".to_string()), "a")
            .is_err());
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn abort_after_commit_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut tx = WuTransaction::new();
        tx.add_write(dir.path().join("a"), Some("x".to_string()), "a")
            .unwrap();
        tx.commit().unwrap();
        tx.abort();
        assert!(tx.is_committed());
        assert!(dir.path().join("a").exists());
    }

    #[test]
    fn snapshot_restores_contents_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("existing.md");
        let absent = dir.path().join("absent.done");
        std::fs::write(&existing, "original").unwrap();

        let snapshot =
            create_transaction_snapshot(&[existing.clone(), absent.clone()]).unwrap();

        std::fs::write(&existing, "mutated").unwrap();
        std::fs::write(&absent, "should not survive").unwrap();

        restore_from_snapshot(&snapshot).unwrap();
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "original");
        assert!(!absent.exists());
    }

    #[test]
    fn snapshot_restore_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "v1").unwrap();
        let snapshot = create_transaction_snapshot(std::slice::from_ref(&path)).unwrap();
        std::fs::write(&path, "v2").unwrap();
        restore_from_snapshot(&snapshot).unwrap();
        restore_from_snapshot(&snapshot).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "v1");
    }
}
