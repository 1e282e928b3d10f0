//! Background compaction for the key-value engine.
//!
//! The compaction task runs asynchronously and performs one compaction pass
//! each time it is notified.
//!
//! # Design
//!
//! The task uses a `Weak<KeyValueDb>` to prevent reference cycles:
//! - The owner of the database holds the `Arc` and the `compaction_notify` signal
//! - The task holds a weak reference to the database
//! - When the database is dropped, `Weak::upgrade()` returns `None` and the task exits
//!
//! A pass is blocking file I/O, so it runs on tokio's blocking pool. The
//! cancellation token stops a running pass and ends the task.

use std::sync::{Arc, Weak};

use tokio::sync::Notify;

use crate::cancel::CancellationToken;
use crate::compactor::CompactionError;
use crate::db::KeyValueDb;

/// Spawn a background compaction task for a database.
///
/// The task waits for signals on `notify` and runs one compaction pass per
/// signal. If a pass relocated values, the task signals itself to check
/// whether another pass is worthwhile.
///
/// # Invariants
/// - Uses `Weak` reference to prevent reference cycles
/// - At most one pass runs at a time
/// - Exits cleanly when the database is dropped or `cancel` is cancelled
pub fn spawn_compaction_task(
    database: Weak<KeyValueDb>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        compaction_loop(database, notify, cancel).await;
    })
}

/// The main compaction loop.
async fn compaction_loop(database: Weak<KeyValueDb>, notify: Arc<Notify>, cancel: CancellationToken) {
    loop {
        notify.notified().await;
        if cancel.is_cancelled() {
            break;
        }

        let Some(db) = database.upgrade() else {
            break;
        };

        let pass_cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || db.compact(&pass_cancel)).await;

        match result {
            Ok(Ok(true)) => {
                tracing::info!("background compaction relocated values");
                notify.notify_one();
            }
            Ok(Ok(false)) => tracing::debug!("background compaction found little waste"),
            Ok(Err(CompactionError::Cancelled)) => {
                tracing::info!("background compaction cancelled");
                break;
            }
            Ok(Err(e)) => {
                // Compaction errors shouldn't crash the task; the next signal retries.
                tracing::error!("background compaction failed: {e}");
            }
            Err(e) => {
                tracing::error!("background compaction panicked: {e}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_database, test_config};
    use crate::files::FileCollection;
    use std::time::Duration;

    #[tokio::test]
    async fn test_compaction_task_exits_when_database_dropped() {
        let (db, _files) = memory_database(test_config()).expect("open db");
        let db = Arc::new(db);
        let notify = Arc::new(Notify::new());
        let handle = spawn_compaction_task(
            Arc::downgrade(&db),
            Arc::clone(&notify),
            CancellationToken::new(),
        );

        drop(db);
        notify.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(
            result.is_ok(),
            "compaction task should exit when database is dropped"
        );
    }

    #[tokio::test]
    async fn test_compaction_task_exits_when_cancelled() {
        let (db, _files) = memory_database(test_config()).expect("open db");
        let db = Arc::new(db);
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = spawn_compaction_task(Arc::downgrade(&db), Arc::clone(&notify), cancel.clone());

        cancel.cancel();
        notify.notify_one();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "compaction task should exit when cancelled");
        drop(db);
    }

    #[tokio::test]
    async fn test_compaction_task_compacts_on_signal() {
        let (db, files) = memory_database(test_config()).expect("open db");
        crate::testing::fill_and_overwrite(&db, 100, 2048).expect("fill");
        let db = Arc::new(db);
        let before = crate::testing::value_file_count(files.as_ref());
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let handle = spawn_compaction_task(Arc::downgrade(&db), Arc::clone(&notify), cancel.clone());

        notify.notify_one();
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if files.file_infos().values().any(|info| {
                info.kind == crate::files::FileKind::PureValues
            }) {
                compacted = true;
                break;
            }
        }

        cancel.cancel();
        notify.notify_one();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(compacted, "a pure value file should appear after the signal");
        assert!(before > 0);
        assert_eq!(crate::testing::read_all(&db).expect("read").len(), 100);
    }

    #[tokio::test]
    async fn test_log_rotation_wakes_compaction() {
        let (db, files) = memory_database(test_config()).expect("open");
        let db = Arc::new(db);
        let cancel = CancellationToken::new();
        let handle = spawn_compaction_task(Arc::downgrade(&db), db.compaction_notify(), cancel.clone());

        crate::testing::fill_and_overwrite(&db, 100, 2048).expect("fill");
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !files.purged_files().is_empty() {
                compacted = true;
                break;
            }
        }

        cancel.cancel();
        db.compaction_notify().notify_one();
        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(compacted, "rotating the log should trigger a compaction pass");
        assert_eq!(
            crate::testing::read_all(&db).expect("read"),
            crate::testing::expected_after_fill(100, 2048)
        );
    }
}
