//! Transaction session with post-commit event delivery

use credstore_core::{EventPublisher, Result, SecretEvent};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, warn};

/// Take the write lock at `BEGIN`. A deferred transaction that reads before
/// writing cannot upgrade while another connection holds the lock, and
/// SQLite fails it with `SQLITE_BUSY` without consulting the busy timeout.
pub(crate) const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

/// A database transaction plus the events it will publish once committed.
///
/// Dropping the session without calling [`TxSession::commit`] rolls the
/// transaction back and discards the queued events.
pub struct TxSession {
    tx: Transaction<'static, Sqlite>,
    events: Vec<SecretEvent>,
}

impl TxSession {
    /// Open a write transaction. Concurrent sessions queue on the busy
    /// timeout instead of failing.
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            tx: pool.begin_with(BEGIN_WRITE).await?,
            events: Vec::new(),
        })
    }

    /// The transaction's connection
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    /// Queue an event for delivery after a successful commit
    pub fn publish_after_commit(&mut self, event: SecretEvent) {
        self.events.push(event);
    }

    pub fn pending_events(&self) -> &[SecretEvent] {
        &self.events
    }

    /// Commit, then publish queued events in order. Publish failures are
    /// logged and do not undo the commit.
    pub async fn commit(self, publisher: &dyn EventPublisher) -> Result<()> {
        let Self { tx, events } = self;
        tx.commit().await?;

        for event in events {
            let kind = event.kind();
            let id = event.payload().id;
            if let Err(e) = publisher.publish(event).await {
                warn!(event = kind, id, error = %e, "Failed to publish event after commit");
            }
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        if !self.events.is_empty() {
            debug!(discarded = self.events.len(), "Rolling back, discarding events");
        }
        self.tx.rollback().await?;
        Ok(())
    }
}
