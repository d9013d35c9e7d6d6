//! Transactional secret DAO on SQLite
//!
//! Every write runs its pre-check, mutation and event enqueue inside one
//! [`TxSession`]. Events reach the publisher only after the commit.

use crate::migrator::Migrator;
use crate::session::TxSession;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use credstore_core::config::DatabaseConfig;
use credstore_core::models::{decode_secure_json_data, encode_secure_json_data};
use credstore_core::{
    AddSecretCommand, DeleteSecretCommand, Error, EventPublisher, GetSecretQuery, GetSecretsQuery,
    Result, Secret, SecretEvent, SecretIdentifier, SecureJsonData, UpdateSecretCommand,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const SELECT_SECRET: &str =
    "SELECT id, org_id, entity_uid, secure_json_data, created, updated FROM secret";

#[derive(Debug, FromRow)]
struct SecretRow {
    id: i64,
    org_id: i64,
    entity_uid: String,
    secure_json_data: Option<String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TryFrom<SecretRow> for Secret {
    type Error = Error;

    fn try_from(row: SecretRow) -> Result<Self> {
        Ok(Secret {
            id: row.id,
            org_id: row.org_id,
            entity_uid: row.entity_uid,
            secure_json_data: decode_secure_json_data(row.secure_json_data.as_deref())?,
            created: row.created,
            updated: row.updated,
        })
    }
}

/// SQLite-backed secret store
#[derive(Clone)]
pub struct SqlStore {
    pool: SqlitePool,
    publisher: Arc<dyn EventPublisher>,
}

impl SqlStore {
    /// Open the pool described by `config` and bring the schema up to date
    pub async fn connect(config: &DatabaseConfig, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        config.validate()?;

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        // In-memory databases live as long as their connection
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let applied = Migrator::secret_store().run(&pool).await?;
        info!(
            max_connections = config.max_connections,
            migrations_applied = applied,
            "Secret store ready"
        );

        Ok(Self::new(pool, publisher))
    }

    /// Wrap an already migrated pool
    pub fn new(pool: SqlitePool, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { pool, publisher }
    }

    /// The connection pool shared by every operation
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query through the pool
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Number of secrets stored for `org_id`
    pub async fn count_secrets(&self, org_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM secret WHERE org_id = ?")
            .bind(org_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), fields(org_id = query.org_id))]
    pub async fn get_secret(&self, query: &GetSecretQuery) -> Result<Secret> {
        let identifier = query.identifier()?;
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut *conn, query.org_id, &identifier)
            .await?
            .ok_or(Error::NotFound)?
            .try_into()
    }

    /// An org's secrets in ascending id order
    #[instrument(skip(self), fields(org_id = query.org_id))]
    pub async fn get_secrets(&self, query: &GetSecretsQuery) -> Result<Vec<Secret>> {
        let sql = format!("{} WHERE org_id = ? ORDER BY id ASC LIMIT ?", SELECT_SECRET);
        // SQLite treats a negative LIMIT as unbounded
        let rows: Vec<SecretRow> = sqlx::query_as(&sql)
            .bind(query.org_id)
            .bind(query.limit().unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), "Listed secrets");
        rows.into_iter().map(Secret::try_from).collect()
    }

    /// Insert a secret holding `data`, the already encrypted form of the
    /// command's values
    #[instrument(skip(self, cmd, data), fields(org_id = cmd.org_id, entity_uid = %cmd.entity_uid))]
    pub async fn add_secret(&self, cmd: &AddSecretCommand, data: SecureJsonData) -> Result<Secret> {
        if cmd.org_id <= 0 {
            return Err(Error::IdentifierNotSet);
        }
        let column = encode_secure_json_data(&data)?;
        let entity_uid = cmd.entity_uid_or_default();

        let mut session = TxSession::begin(&self.pool).await?;

        if entity_uid_taken(session.conn(), cmd.org_id, entity_uid, None).await? {
            return Err(Error::EntityUidExists);
        }

        let created = now();
        let id = insert_secret(session.conn(), cmd.org_id, entity_uid, &column, created).await?;

        session.publish_after_commit(SecretEvent::created(id, entity_uid, cmd.org_id));
        session.commit(self.publisher.as_ref()).await?;

        info!(id, "Secret created");
        Ok(Secret {
            id,
            org_id: cmd.org_id,
            entity_uid: entity_uid.to_string(),
            secure_json_data: data,
            created,
            updated: created,
        })
    }

    /// Rewrite a secret's data. Selecting by id allows renaming the
    /// entity uid in the same write.
    #[instrument(skip(self, cmd, data), fields(org_id = cmd.org_id))]
    pub async fn update_secret(
        &self,
        cmd: &UpdateSecretCommand,
        data: SecureJsonData,
    ) -> Result<Secret> {
        let target = cmd.target()?;
        let column = encode_secure_json_data(&data)?;

        let mut session = TxSession::begin(&self.pool).await?;

        let existing = fetch_row(session.conn(), cmd.org_id, &target)
            .await?
            .ok_or(Error::NotFound)?;

        let entity_uid = match (&target, cmd.rename_to()) {
            (SecretIdentifier::Id(_), Some(uid)) => uid.to_string(),
            _ => existing.entity_uid.clone(),
        };
        if entity_uid != existing.entity_uid
            && entity_uid_taken(session.conn(), cmd.org_id, &entity_uid, Some(existing.id)).await?
        {
            return Err(Error::EntityUidExists);
        }

        let updated = next_updated(existing.updated);
        let result = sqlx::query(
            "UPDATE secret SET entity_uid = ?, secure_json_data = ?, updated = ? WHERE id = ? AND org_id = ?",
        )
        .bind(&entity_uid)
        .bind(&column)
        .bind(updated)
        .bind(existing.id)
        .bind(cmd.org_id)
        .execute(session.conn())
        .await
        .map_err(translate_unique_violation)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }

        session.publish_after_commit(SecretEvent::updated(existing.id, &entity_uid, cmd.org_id));
        session.commit(self.publisher.as_ref()).await?;

        info!(id = existing.id, %entity_uid, "Secret updated");
        Ok(Secret {
            id: existing.id,
            org_id: cmd.org_id,
            entity_uid,
            secure_json_data: data,
            created: existing.created,
            updated,
        })
    }

    /// Delete one secret, returning how many rows were removed (0 or 1).
    /// The deleted event is only published when a row was removed.
    #[instrument(skip(self), fields(org_id = cmd.org_id))]
    pub async fn delete_secret(&self, cmd: &DeleteSecretCommand) -> Result<u64> {
        let identifier = cmd.identifier()?;

        let mut session = TxSession::begin(&self.pool).await?;

        let Some(existing) = fetch_row(session.conn(), cmd.org_id, &identifier).await? else {
            debug!(%identifier, "Nothing to delete");
            session.rollback().await?;
            return Ok(0);
        };

        let deleted = sqlx::query("DELETE FROM secret WHERE id = ? AND org_id = ?")
            .bind(existing.id)
            .bind(cmd.org_id)
            .execute(session.conn())
            .await?
            .rows_affected();

        if deleted > 0 {
            session.publish_after_commit(SecretEvent::deleted(
                existing.id,
                &existing.entity_uid,
                cmd.org_id,
            ));
        }
        session.commit(self.publisher.as_ref()).await?;

        info!(id = existing.id, deleted, "Secret deleted");
        Ok(deleted)
    }
}

/// Store timestamps at microsecond precision so they survive a round trip
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// `updated` must change on every write, even within one clock tick
fn next_updated(previous: DateTime<Utc>) -> DateTime<Utc> {
    now().max(previous + Duration::microseconds(1))
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    org_id: i64,
    identifier: &SecretIdentifier,
) -> Result<Option<SecretRow>> {
    let row: Option<SecretRow> = match identifier {
        SecretIdentifier::EntityUid(uid) => {
            let sql = format!("{} WHERE org_id = ? AND entity_uid = ?", SELECT_SECRET);
            sqlx::query_as(&sql)
                .bind(org_id)
                .bind(uid)
                .fetch_optional(&mut *conn)
                .await?
        }
        SecretIdentifier::Id(id) => {
            let sql = format!("{} WHERE org_id = ? AND id = ?", SELECT_SECRET);
            sqlx::query_as(&sql)
                .bind(org_id)
                .bind(*id)
                .fetch_optional(&mut *conn)
                .await?
        }
    };
    Ok(row)
}

async fn entity_uid_taken(
    conn: &mut SqliteConnection,
    org_id: i64,
    entity_uid: &str,
    except_id: Option<i64>,
) -> Result<bool> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM secret WHERE org_id = ? AND entity_uid = ?")
            .bind(org_id)
            .bind(entity_uid)
            .fetch_optional(conn)
            .await?;
    Ok(existing.is_some_and(|id| Some(id) != except_id))
}

async fn insert_secret(
    conn: &mut SqliteConnection,
    org_id: i64,
    entity_uid: &str,
    column: &str,
    created: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO secret (org_id, entity_uid, secure_json_data, created, updated) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(org_id)
    .bind(entity_uid)
    .bind(column)
    .bind(created)
    .bind(created)
    .execute(conn)
    .await
    .map_err(translate_unique_violation)?;
    Ok(result.last_insert_rowid())
}

/// A write that lost the race past the pre-check still reports the
/// domain error
fn translate_unique_violation(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() && db_err.message().contains("entity_uid") {
            return Error::EntityUidExists;
        }
    }
    Error::Storage(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SecretEvent>>,
    }

    #[async_trait]
    impl EventPublisher for Recorder {
        async fn publish(&self, event: SecretEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().iter().map(SecretEvent::kind).collect()
        }
    }

    async fn memory_store() -> (SqlStore, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let store = SqlStore::connect(&DatabaseConfig::default(), recorder.clone())
            .await
            .unwrap();
        (store, recorder)
    }

    fn data(value: &[u8]) -> SecureJsonData {
        let mut data = SecureJsonData::new();
        data.insert("password".to_string(), value.to_vec());
        data
    }

    fn add_cmd(org_id: i64, uid: &str) -> AddSecretCommand {
        AddSecretCommand::new(org_id, uid, Default::default())
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (store, recorder) = memory_store().await;

        let added = store.add_secret(&add_cmd(1, "ds-a"), data(b"ct")).await.unwrap();
        assert!(added.id > 0);
        assert_eq!(added.created, added.updated);
        assert_eq!(recorder.kinds(), vec!["secret_created"]);

        let by_uid = store
            .get_secret(&GetSecretQuery::by_entity_uid(1, "ds-a"))
            .await
            .unwrap();
        assert_eq!(by_uid, added);

        let by_id = store.get_secret(&GetSecretQuery::by_id(1, added.id)).await.unwrap();
        assert_eq!(by_id, added);

        // scoped by org
        let other_org = store.get_secret(&GetSecretQuery::by_id(2, added.id)).await;
        assert!(matches!(other_org, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_add_defaults_entity_uid() {
        let (store, _) = memory_store().await;
        let added = store.add_secret(&add_cmd(1, ""), data(b"x")).await.unwrap();
        assert_eq!(added.entity_uid, "0");
    }

    #[tokio::test]
    async fn test_add_rejects_missing_org() {
        let (store, recorder) = memory_store().await;
        let result = store.add_secret(&add_cmd(0, "ds-a"), data(b"x")).await;
        assert!(matches!(result, Err(Error::IdentifierNotSet)));
        assert!(recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_entity_uid() {
        let (store, recorder) = memory_store().await;
        store.add_secret(&add_cmd(1, "ds-a"), data(b"1")).await.unwrap();

        let dup = store.add_secret(&add_cmd(1, "ds-a"), data(b"2")).await;
        assert!(matches!(dup, Err(Error::EntityUidExists)));

        // same uid in another org is fine
        store.add_secret(&add_cmd(2, "ds-a"), data(b"3")).await.unwrap();

        assert_eq!(store.count_secrets(1).await.unwrap(), 1);
        assert_eq!(recorder.kinds(), vec!["secret_created", "secret_created"]);
    }

    #[tokio::test]
    async fn test_insert_unique_violation_is_translated() {
        let (store, _) = memory_store().await;
        let mut conn = store.pool().acquire().await.unwrap();

        insert_secret(&mut *conn, 1, "ds-a", "{}", now()).await.unwrap();
        let err = insert_secret(&mut *conn, 1, "ds-a", "{}", now()).await.unwrap_err();
        assert!(matches!(err, Error::EntityUidExists));
    }

    #[tokio::test]
    async fn test_entity_uid_too_long() {
        let (store, recorder) = memory_store().await;
        let uid = "u".repeat(41);
        let err = store.add_secret(&add_cmd(1, &uid), data(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)), "got {err:?}");
        assert!(recorder.kinds().is_empty());

        let uid = "u".repeat(40);
        store.add_secret(&add_cmd(1, &uid), data(b"x")).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_secrets_order_and_limit() {
        let (store, _) = memory_store().await;
        for uid in ["c", "a", "b"] {
            store.add_secret(&add_cmd(1, uid), data(b"x")).await.unwrap();
        }
        store.add_secret(&add_cmd(2, "z"), data(b"x")).await.unwrap();

        let all = store.get_secrets(&GetSecretsQuery::new(1)).await.unwrap();
        let uids: Vec<&str> = all.iter().map(|s| s.entity_uid.as_str()).collect();
        assert_eq!(uids, vec!["c", "a", "b"]);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let limited = store
            .get_secrets(&GetSecretsQuery::new(1).with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let negative = store
            .get_secrets(&GetSecretsQuery::new(1).with_limit(-1))
            .await
            .unwrap();
        assert_eq!(negative.len(), 3);

        assert!(store
            .get_secrets(&GetSecretsQuery::new(9))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_by_entity_uid() {
        let (store, recorder) = memory_store().await;
        let added = store.add_secret(&add_cmd(1, "ds-a"), data(b"old")).await.unwrap();

        let cmd = UpdateSecretCommand::by_entity_uid(1, "ds-a", Default::default());
        let updated = store.update_secret(&cmd, data(b"new")).await.unwrap();

        assert_eq!(updated.id, added.id);
        assert_eq!(updated.created, added.created);
        assert!(updated.updated > added.updated);
        assert_eq!(updated.secure_json_data, data(b"new"));

        let fetched = store.get_secret(&GetSecretQuery::by_id(1, added.id)).await.unwrap();
        assert_eq!(fetched, updated);
        assert_eq!(recorder.kinds(), vec!["secret_created", "secret_updated"]);
    }

    #[tokio::test]
    async fn test_back_to_back_updates_change_timestamp() {
        let (store, _) = memory_store().await;
        let added = store.add_secret(&add_cmd(1, "ds-a"), data(b"0")).await.unwrap();

        let cmd = UpdateSecretCommand::by_id(1, added.id, Default::default());
        let first = store.update_secret(&cmd, data(b"1")).await.unwrap();
        let second = store.update_secret(&cmd, data(b"2")).await.unwrap();
        assert!(added.updated < first.updated);
        assert!(first.updated < second.updated);
    }

    #[tokio::test]
    async fn test_update_rename_by_id() {
        let (store, recorder) = memory_store().await;
        let a = store.add_secret(&add_cmd(1, "ds-a"), data(b"a")).await.unwrap();
        store.add_secret(&add_cmd(1, "ds-b"), data(b"b")).await.unwrap();

        let mut cmd = UpdateSecretCommand::by_id(1, a.id, Default::default());
        cmd.entity_uid = Some("ds-b".to_string());
        let err = store.update_secret(&cmd, data(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::EntityUidExists));

        cmd.entity_uid = Some("ds-c".to_string());
        let renamed = store.update_secret(&cmd, data(b"x")).await.unwrap();
        assert_eq!(renamed.id, a.id);
        assert_eq!(renamed.entity_uid, "ds-c");

        let missing = store.get_secret(&GetSecretQuery::by_entity_uid(1, "ds-a")).await;
        assert!(matches!(missing, Err(Error::NotFound)));

        let kinds = recorder.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "secret_updated").count(), 1);
    }

    #[tokio::test]
    async fn test_update_missing() {
        let (store, recorder) = memory_store().await;

        let cmd = UpdateSecretCommand::by_id(1, 404, Default::default());
        assert!(matches!(store.update_secret(&cmd, data(b"x")).await, Err(Error::NotFound)));

        let cmd = UpdateSecretCommand::by_entity_uid(1, "nope", Default::default());
        assert!(matches!(store.update_secret(&cmd, data(b"x")).await, Err(Error::NotFound)));

        let cmd = UpdateSecretCommand::by_entity_uid(0, "nope", Default::default());
        assert!(matches!(
            store.update_secret(&cmd, data(b"x")).await,
            Err(Error::IdentifierNotSet)
        ));
        assert!(recorder.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_delete_emits_only_when_removed() {
        let (store, recorder) = memory_store().await;
        let added = store.add_secret(&add_cmd(1, "ds-a"), data(b"x")).await.unwrap();

        let missing = store
            .delete_secret(&DeleteSecretCommand::by_entity_uid(1, "nope"))
            .await
            .unwrap();
        assert_eq!(missing, 0);
        assert_eq!(recorder.kinds(), vec!["secret_created"]);

        let deleted = store
            .delete_secret(&DeleteSecretCommand::by_entity_uid(1, "ds-a"))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        let payload = events[1].payload();
        assert_eq!(events[1].kind(), "secret_deleted");
        assert_eq!(payload.id, added.id);
        assert_eq!(payload.entity_uid, "ds-a");
        assert_eq!(payload.org_id, 1);

        let gone = store.get_secret(&GetSecretQuery::by_id(1, added.id)).await;
        assert!(matches!(gone, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn test_identifier_rule_before_storage() {
        let (store, _) = memory_store().await;
        store.pool().close().await;

        // A closed pool would fail any query; the rule fires first.
        let get = store.get_secret(&GetSecretQuery::default()).await;
        assert!(matches!(get, Err(Error::IdentifierNotSet)));

        let delete = store
            .delete_secret(&DeleteSecretCommand {
                org_id: 1,
                ..Default::default()
            })
            .await;
        assert!(matches!(delete, Err(Error::IdentifierNotSet)));
    }

    #[tokio::test]
    async fn test_null_secure_json_data() {
        let (store, _) = memory_store().await;
        sqlx::query(
            "INSERT INTO secret (org_id, entity_uid, secure_json_data, created, updated) VALUES (1, 'raw', NULL, ?, ?)",
        )
        .bind(now())
        .bind(now())
        .execute(store.pool())
        .await
        .unwrap();

        let secret = store
            .get_secret(&GetSecretQuery::by_entity_uid(1, "raw"))
            .await
            .unwrap();
        assert!(secret.secure_json_data.is_empty());
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("secrets.db").display());
        let config = DatabaseConfig::with_url(&url);

        let added = {
            let store = SqlStore::connect(&config, Arc::new(Recorder::default()))
                .await
                .unwrap();
            let added = store.add_secret(&add_cmd(1, "ds-a"), data(b"x")).await.unwrap();
            store.pool().close().await;
            added
        };

        let store = SqlStore::connect(&config, Arc::new(Recorder::default()))
            .await
            .unwrap();
        store.health_check().await.unwrap();
        let fetched = store.get_secret(&GetSecretQuery::by_id(1, added.id)).await.unwrap();
        assert_eq!(fetched, added);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_adds_on_connection_pool() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            max_connections: 4,
            ..DatabaseConfig::with_url(format!(
                "sqlite://{}",
                dir.path().join("race.db").display()
            ))
        };
        let recorder = Arc::new(Recorder::default());
        let store = SqlStore::connect(&config, recorder.clone()).await.unwrap();

        for round in 0..10 {
            let uid = format!("ds-{round}");
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let cmd = add_cmd(1, &uid);
                    tokio::spawn(async move { store.add_secret(&cmd, data(b"ct")).await })
                })
                .collect();

            let mut created = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => created += 1,
                    Err(Error::EntityUidExists) => {}
                    Err(other) => panic!("round {round}: unexpected error: {other}"),
                }
            }
            assert_eq!(created, 1, "round {round}");
        }

        assert_eq!(store.count_secrets(1).await.unwrap(), 10);
        assert_eq!(recorder.kinds().len(), 10);
    }

    #[tokio::test]
    async fn test_connect_rejects_pooled_in_memory_database() {
        let config = DatabaseConfig {
            max_connections: 2,
            ..DatabaseConfig::default()
        };
        let result = SqlStore::connect(&config, Arc::new(Recorder::default())).await;
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}
