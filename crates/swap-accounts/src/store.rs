use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task::JoinHandle;

use crate::model::{now_unix_ms, Account, AccountStatus, Credentials, Usage};
use crate::AccountError;

const ACTIVE_ACCOUNT_KEY: &str = "active_account";

/// Columns added after the first schema revision. Older files get them via
/// `ALTER TABLE ... ADD COLUMN`.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("status", "TEXT NOT NULL DEFAULT 'active_candidate'"),
    ("requests_served", "INTEGER NOT NULL DEFAULT 0"),
    ("last_used_at_ms", "INTEGER"),
    ("limit_info", "TEXT NOT NULL DEFAULT 'Not updated'"),
];

const ACCOUNT_COLUMNS: &str = "id, label, credentials_json, created_at_ms, updated_at_ms, \
     status, requests_served, last_used_at_ms, limit_info";

/// Records that an account served a request. Must not block on I/O.
pub trait UsageRecorder: Send + Sync {
    fn record_use(&self, account_id: &str, at_ms: u64);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PendingUsage {
    requests: u64,
    last_used_at_ms: u64,
}

/// SQLite-backed account store. Cloning shares the connection and the
/// pending usage counters.
#[derive(Clone)]
pub struct AccountStore {
    conn: Arc<Mutex<Connection>>,
    pending: Arc<Mutex<HashMap<String, PendingUsage>>>,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("pending_accounts", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl AccountStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AccountError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|error| {
                    AccountError::Task(format!(
                        "cannot create {}: {error}",
                        parent.display()
                    ))
                })?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, AccountError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(connection: Connection) -> Result<Self, AccountError> {
        let store = Self {
            conn: Arc::new(Mutex::new(connection)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), AccountError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS accounts (
                    id TEXT PRIMARY KEY,
                    label TEXT NOT NULL,
                    credentials_json TEXT NOT NULL,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS proxy_settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                "#,
            )?;

            let existing = {
                let mut stmt = conn.prepare("PRAGMA table_info(accounts)")?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<Result<Vec<_>, _>>()?;
                names
            };
            for (column, definition) in ADDITIVE_COLUMNS {
                if !existing.iter().any(|name| name.as_str() == *column) {
                    conn.execute_batch(&format!(
                        "ALTER TABLE accounts ADD COLUMN {column} {definition};"
                    ))?;
                    tracing::info!(column, "migrated accounts table");
                }
            }
            conn.execute_batch(
                "CREATE INDEX IF NOT EXISTS idx_accounts_created_at ON accounts(created_at_ms, id);",
            )?;
            Ok(())
        })
    }

    /// Inserts or replaces the account with the same id. A replaced account
    /// keeps its original creation time and usage counters; usage is only
    /// written by [`AccountStore::flush_usage`].
    pub fn upsert(&self, account: &Account) -> Result<(), AccountError> {
        account.validate()?;
        let credentials_json = serde_json::to_string(&account.credentials).map_err(|error| {
            AccountError::Validation(format!("credentials cannot be encoded: {error}"))
        })?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO accounts (
                    id, label, credentials_json, created_at_ms, updated_at_ms,
                    status, requests_served, last_used_at_ms, limit_info
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    label = excluded.label,
                    credentials_json = excluded.credentials_json,
                    updated_at_ms = excluded.updated_at_ms,
                    status = excluded.status,
                    limit_info = excluded.limit_info",
                params![
                    account.id,
                    account.label,
                    credentials_json,
                    account.created_at_ms as i64,
                    account.updated_at_ms.max(account.created_at_ms) as i64,
                    account.status.as_str(),
                    account.usage.requests_served as i64,
                    account.usage.last_used_at_ms.map(|value| value as i64),
                    account.limit_info,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Account, AccountError> {
        let account = self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
                read_account_row,
            )
            .optional()
            .map_err(AccountError::from)
        })?;
        let account = account.ok_or_else(|| AccountError::NotFound(id.to_string()))??;
        Ok(self.with_pending_usage(account))
    }

    /// All accounts ordered by creation time, then id.
    pub fn list(&self) -> Result<Vec<Account>, AccountError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY created_at_ms ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map([], read_account_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|row| row.map(|account| self.with_pending_usage(account)))
            .collect()
    }

    /// Deletes the account. When it was the persisted active selection the
    /// selection is cleared in the same transaction; the return value says
    /// whether that happened.
    pub fn remove(&self, id: &str) -> Result<bool, AccountError> {
        let was_active = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let deleted = tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(AccountError::NotFound(id.to_string()));
            }
            let cleared = tx.execute(
                "DELETE FROM proxy_settings WHERE key = ?1 AND value = ?2",
                params![ACTIVE_ACCOUNT_KEY, id],
            )?;
            tx.commit()?;
            Ok(cleared > 0)
        })?;
        self.pending.lock().remove(id);
        Ok(was_active)
    }

    pub fn set_status(&self, id: &str, status: AccountStatus) -> Result<(), AccountError> {
        self.update_one(
            id,
            "UPDATE accounts SET status = ?2, updated_at_ms = ?3 WHERE id = ?1",
            status.as_str().to_string(),
        )
    }

    pub fn update_credentials(
        &self,
        id: &str,
        credentials: &Credentials,
    ) -> Result<(), AccountError> {
        if credentials.access_token.trim().is_empty() {
            return Err(AccountError::Validation(
                "credentials.access_token must not be empty".to_string(),
            ));
        }
        let encoded = serde_json::to_string(credentials).map_err(|error| {
            AccountError::Validation(format!("credentials cannot be encoded: {error}"))
        })?;
        self.update_one(
            id,
            "UPDATE accounts SET credentials_json = ?2, updated_at_ms = ?3 WHERE id = ?1",
            encoded,
        )
    }

    pub fn set_limit_info(&self, id: &str, limit_info: &str) -> Result<(), AccountError> {
        self.update_one(
            id,
            "UPDATE accounts SET limit_info = ?2, updated_at_ms = ?3 WHERE id = ?1",
            limit_info.to_string(),
        )
    }

    pub fn active_account_id(&self) -> Result<Option<String>, AccountError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM proxy_settings WHERE key = ?1",
                params![ACTIVE_ACCOUNT_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(AccountError::from)
        })
    }

    pub fn set_active_account_id(&self, id: Option<&str>) -> Result<(), AccountError> {
        self.with_conn(|conn| {
            match id {
                Some(id) => conn.execute(
                    "INSERT INTO proxy_settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![ACTIVE_ACCOUNT_KEY, id],
                )?,
                None => conn.execute(
                    "DELETE FROM proxy_settings WHERE key = ?1",
                    params![ACTIVE_ACCOUNT_KEY],
                )?,
            };
            Ok(())
        })
    }

    /// Writes every pending usage delta in one transaction and returns how
    /// many accounts were touched. Deltas for accounts that no longer exist
    /// are dropped.
    pub fn flush_usage(&self) -> Result<usize, AccountError> {
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return Ok(0);
        }

        let result = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut touched = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE accounts SET
                        requests_served = requests_served + ?2,
                        last_used_at_ms = MAX(COALESCE(last_used_at_ms, 0), ?3)
                     WHERE id = ?1",
                )?;
                for (id, usage) in &drained {
                    touched += stmt.execute(params![
                        id,
                        usage.requests as i64,
                        usage.last_used_at_ms as i64
                    ])?;
                }
            }
            tx.commit()?;
            Ok(touched)
        });

        if result.is_err() {
            let mut pending = self.pending.lock();
            for (id, usage) in drained {
                merge_pending(pending.entry(id).or_default(), usage);
            }
        }
        result
    }

    fn update_one(&self, id: &str, sql: &str, value: String) -> Result<(), AccountError> {
        let updated = self.with_conn(|conn| {
            Ok(conn.execute(sql, params![id, value, now_unix_ms() as i64])?)
        })?;
        if updated == 0 {
            return Err(AccountError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn with_pending_usage(&self, mut account: Account) -> Account {
        if let Some(pending) = self.pending.lock().get(&account.id) {
            account.usage.requests_served += pending.requests;
            account.usage.last_used_at_ms = Some(
                account
                    .usage
                    .last_used_at_ms
                    .unwrap_or(0)
                    .max(pending.last_used_at_ms),
            );
        }
        account
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, AccountError>,
    ) -> Result<T, AccountError> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

impl UsageRecorder for AccountStore {
    fn record_use(&self, account_id: &str, at_ms: u64) {
        let mut pending = self.pending.lock();
        merge_pending(
            pending.entry(account_id.to_string()).or_default(),
            PendingUsage {
                requests: 1,
                last_used_at_ms: at_ms,
            },
        );
    }
}

/// Flushes pending usage every `interval` on a blocking worker until the
/// handle is aborted.
pub fn spawn_usage_flusher(store: AccountStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let flushing = store.clone();
            match tokio::task::spawn_blocking(move || flushing.flush_usage()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(touched)) => tracing::debug!(touched, "flushed account usage"),
                Ok(Err(error)) => tracing::warn!(error = %error, "usage flush failed"),
                Err(error) => tracing::warn!(error = %error, "usage flush task failed"),
            }
        }
    })
}

fn merge_pending(target: &mut PendingUsage, delta: PendingUsage) {
    target.requests += delta.requests;
    target.last_used_at_ms = target.last_used_at_ms.max(delta.last_used_at_ms);
}

/// Maps one row. The outer error is SQLite's, the inner one reports a record
/// whose stored fields cannot be decoded.
fn read_account_row(row: &Row<'_>) -> rusqlite::Result<Result<Account, AccountError>> {
    let id: String = row.get(0)?;
    let label: String = row.get(1)?;
    let credentials_json: String = row.get(2)?;
    let created_at_ms: i64 = row.get(3)?;
    let updated_at_ms: i64 = row.get(4)?;
    let status_text: String = row.get(5)?;
    let requests_served: i64 = row.get(6)?;
    let last_used_at_ms: Option<i64> = row.get(7)?;
    let limit_info: String = row.get(8)?;

    let credentials = match serde_json::from_str::<Credentials>(&credentials_json) {
        Ok(credentials) => credentials,
        Err(error) => {
            return Ok(Err(AccountError::Corrupt {
                id,
                detail: error.to_string(),
            }))
        }
    };
    let Some(status) = AccountStatus::parse(&status_text) else {
        return Ok(Err(AccountError::Corrupt {
            id,
            detail: format!("unknown status {status_text:?}"),
        }));
    };

    Ok(Ok(Account {
        id,
        label,
        credentials,
        created_at_ms: created_at_ms.max(0) as u64,
        updated_at_ms: updated_at_ms.max(0) as u64,
        status,
        usage: Usage {
            requests_served: requests_served.max(0) as u64,
            last_used_at_ms: last_used_at_ms.map(|value| value.max(0) as u64),
        },
        limit_info,
    }))
}
