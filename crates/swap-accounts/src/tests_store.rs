use rusqlite::Connection;

use super::{AccountStore, UsageRecorder};
use crate::model::{Account, AccountStatus, Credentials, DEFAULT_LIMIT_INFO};
use crate::AccountError;

fn account(id: &str, created_at_ms: u64) -> Account {
    let mut account = Account::new(id, format!("{id}@example.com"), Credentials::bearer(format!("{id}-token")));
    account.created_at_ms = created_at_ms;
    account.updated_at_ms = created_at_ms;
    account
}

#[test]
fn upsert_rejects_invalid_accounts() {
    let store = AccountStore::in_memory().expect("store");
    let mut invalid = account("a", 1);
    invalid.credentials.access_token.clear();
    assert!(matches!(store.upsert(&invalid), Err(AccountError::Validation(_))));
    assert!(store.list().expect("list").is_empty());
}

#[test]
fn upsert_replaces_by_id_and_keeps_creation_time() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 100)).expect("insert");

    let mut replacement = account("a", 500);
    replacement.label = "renamed".to_string();
    store.upsert(&replacement).expect("replace");

    let stored = store.get("a").expect("get");
    assert_eq!(stored.label, "renamed");
    assert_eq!(stored.created_at_ms, 100);
    assert_eq!(stored.limit_info, DEFAULT_LIMIT_INFO);
    assert_eq!(store.list().expect("list").len(), 1);
}

#[test]
fn list_orders_by_creation_then_id() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("c", 20)).expect("c");
    store.upsert(&account("b", 10)).expect("b");
    store.upsert(&account("a", 20)).expect("a");
    let ids: Vec<String> = store
        .list()
        .expect("list")
        .into_iter()
        .map(|account| account.id)
        .collect();
    assert_eq!(ids, ["b", "a", "c"]);
}

#[test]
fn missing_accounts_report_not_found() {
    let store = AccountStore::in_memory().expect("store");
    assert!(store.get("nope").expect_err("get").is_not_found());
    assert!(store.remove("nope").expect_err("remove").is_not_found());
    assert!(store
        .set_status("nope", AccountStatus::Disabled)
        .expect_err("status")
        .is_not_found());
    assert!(store
        .update_credentials("nope", &Credentials::bearer("t"))
        .expect_err("credentials")
        .is_not_found());
}

#[test]
fn remove_clears_persisted_selection_only_for_that_account() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 1)).expect("a");
    store.upsert(&account("b", 2)).expect("b");
    store.set_active_account_id(Some("a")).expect("select a");

    assert!(!store.remove("b").expect("remove b"));
    assert_eq!(store.active_account_id().expect("read").as_deref(), Some("a"));

    assert!(store.remove("a").expect("remove a"));
    assert_eq!(store.active_account_id().expect("read"), None);
}

#[test]
fn usage_is_visible_before_and_after_flush() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 1)).expect("a");

    store.record_use("a", 1_000);
    store.record_use("a", 3_000);
    store.record_use("a", 2_000);
    store.record_use("gone", 5_000);

    let pending = store.get("a").expect("get");
    assert_eq!(pending.usage.requests_served, 3);
    assert_eq!(pending.usage.last_used_at_ms, Some(3_000));

    assert_eq!(store.flush_usage().expect("flush"), 1);
    assert_eq!(store.flush_usage().expect("empty flush"), 0);
    let flushed = store.get("a").expect("get");
    assert_eq!(flushed.usage.requests_served, 3);
    assert_eq!(flushed.usage.last_used_at_ms, Some(3_000));

    store.record_use("a", 2_500);
    store.flush_usage().expect("flush");
    let again = store.get("a").expect("get");
    assert_eq!(again.usage.requests_served, 4);
    assert_eq!(again.usage.last_used_at_ms, Some(3_000));
}

#[test]
fn replacing_an_account_keeps_usage_counters() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 1)).expect("a");

    store.record_use("a", 1_000);
    let mut edited = store.get("a").expect("get");
    assert_eq!(edited.usage.requests_served, 1);
    edited.label = "renamed".to_string();
    store.upsert(&edited).expect("replace with pending usage folded in");
    store.flush_usage().expect("flush");
    let stored = store.get("a").expect("get");
    assert_eq!(stored.label, "renamed");
    assert_eq!(stored.usage.requests_served, 1);

    store.upsert(&account("a", 1)).expect("replace with zeroed counters");
    let stored = store.get("a").expect("get");
    assert_eq!(stored.usage.requests_served, 1);
    assert_eq!(stored.usage.last_used_at_ms, Some(1_000));
}

#[test]
fn credential_and_status_updates_persist() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 1)).expect("a");

    let mut credentials = Credentials::bearer("new-token");
    credentials.refresh_token = Some("refresh".to_string());
    store.update_credentials("a", &credentials).expect("credentials");
    store
        .set_status("a", AccountStatus::BlockedByUpstream)
        .expect("status");
    store.set_limit_info("a", "120/150").expect("limit");

    let stored = store.get("a").expect("get");
    assert_eq!(stored.credentials, credentials);
    assert_eq!(stored.status, AccountStatus::BlockedByUpstream);
    assert_eq!(stored.limit_info, "120/150");
    assert!(matches!(
        store.update_credentials("a", &Credentials::bearer("")),
        Err(AccountError::Validation(_))
    ));
}

#[test]
fn reopening_a_file_keeps_accounts_and_selection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("accounts.db");
    {
        let store = AccountStore::open(&path).expect("open");
        store.upsert(&account("a", 1)).expect("a");
        store.set_active_account_id(Some("a")).expect("select");
        store.record_use("a", 42);
        store.flush_usage().expect("flush");
    }
    let store = AccountStore::open(&path).expect("reopen");
    let stored = store.get("a").expect("get");
    assert_eq!(stored.usage.requests_served, 1);
    assert_eq!(store.active_account_id().expect("read").as_deref(), Some("a"));
}

#[test]
fn opening_an_old_file_adds_missing_columns() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("accounts.db");
    {
        let conn = Connection::open(&path).expect("raw open");
        conn.execute_batch(
            r#"
            CREATE TABLE accounts (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL,
                credentials_json TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            INSERT INTO accounts VALUES ('old', 'old@example.com', '{"access_token":"legacy"}', 7, 7);
            "#,
        )
        .expect("legacy schema");
    }

    let store = AccountStore::open(&path).expect("migrate");
    let migrated = store.get("old").expect("get");
    assert_eq!(migrated.credentials.access_token, "legacy");
    assert_eq!(migrated.status, AccountStatus::ActiveCandidate);
    assert_eq!(migrated.usage.requests_served, 0);
    assert_eq!(migrated.usage.last_used_at_ms, None);
    assert_eq!(migrated.limit_info, DEFAULT_LIMIT_INFO);

    AccountStore::open(&path).expect("second open is a no-op");
}

#[test]
fn undecodable_rows_are_reported_as_corrupt() {
    let store = AccountStore::in_memory().expect("store");
    store.upsert(&account("a", 1)).expect("a");
    store
        .with_conn(|conn| {
            conn.execute(
                "UPDATE accounts SET credentials_json = 'not json' WHERE id = 'a'",
                [],
            )?;
            Ok(())
        })
        .expect("corrupt row");
    assert!(matches!(store.get("a"), Err(AccountError::Corrupt { .. })));
}
