use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::model::{Account, AccountStatus};
use crate::store::AccountStore;
use crate::AccountError;

/// The credentials an exchange is rewritten with. An exchange takes one
/// snapshot at dispatch and never reads the selection again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub account_id: String,
    pub label: String,
    pub access_token: String,
    /// Increases with every published selection.
    pub generation: u64,
}

/// Owns the process-wide active account selection.
///
/// Readers clone an `Arc` under a read lock. Writers are serialized by a
/// separate gate so the store I/O of a switch happens before the selection
/// lock is taken, and the lock is held only for the pointer swap.
pub struct SwitchCoordinator {
    store: AccountStore,
    active: RwLock<Option<Arc<ActiveSnapshot>>>,
    switch_gate: Mutex<()>,
    generation: AtomicU64,
}

impl std::fmt::Debug for SwitchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchCoordinator")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

impl SwitchCoordinator {
    pub fn new(store: AccountStore) -> Self {
        Self {
            store,
            active: RwLock::new(None),
            switch_gate: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Creates a coordinator and restores the persisted selection.
    pub fn restored(store: AccountStore) -> Result<Self, AccountError> {
        let coordinator = Self::new(store);
        coordinator.restore()?;
        Ok(coordinator)
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    pub fn current(&self) -> Option<String> {
        self.active
            .read()
            .as_ref()
            .map(|snapshot| snapshot.account_id.clone())
    }

    pub fn snapshot(&self) -> Option<Arc<ActiveSnapshot>> {
        self.active.read().clone()
    }

    /// Makes `id` the active account. Exchanges dispatched after this returns
    /// use the new credentials; on error the selection is unchanged.
    pub fn switch_to(&self, id: &str) -> Result<Arc<ActiveSnapshot>, AccountError> {
        let _gate = self.switch_gate.lock();
        let account = self.store.get(id)?;
        ensure_selectable(&account)?;
        self.store.set_active_account_id(Some(&account.id))?;
        let snapshot = self.publish(&account);
        tracing::info!(
            account_id = %snapshot.account_id,
            generation = snapshot.generation,
            "switched active account"
        );
        Ok(snapshot)
    }

    pub fn clear(&self) -> Result<(), AccountError> {
        let _gate = self.switch_gate.lock();
        self.store.set_active_account_id(None)?;
        *self.active.write() = None;
        tracing::info!("cleared active account");
        Ok(())
    }

    /// Removes the account from the store, clearing the selection when it
    /// pointed at it.
    pub fn remove(&self, id: &str) -> Result<(), AccountError> {
        let _gate = self.switch_gate.lock();
        self.store.remove(id)?;
        if self.clear_if_active(id) {
            tracing::info!(account_id = %id, "removed active account; selection cleared");
        }
        Ok(())
    }

    /// Marks the account blocked by the upstream. Returns whether it was the
    /// active selection, which is then cleared.
    pub fn block_active(&self, id: &str) -> Result<bool, AccountError> {
        let _gate = self.switch_gate.lock();
        self.store.set_status(id, AccountStatus::BlockedByUpstream)?;
        let was_active = self.current().as_deref() == Some(id);
        if was_active {
            self.store.set_active_account_id(None)?;
            self.clear_if_active(id);
        }
        tracing::warn!(account_id = %id, was_active, "account blocked by upstream");
        Ok(was_active)
    }

    /// Publishes refreshed credentials when `account` is still the active
    /// selection. Returns whether a new snapshot was published.
    pub fn republish(&self, account: &Account) -> bool {
        let _gate = self.switch_gate.lock();
        if self.current().as_deref() != Some(account.id.as_str()) {
            return false;
        }
        let snapshot = self.publish(account);
        tracing::debug!(
            account_id = %snapshot.account_id,
            generation = snapshot.generation,
            "republished active account credentials"
        );
        true
    }

    /// Reloads the persisted selection. A missing or unselectable account
    /// clears it.
    pub fn restore(&self) -> Result<Option<Arc<ActiveSnapshot>>, AccountError> {
        let _gate = self.switch_gate.lock();
        self.restore_locked()
    }

    /// Adopts a selection persisted by another process, including new
    /// credentials stored for the account that is already active. Returns
    /// whether the published selection changed.
    pub fn follow_store(&self) -> Result<bool, AccountError> {
        let _gate = self.switch_gate.lock();
        let persisted = self.store.active_account_id()?;
        match (persisted.as_deref(), self.snapshot()) {
            (None, None) => return Ok(false),
            (Some(id), Some(current)) if id == current.account_id => {
                match self.store.get(id) {
                    Ok(account) if account.status.is_selectable() => {
                        if account.credentials.access_token == current.access_token
                            && account.label == current.label
                        {
                            return Ok(false);
                        }
                        let snapshot = self.publish(&account);
                        tracing::info!(
                            account_id = %snapshot.account_id,
                            generation = snapshot.generation,
                            "followed persisted account credentials"
                        );
                        return Ok(true);
                    }
                    Ok(_) | Err(AccountError::NotFound(_)) => {}
                    Err(error) => return Err(error),
                }
            }
            _ => {}
        }
        let restored = self.restore_locked()?;
        tracing::info!(
            account_id = restored.as_ref().map(|snapshot| snapshot.account_id.as_str()),
            "followed persisted account selection"
        );
        Ok(true)
    }

    fn restore_locked(&self) -> Result<Option<Arc<ActiveSnapshot>>, AccountError> {
        let Some(id) = self.store.active_account_id()? else {
            *self.active.write() = None;
            return Ok(None);
        };
        let account = match self.store.get(&id) {
            Ok(account) => account,
            Err(AccountError::NotFound(_)) => {
                tracing::warn!(account_id = %id, "persisted active account no longer exists");
                self.store.set_active_account_id(None)?;
                *self.active.write() = None;
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        if let Err(error) = ensure_selectable(&account) {
            tracing::warn!(account_id = %id, error = %error, "persisted active account is unavailable");
            self.store.set_active_account_id(None)?;
            *self.active.write() = None;
            return Ok(None);
        }
        Ok(Some(self.publish(&account)))
    }

    fn publish(&self, account: &Account) -> Arc<ActiveSnapshot> {
        let snapshot = Arc::new(ActiveSnapshot {
            account_id: account.id.clone(),
            label: account.label.clone(),
            access_token: account.credentials.access_token.clone(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
        });
        *self.active.write() = Some(Arc::clone(&snapshot));
        snapshot
    }

    fn clear_if_active(&self, id: &str) -> bool {
        let mut active = self.active.write();
        if active.as_ref().is_some_and(|snapshot| snapshot.account_id == id) {
            *active = None;
            return true;
        }
        false
    }
}

fn ensure_selectable(account: &Account) -> Result<(), AccountError> {
    if account.status.is_selectable() {
        return Ok(());
    }
    Err(AccountError::Unavailable {
        id: account.id.clone(),
        status: account.status,
    })
}

#[cfg(test)]
mod tests {
    use super::SwitchCoordinator;
    use crate::model::{Account, AccountStatus, Credentials};
    use crate::store::AccountStore;
    use crate::AccountError;

    fn seeded_store() -> AccountStore {
        let store = AccountStore::in_memory().expect("store");
        for (id, token) in [("a", "token-a"), ("b", "token-b")] {
            store
                .upsert(&Account::new(id, format!("{id}@example.com"), Credentials::bearer(token)))
                .expect("upsert");
        }
        store
    }

    #[test]
    fn switch_publishes_snapshot_and_persists_selection() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        assert_eq!(coordinator.current(), None);

        let first = coordinator.switch_to("a").expect("switch to a");
        let second = coordinator.switch_to("b").expect("switch to b");
        assert_eq!(second.access_token, "token-b");
        assert!(second.generation > first.generation);
        assert_eq!(coordinator.current().as_deref(), Some("b"));
        assert_eq!(store.active_account_id().expect("read").as_deref(), Some("b"));
    }

    #[test]
    fn failed_switch_leaves_selection_untouched() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        coordinator.switch_to("a").expect("switch to a");

        let error = coordinator.switch_to("missing").expect_err("unknown id");
        assert!(error.is_not_found());

        store
            .set_status("b", AccountStatus::BlockedByUpstream)
            .expect("block b");
        let error = coordinator.switch_to("b").expect_err("blocked account");
        assert!(matches!(error, AccountError::Unavailable { .. }));
        assert_eq!(coordinator.current().as_deref(), Some("a"));
    }

    #[test]
    fn held_snapshot_survives_a_switch() {
        let coordinator = SwitchCoordinator::new(seeded_store());
        coordinator.switch_to("a").expect("switch to a");
        let in_flight = coordinator.snapshot().expect("snapshot");
        coordinator.switch_to("b").expect("switch to b");
        assert_eq!(in_flight.access_token, "token-a");
        assert_eq!(
            coordinator.snapshot().map(|s| s.access_token.clone()).as_deref(),
            Some("token-b")
        );
    }

    #[test]
    fn removing_the_active_account_clears_selection() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        coordinator.switch_to("a").expect("switch to a");

        coordinator.remove("a").expect("remove a");
        assert_eq!(coordinator.current(), None);
        assert_eq!(store.active_account_id().expect("read"), None);
        assert!(coordinator.remove("a").expect_err("already gone").is_not_found());
    }

    #[test]
    fn removing_another_account_keeps_selection() {
        let coordinator = SwitchCoordinator::new(seeded_store());
        coordinator.switch_to("a").expect("switch to a");
        coordinator.remove("b").expect("remove b");
        assert_eq!(coordinator.current().as_deref(), Some("a"));
    }

    #[test]
    fn blocking_the_active_account_clears_it() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        coordinator.switch_to("a").expect("switch to a");

        assert!(coordinator.block_active("a").expect("block"));
        assert_eq!(coordinator.current(), None);
        assert_eq!(
            store.get("a").expect("get").status,
            AccountStatus::BlockedByUpstream
        );
        assert!(!coordinator.block_active("b").expect("block inactive"));
    }

    #[test]
    fn republish_only_touches_the_active_account() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        coordinator.switch_to("a").expect("switch to a");

        let mut refreshed = store.get("a").expect("get a");
        refreshed.credentials.access_token = "token-a2".to_string();
        assert!(coordinator.republish(&refreshed));
        assert_eq!(
            coordinator.snapshot().map(|s| s.access_token.clone()).as_deref(),
            Some("token-a2")
        );

        let other = store.get("b").expect("get b");
        assert!(!coordinator.republish(&other));
        assert_eq!(coordinator.current().as_deref(), Some("a"));
    }

    #[test]
    fn follow_store_adopts_selection_written_elsewhere() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        let other_process = SwitchCoordinator::new(store.clone());

        assert!(!coordinator.follow_store().expect("nothing persisted"));
        other_process.switch_to("b").expect("switch elsewhere");
        assert!(coordinator.follow_store().expect("follow switch"));
        assert_eq!(coordinator.current().as_deref(), Some("b"));
        assert!(!coordinator.follow_store().expect("already in sync"));

        other_process.clear().expect("clear elsewhere");
        assert!(coordinator.follow_store().expect("follow clear"));
        assert_eq!(coordinator.current(), None);
    }

    #[test]
    fn follow_store_picks_up_credentials_replaced_elsewhere() {
        let store = seeded_store();
        let coordinator = SwitchCoordinator::new(store.clone());
        coordinator.switch_to("a").expect("switch to a");
        let before = coordinator.snapshot().expect("snapshot");

        store
            .update_credentials("a", &Credentials::bearer("token-a2"))
            .expect("replace token elsewhere");
        assert!(coordinator.follow_store().expect("follow new token"));
        let after = coordinator.snapshot().expect("snapshot");
        assert_eq!(after.account_id, "a");
        assert_eq!(after.access_token, "token-a2");
        assert!(after.generation > before.generation);
        assert!(!coordinator.follow_store().expect("already in sync"));

        store
            .set_status("a", AccountStatus::Disabled)
            .expect("disable elsewhere");
        assert!(coordinator.follow_store().expect("follow disable"));
        assert_eq!(coordinator.current(), None);
    }

    #[test]
    fn restore_reloads_persisted_selection_and_drops_unusable_ones() {
        let store = seeded_store();
        SwitchCoordinator::new(store.clone())
            .switch_to("b")
            .expect("switch to b");

        let restored = SwitchCoordinator::restored(store.clone()).expect("restore");
        assert_eq!(restored.current().as_deref(), Some("b"));

        store.set_status("b", AccountStatus::Disabled).expect("disable");
        let restored = SwitchCoordinator::restored(store.clone()).expect("restore");
        assert_eq!(restored.current(), None);
        assert_eq!(store.active_account_id().expect("read"), None);
    }
}
