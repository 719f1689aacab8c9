use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use swap_accounts::{Account, AccountStore, Credentials, SwitchCoordinator};

fn coordinator_with(ids: &[&str]) -> Arc<SwitchCoordinator> {
    let store = AccountStore::in_memory().expect("store");
    for id in ids {
        store
            .upsert(&Account::new(
                *id,
                format!("{id}@example.com"),
                Credentials::bearer(format!("{id}-token")),
            ))
            .expect("upsert");
    }
    Arc::new(SwitchCoordinator::new(store))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_a_torn_selection() {
    let coordinator = coordinator_with(&["a", "b", "c"]);
    coordinator.switch_to("a").expect("initial switch");
    let stop = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for _ in 0..4 {
        let coordinator = Arc::clone(&coordinator);
        let stop = Arc::clone(&stop);
        readers.push(tokio::task::spawn_blocking(move || {
            let mut last_generation = 0;
            let mut observed = 0_u64;
            while !stop.load(Ordering::Relaxed) {
                let snapshot = coordinator.snapshot().expect("selection stays set");
                assert_eq!(
                    snapshot.access_token,
                    format!("{}-token", snapshot.account_id),
                    "token belongs to the selected account"
                );
                assert!(snapshot.generation >= last_generation);
                last_generation = snapshot.generation;
                observed += 1;
            }
            observed
        }));
    }

    let writer = {
        let coordinator = Arc::clone(&coordinator);
        tokio::task::spawn_blocking(move || {
            for round in 0..200 {
                let id = ["a", "b", "c"][round % 3];
                coordinator.switch_to(id).expect("switch");
            }
        })
    };
    writer.await.expect("writer");
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.await.expect("reader") > 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exchanges_dispatched_after_a_switch_see_the_new_account() {
    let coordinator = coordinator_with(&["a", "b"]);
    coordinator.switch_to("a").expect("switch to a");
    let in_flight = coordinator.snapshot().expect("snapshot before switch");

    let switched = coordinator.switch_to("b").expect("switch to b");

    let observers: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                coordinator.snapshot().expect("snapshot after switch")
            })
        })
        .collect();
    for observer in observers {
        let seen = observer.await.expect("observer");
        assert_eq!(seen.account_id, "b");
        assert_eq!(seen.generation, switched.generation);
    }
    assert_eq!(in_flight.account_id, "a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_switches_settle_on_a_persisted_winner() {
    let coordinator = coordinator_with(&["a", "b", "c", "d"]);
    let switches: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|id| {
            let coordinator = Arc::clone(&coordinator);
            tokio::task::spawn_blocking(move || coordinator.switch_to(id).expect("switch"))
        })
        .collect();
    let mut last = None;
    for switch in switches {
        let snapshot = switch.await.expect("join");
        if last
            .as_ref()
            .map_or(true, |current: &Arc<swap_accounts::ActiveSnapshot>| {
                snapshot.generation > current.generation
            })
        {
            last = Some(snapshot);
        }
    }
    let winner = last.expect("at least one switch");
    assert_eq!(coordinator.current().as_deref(), Some(winner.account_id.as_str()));
    assert_eq!(
        coordinator
            .store()
            .active_account_id()
            .expect("persisted")
            .as_deref(),
        Some(winner.account_id.as_str())
    );
}
