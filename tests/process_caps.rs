//! Integration tests for process-wide capability state.
//!
//! These run unprivileged: every mutation used here is a lowering or a
//! no-op, which capset(2) permits without any capability held. Tests that
//! would need real privilege verify the failure mode instead.
//!
//! Kernel capability state is process-global, so tests that read or commit
//! it serialize on a shared lock instead of trusting the harness scheduler.

use capmux::{broadcast, proc, CapError, Capability, CapabilitySet, Flag, Mode};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

static STATE_LOCK: Mutex<()> = Mutex::new(());

fn lock_state() -> std::sync::MutexGuard<'static, ()> {
    // First selection wins; every test shares one strategy.
    broadcast::init(Mode::Broadcast {
        timeout: Some(Duration::from_secs(10)),
    });
    STATE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn any_permitted(set: &CapabilitySet) -> bool {
    (0..=capmux::kernel::cap_last_cap())
        .filter_map(Capability::from_index)
        .any(|cap| set.get_flag(Flag::Permitted, cap))
}

#[test]
fn apply_current_round_trips() {
    let _state = lock_state();
    let before = proc::current().unwrap();
    proc::apply(&before).unwrap();
    assert_eq!(proc::current().unwrap(), before);

    // Idempotence: committing the already-live state again succeeds.
    proc::apply(&before).unwrap();
    assert_eq!(proc::current().unwrap(), before);
}

#[test]
fn snapshots_are_detached_values() {
    let _state = lock_state();
    let live = proc::current().unwrap();
    let mut snapshot = live.dup();

    // Mutating the snapshot touches neither the kernel nor other snapshots.
    snapshot.clear_flag(Flag::Inheritable);
    let _ = snapshot.set_flag(Flag::Permitted, false, Capability::Chown);
    assert_eq!(proc::current().unwrap(), live);
}

#[test]
fn effective_without_permitted_is_rejected_locally() {
    let _state = lock_state();
    let before = proc::current().unwrap();
    let mut request = CapabilitySet::empty();

    let err = request
        .set_flag(Flag::Effective, true, Capability::SysAdmin)
        .unwrap_err();
    assert!(matches!(err, CapError::InvalidTransition(_)));

    // The rejection happened before any syscall: kernel state unchanged.
    assert_eq!(proc::current().unwrap(), before);
}

#[test]
fn committed_state_is_visible_on_every_thread() {
    let _state = lock_state();
    let original = proc::current().unwrap();

    // Keep worker threads alive across the commit.
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let ready = ready_tx.clone();
            let (release_tx, release_rx) = mpsc::channel::<()>();
            let handle = broadcast::spawn(move || {
                ready.send(()).unwrap();
                release_rx.recv().unwrap();
                proc::current().unwrap()
            });
            (handle, release_tx)
        })
        .collect();
    for _ in 0..4 {
        ready_rx.recv().unwrap();
    }

    // Lowering the effective set is always permitted.
    let mut lowered = original.dup();
    lowered.clear_flag(Flag::Effective);
    proc::apply(&lowered).unwrap();

    // Pre-existing threads observe the committed state...
    for (handle, release) in workers {
        release.send(()).unwrap();
        assert_eq!(handle.join().unwrap(), lowered);
    }

    // ...and so does a thread spawned after the commit.
    let late = broadcast::spawn(|| proc::current().unwrap())
        .join()
        .unwrap();
    assert_eq!(late, lowered);

    proc::apply(&original).unwrap();
    assert_eq!(proc::current().unwrap(), original);
}

#[test]
fn commits_complete_while_short_lived_threads_exit() {
    let _state = lock_state();
    let state = proc::current().unwrap();

    // A connection-per-thread server constantly retires threads, some of
    // them mid-broadcast: after being enumerated, or even after being
    // signaled but before delivery. Commits must still run to completion.
    let churn = thread::spawn(|| {
        for _ in 0..200 {
            broadcast::spawn(|| {}).join().unwrap();
        }
    });
    for _ in 0..20 {
        proc::apply(&state).unwrap();
    }
    churn.join().unwrap();
    assert_eq!(proc::current().unwrap(), state);
}

#[test]
fn concurrent_commits_serialize() {
    let _state = lock_state();
    let state = proc::current().unwrap();

    // N concurrent commits of the same live state: every one must succeed
    // (strictly sequenced by the broadcast gate) and readers only ever
    // observe that state.
    let handles: Vec<_> = (0..8)
        .map(|_| {
            broadcast::spawn(move || {
                proc::apply(&state).unwrap();
                proc::current().unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), state);
    }
}

#[test]
fn temporary_elevation_refuses_unpermitted_bit() {
    let _state = lock_state();
    let before = proc::current().unwrap();
    if before.get_flag(Flag::Permitted, Capability::NetBindService) {
        // Privileged environment; the refusal path is not reachable.
        return;
    }

    let ran = std::cell::Cell::new(false);
    let result = proc::with_temporary_elevation(
        Flag::Effective,
        Capability::NetBindService,
        || ran.set(true),
    );
    assert!(matches!(result, Err(CapError::InvalidTransition(_))));
    assert!(!ran.get());
    assert_eq!(proc::current().unwrap(), before);
}

#[test]
fn drop_all_leaves_flag_sets_empty() {
    let _state = lock_state();
    let before = proc::current().unwrap();
    if any_permitted(&before) {
        // Privileged environment: dropping for real would break the other
        // tests in this process.
        return;
    }
    proc::drop_all().unwrap();
    let after = proc::current().unwrap();
    assert!(!after.get_flag(Flag::Effective, Capability::SysAdmin));
    assert!(!after.get_ambient(Capability::SysAdmin));
}
