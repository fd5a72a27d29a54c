//! Process-level capability operations.
//!
//! `current` reads the calling thread's view (lock-free); `apply` commits a
//! snapshot to the whole process through the broadcaster. The two compose
//! into [`with_temporary_elevation`], the scoped raise/restore pattern the
//! privileged-bind use case needs.

use crate::bits::Capability;
use crate::broadcast::{syscaller, CommitOps};
use crate::errors::{CapError, Result};
use crate::kernel::{self, RawSyscall};
use crate::set::{CapabilitySet, Flag};

/// Snapshot of the current process's live capability state. A plain read in
/// the calling thread's context; no gate is taken.
pub fn current() -> Result<CapabilitySet> {
    CapabilitySet::from_live()
}

/// Commit a snapshot so it becomes the live state of every OS thread in the
/// process.
///
/// The snapshot is validated locally first; an inconsistent request fails
/// with `InvalidTransition` before any syscall. The commit itself runs
/// bounding drops, then capset, then ambient updates, all under a single
/// broadcast gate acquisition.
pub fn apply(set: &CapabilitySet) -> Result<()> {
    set.validate()?;

    // The builder diffs against the live state; the syscaller invokes it
    // with the commit already serialized against every other commit, so the
    // diff and the syscalls it produces form one atomic step.
    let result = syscaller().commit(&|| build_commit(set));
    if result.is_ok() {
        log::debug!("committed capability state: {}", set);
    }
    result
}

fn build_commit(set: &CapabilitySet) -> Result<CommitOps> {
    let live = CapabilitySet::from_live()?;
    if !set.bounding_bits().subset_of(live.bounding_bits()) {
        return Err(CapError::InvalidTransition(
            "bounding set only shrinks; cannot re-add dropped bits".to_string(),
        ));
    }

    let mut ops: Vec<RawSyscall> = Vec::new();

    // Bounding drops first, while the current effective set (which must hold
    // cap_setpcap for a drop to succeed) is still in force.
    for cap in live.bounding_bits().iter() {
        if !set.get_bound(cap) {
            ops.push(RawSyscall::prctl(
                kernel::PR_CAPBSET_DROP,
                cap.index() as usize,
                0,
            ));
        }
    }

    let (effective, permitted, inheritable) = set.epi_raw();
    let payload = kernel::capset_payload(effective, permitted, inheritable);
    ops.push(kernel::capset_syscall(&payload));

    // Ambient last: raises need the just-committed permitted+inheritable
    // bits in each thread's own context.
    if set.ambient_bits() != live.ambient_bits() {
        ops.push(RawSyscall::prctl(
            kernel::PR_CAP_AMBIENT as usize,
            kernel::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
        ));
        for cap in set.ambient_bits().iter() {
            ops.push(RawSyscall::prctl(
                kernel::PR_CAP_AMBIENT as usize,
                kernel::PR_CAP_AMBIENT_RAISE,
                cap.index() as usize,
            ));
        }
    }

    Ok(CommitOps {
        ops,
        payload: Some(payload),
    })
}

/// Drop effective, permitted, inheritable and ambient capabilities for the
/// whole process. The bounding set is left alone: shrinking it is
/// irreversible and stays an explicit caller decision via
/// [`CapabilitySet::drop_bound`].
pub fn drop_all() -> Result<()> {
    let mut lowered = current()?;
    lowered.clear_flag(Flag::Effective);
    lowered.clear_flag(Flag::Inheritable);
    lowered.clear_flag(Flag::Permitted);
    apply(&lowered)
}

/// Restores the pre-elevation snapshot on every exit path. A failed
/// restoration leaves the process in an unintended elevated state, which is
/// never acceptable: log and abort.
struct RestoreGuard {
    original: CapabilitySet,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if let Err(e) = apply(&self.original) {
            log::error!(
                "failed to restore capability state ({}); aborting to avoid running elevated",
                e
            );
            std::process::abort();
        }
    }
}

/// Run `body` with one capability bit raised in the given flag category,
/// restoring the original process state afterwards whether `body` returns,
/// early-returns through its own control flow, or panics. A restoration
/// failure is fatal on every path.
pub fn with_temporary_elevation<T>(
    flag: Flag,
    cap: Capability,
    body: impl FnOnce() -> T,
) -> Result<T> {
    let original = current()?;
    let mut elevated = original.dup();
    elevated.set_flag(flag, true, cap)?;

    apply(&elevated)?;
    let _guard = RestoreGuard { original };
    Ok(body())
}
