//! Process-wide syscall broadcast.
//!
//! Linux keeps capability state per OS thread, so a mutating syscall issued
//! by one thread leaves every other thread stale. The broadcaster makes such
//! operations appear process-wide: it takes a process-wide gate (which also
//! holds back thread births going through [`spawn`]), enumerates
//! `/proc/self/task`, and interrupts each thread with a realtime signal whose
//! handler replays the same syscall in that thread's own kernel context and
//! reports its individual result back through a lock-free slot table.
//!
//! Reads never take the gate: the value asked for is inherently thread-local
//! and the last committed broadcast already updated the calling thread.

use crate::errors::{BroadcastReport, CapError, Result, ThreadOutcome};
use crate::kernel::{self, RawSyscall};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// Commit strategy, selected once at process start. Defaults to `Broadcast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Mutations are applied to every OS thread under the process-wide gate.
    /// `timeout` bounds the rendezvous; `None` waits indefinitely.
    Broadcast { timeout: Option<Duration> },
    /// Every operation runs in the calling thread's own context with no
    /// locking. Correct only if the caller guarantees it is the sole OS
    /// thread observing or mutating this state (e.g. pinned single-thread
    /// programs). The precondition is not verified.
    SingleThread,
}

/// One commit's syscalls plus the heap block their pointer-valued arguments
/// point into. The payload must outlive any signal handler that might still
/// replay an op, so the broadcast path leaks it when a rendezvous times out
/// instead of freeing memory a late handler could dereference.
pub(crate) struct CommitOps {
    pub ops: Vec<RawSyscall>,
    pub payload: Option<Box<kernel::CapsetPayload>>,
}

pub(crate) trait Syscaller: Send + Sync {
    /// Build and apply one commit. `build` runs fully serialized against
    /// other commits, so it can diff against the live kernel state without a
    /// concurrent commit slipping in between the diff and the syscalls.
    fn commit(&self, build: &dyn Fn() -> Result<CommitOps>) -> Result<()>;
}

static SYSCALLER: OnceLock<Box<dyn Syscaller>> = OnceLock::new();

/// Select the commit strategy. Returns false if a strategy was already
/// selected (first selection wins, matching one-time startup configuration).
pub fn init(mode: Mode) -> bool {
    let syscaller: Box<dyn Syscaller> = match mode {
        Mode::Broadcast { timeout } => Box::new(BroadcastSyscaller { timeout }),
        Mode::SingleThread => Box::new(SingleThreadSyscaller),
    };
    SYSCALLER.set(syscaller).is_ok()
}

pub(crate) fn syscaller() -> &'static dyn Syscaller {
    SYSCALLER
        .get_or_init(|| Box::new(BroadcastSyscaller { timeout: None }))
        .as_ref()
}

/// Gate shared by broadcasts (write side) and thread births (read side).
/// Broadcasts are mutually exclusive with each other and with any thread
/// created through [`spawn`], so no thread is born mid-broadcast with stale
/// state.
static GATE: RwLock<()> = RwLock::new(());

/// Spawn an OS thread whose birth is synchronized with capability
/// broadcasts. The clone completes while the gate is held, so the new thread
/// either carries the pre-broadcast state and is enumerated by the next
/// broadcast, or carries the post-broadcast state.
pub fn spawn<F, T>(f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let _birth = GATE.read().unwrap_or_else(PoisonError::into_inner);
    thread::spawn(f)
}

fn broadcast_signal() -> libc::c_int {
    libc::SIGRTMIN() + 6
}

/// One thread's result cell. `tid` is written by the reporting thread itself.
struct Slot {
    tid: AtomicI32,
    errno: AtomicI32,
}

/// Shared state of one in-flight broadcast round, published to signal
/// handlers through [`CURRENT`]. Freed only after every signaled thread has
/// checked in; leaked on rendezvous timeout since a late handler may still
/// hold the pointer.
struct Rendezvous {
    sc: RawSyscall,
    slots: Box<[Slot]>,
    next: AtomicUsize,
    done: AtomicUsize,
}

static CURRENT: AtomicPtr<Rendezvous> = AtomicPtr::new(ptr::null_mut());

/// Realtime-signal handler: replay the published syscall in this thread's
/// own kernel context and report (tid, errno). Only raw syscalls and atomics
/// are used; errno is preserved for the interrupted code.
extern "C" fn broadcast_handler(_signal: libc::c_int) {
    // SAFETY: __errno_location is async-signal-safe on Linux.
    let saved_errno = unsafe { *libc::__errno_location() };

    let current = CURRENT.load(Ordering::Acquire);
    if !current.is_null() {
        // SAFETY: the coordinator keeps the Rendezvous alive until every
        // signaled thread has incremented `done` (or leaks it on timeout).
        let rendezvous = unsafe { &*current };
        let errno = match rendezvous.sc.invoke() {
            Ok(_) => 0,
            Err(errno) => errno,
        };
        let index = rendezvous.next.fetch_add(1, Ordering::AcqRel);
        if index < rendezvous.slots.len() {
            rendezvous.slots[index].tid.store(kernel::gettid(), Ordering::Release);
            rendezvous.slots[index].errno.store(errno, Ordering::Release);
        }
        rendezvous.done.fetch_add(1, Ordering::AcqRel);
    }

    // SAFETY: restoring the interrupted thread's errno.
    unsafe { *libc::__errno_location() = saved_errno };
}

fn install_handler() -> io::Result<()> {
    static INSTALLED: OnceLock<std::result::Result<(), i32>> = OnceLock::new();
    let outcome = INSTALLED.get_or_init(|| {
        // SAFETY: zeroed sigaction is a valid starting point; we fill in the
        // handler, flags and an empty mask before installing.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = broadcast_handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(broadcast_signal(), &action, ptr::null_mut()) == -1 {
                return Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO));
            }
        }
        Ok(())
    });
    match outcome {
        Ok(()) => Ok(()),
        Err(errno) => Err(io::Error::from_raw_os_error(*errno)),
    }
}

/// Kernel thread ids of every live OS thread in this process.
fn enumerate_tasks() -> Result<Vec<i32>> {
    let mut tids = Vec::new();
    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<i32>() {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// Map a syscall failure in the coordinator's own context. EPERM means the
/// calling thread's permitted set does not allow the requested expansion;
/// anything else is an outright kernel refusal.
fn map_local_errno(errno: i32) -> CapError {
    if errno == libc::EPERM {
        CapError::InsufficientPrivilege(
            "kernel permitted set does not allow the requested state (EPERM)".to_string(),
        )
    } else {
        CapError::Denied(nix::errno::Errno::from_raw(errno))
    }
}

/// Fold one round's per-thread outcomes into the running report.
fn fold_outcomes(outcomes: &[ThreadOutcome], report: &mut BroadcastReport) {
    for outcome in outcomes {
        if outcome.errno == 0 {
            report.applied.push(outcome.tid);
        } else {
            report.failed.push(*outcome);
        }
    }
}

struct BroadcastSyscaller {
    timeout: Option<Duration>,
}

impl BroadcastSyscaller {
    /// Signal `targets` and wait for all of them to replay `sc`. A thread
    /// that exits has no state left to fix, whether it died before signaling
    /// (ESRCH) or after signaling but before delivery (noticed by the wait
    /// loop re-reading `/proc/self/task`); either way it is skipped.
    fn rendezvous(&self, sc: RawSyscall, targets: &[i32]) -> Result<Vec<ThreadOutcome>> {
        let slots: Box<[Slot]> = targets
            .iter()
            .map(|_| Slot {
                tid: AtomicI32::new(0),
                errno: AtomicI32::new(0),
            })
            .collect();
        let shared = Box::into_raw(Box::new(Rendezvous {
            sc,
            slots,
            next: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }));
        CURRENT.store(shared, Ordering::Release);

        let mut signaled: Vec<i32> = Vec::with_capacity(targets.len());
        let mut signal_error = None;
        for &tid in targets {
            match kernel::tgkill(tid, broadcast_signal()) {
                Ok(()) => signaled.push(tid),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => {
                    signal_error = Some(format!("tgkill({}) failed: {}", tid, e));
                    break;
                }
            }
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut expected = signaled.len();
        let mut last_scan = Instant::now();
        loop {
            // SAFETY: `shared` stays valid until this loop observes all
            // expected threads done, or is leaked on the timeout path below.
            let done = unsafe { &*shared }.done.load(Ordering::Acquire);
            if done >= expected {
                break;
            }
            // A signaled thread that exited before the signal was delivered
            // will never check in; stop counting it so the wait terminates.
            if last_scan.elapsed() >= Duration::from_millis(10) {
                last_scan = Instant::now();
                if let Ok(live) = enumerate_tasks() {
                    let live: HashSet<i32> = live.into_iter().collect();
                    expected = signaled.iter().filter(|t| live.contains(*t)).count();
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    // A late handler may still dereference `shared`; leak it
                    // and leave state explicitly unknown.
                    CURRENT.store(ptr::null_mut(), Ordering::Release);
                    return Err(CapError::ThreadSyncFailure(format!(
                        "broadcast rendezvous timed out with {}/{} threads confirmed",
                        done, expected
                    )));
                }
            }
            thread::sleep(Duration::from_micros(50));
        }
        CURRENT.store(ptr::null_mut(), Ordering::Release);

        // SAFETY: every thread still being waited on has checked in; no
        // handler holds the pointer any more.
        let rendezvous = unsafe { Box::from_raw(shared) };
        if let Some(message) = signal_error {
            return Err(CapError::ThreadSyncFailure(message));
        }
        let reported = rendezvous.next.load(Ordering::Acquire).min(rendezvous.slots.len());
        let outcomes = rendezvous.slots[..reported]
            .iter()
            .map(|slot| ThreadOutcome {
                tid: slot.tid.load(Ordering::Acquire),
                errno: slot.errno.load(Ordering::Acquire),
            })
            .collect();
        Ok(outcomes)
    }

    /// Apply one operation to every thread, re-enumerating until a pass finds
    /// no thread it has not visited, so threads born outside [`spawn`] still
    /// converge.
    fn broadcast_op(&self, sc: RawSyscall, report: &mut BroadcastReport) -> Result<()> {
        let self_tid = kernel::gettid();

        // The coordinator applies in its own context first; a refusal here is
        // a clean failure with no other thread touched yet.
        sc.invoke().map_err(map_local_errno)?;
        report.applied.push(self_tid);

        let mut visited: HashSet<i32> = HashSet::new();
        visited.insert(self_tid);
        loop {
            let targets: Vec<i32> = enumerate_tasks()?
                .into_iter()
                .filter(|tid| !visited.contains(tid))
                .collect();
            if targets.is_empty() {
                return Ok(());
            }
            visited.extend(targets.iter().copied());
            let outcomes = self.rendezvous(sc, &targets)?;
            fold_outcomes(&outcomes, report);
        }
    }
}

impl Syscaller for BroadcastSyscaller {
    fn commit(&self, build: &dyn Fn() -> Result<CommitOps>) -> Result<()> {
        let _gate = GATE.write().unwrap_or_else(PoisonError::into_inner);
        install_handler()?;
        let CommitOps { ops, payload } = build()?;

        let mut report = BroadcastReport::default();
        for op in &ops {
            match self.broadcast_op(*op, &mut report) {
                Ok(()) => {}
                Err(e @ CapError::ThreadSyncFailure(_)) => {
                    // A late handler that already loaded the rendezvous
                    // pointer may still replay an op whose args point into
                    // the payload; it must stay allocated forever.
                    if let Some(payload) = payload {
                        Box::leak(payload);
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
            if !report.failed.is_empty() {
                log::error!("capability broadcast partially applied: {}", report);
                return Err(CapError::PartialApplication(report));
            }
        }
        Ok(())
    }
}

struct SingleThreadSyscaller;

impl Syscaller for SingleThreadSyscaller {
    fn commit(&self, build: &dyn Fn() -> Result<CommitOps>) -> Result<()> {
        let commit = build()?;
        for op in &commit.ops {
            op.invoke().map_err(map_local_errno)?;
        }
        Ok(())
    }
}
