//! Thin wrappers around the Linux capability syscall surface.
//!
//! All `unsafe` in the read path is concentrated here with explicit SAFETY
//! comments. Structure layouts match `_LINUX_CAPABILITY_VERSION_3`; the
//! runtime capability ceiling is probed from the kernel, not hard-coded.

use crate::bits::COMPILED_LAST_CAP;
use std::fs;
use std::io;
use std::sync::OnceLock;

pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

pub(crate) const PR_CAPBSET_READ: libc::c_int = 23;
pub(crate) const PR_CAPBSET_DROP: usize = 24;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_IS_SET: libc::c_int = 1;
pub(crate) const PR_CAP_AMBIENT_RAISE: usize = 2;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: usize = 4;

/// capget/capset header, version 3. `pid` 0 means the calling thread.
#[repr(C)]
pub(crate) struct CapUserHeader {
    pub version: u32,
    pub pid: i32,
}

/// One 32-bit slice of the per-thread capability state. Version 3 uses two
/// entries: caps 0-31 and caps 32-63.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub(crate) struct CapUserData {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}

/// A kernel-state-mutating syscall expressed as plain data, so it can be
/// replayed verbatim in another thread's context from a signal handler.
/// Pointer-valued args must stay valid for the whole broadcast.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawSyscall {
    pub nr: libc::c_long,
    pub args: [usize; 6],
}

impl RawSyscall {
    pub fn prctl(op: usize, arg2: usize, arg3: usize) -> Self {
        Self {
            nr: libc::SYS_prctl,
            args: [op, arg2, arg3, 0, 0, 0],
        }
    }

    /// Issue the syscall in the calling thread's context, returning the raw
    /// errno on failure.
    pub fn invoke(&self) -> std::result::Result<libc::c_long, i32> {
        // SAFETY: the caller constructed this syscall with argument values
        // (and pointee lifetimes) valid for the duration of the call.
        let rc = unsafe {
            libc::syscall(
                self.nr, self.args[0], self.args[1], self.args[2], self.args[3], self.args[4],
                self.args[5],
            )
        };
        if rc == -1 {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(rc)
        }
    }
}

/// Highest capability number supported by the running kernel, probed once
/// from `/proc/sys/kernel/cap_last_cap`. Falls back to the compiled table's
/// ceiling when /proc is unavailable.
pub fn cap_last_cap() -> u8 {
    static LAST_CAP: OnceLock<u8> = OnceLock::new();
    *LAST_CAP.get_or_init(|| {
        match fs::read_to_string("/proc/sys/kernel/cap_last_cap") {
            Ok(text) => match text.trim().parse::<u8>() {
                Ok(last) => last.min(63),
                Err(_) => {
                    log::warn!("unparseable /proc/sys/kernel/cap_last_cap: {:?}", text.trim());
                    COMPILED_LAST_CAP
                }
            },
            Err(e) => {
                log::warn!("cannot read /proc/sys/kernel/cap_last_cap: {}", e);
                COMPILED_LAST_CAP
            }
        }
    })
}

/// Read the calling thread's effective/permitted/inheritable state via
/// capget(2). Reads are inherently thread-local and need no broadcast.
pub(crate) fn capget() -> io::Result<[CapUserData; 2]> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];
    // SAFETY: header is a valid version-3 header for the calling thread and
    // data has the two entries version 3 requires.
    let rc = unsafe { libc::syscall(libc::SYS_capget, &header, data.as_mut_ptr()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(data)
}

/// Heap-owned capset(2) argument block. The syscall built from it carries
/// raw addresses of these fields, so the box must stay allocated for as long
/// as any thread might still replay the call.
pub(crate) struct CapsetPayload {
    header: CapUserHeader,
    data: [CapUserData; 2],
}

/// Allocate the argument block for the given 64-bit E/P/I patterns.
pub(crate) fn capset_payload(
    effective: u64,
    permitted: u64,
    inheritable: u64,
) -> Box<CapsetPayload> {
    let (eff_low, eff_high) = split_u64(effective);
    let (prm_low, prm_high) = split_u64(permitted);
    let (inh_low, inh_high) = split_u64(inheritable);
    Box::new(CapsetPayload {
        header: CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        },
        data: [
            CapUserData {
                effective: eff_low,
                permitted: prm_low,
                inheritable: inh_low,
            },
            CapUserData {
                effective: eff_high,
                permitted: prm_high,
                inheritable: inh_high,
            },
        ],
    })
}

/// Build the capset(2) syscall over an argument block. The returned syscall
/// holds raw addresses into `payload`, which must outlive every replay.
pub(crate) fn capset_syscall(payload: &CapsetPayload) -> RawSyscall {
    RawSyscall {
        nr: libc::SYS_capset,
        args: [
            &payload.header as *const CapUserHeader as usize,
            payload.data.as_ptr() as usize,
            0,
            0,
            0,
            0,
        ],
    }
}

pub(crate) fn split_u64(bits: u64) -> (u32, u32) {
    (bits as u32, (bits >> 32) as u32)
}

pub(crate) fn join_u64(low: u32, high: u32) -> u64 {
    (low as u64) | ((high as u64) << 32)
}

/// Read one bit of the calling thread's bounding set.
pub(crate) fn bounding_has(cap: u8) -> bool {
    // SAFETY: PR_CAPBSET_READ with any cap number is safe; unknown caps
    // report EINVAL which we treat as absent.
    unsafe { libc::prctl(PR_CAPBSET_READ, cap as libc::c_ulong, 0, 0, 0) == 1 }
}

/// Read one bit of the calling thread's ambient set.
pub(crate) fn ambient_has(cap: u8) -> bool {
    // SAFETY: PR_CAP_AMBIENT with PR_CAP_AMBIENT_IS_SET is a pure query.
    unsafe {
        libc::prctl(
            PR_CAP_AMBIENT,
            PR_CAP_AMBIENT_IS_SET as libc::c_ulong,
            cap as libc::c_ulong,
            0,
            0,
        ) == 1
    }
}

/// Kernel thread id of the calling thread.
pub(crate) fn gettid() -> i32 {
    // SAFETY: gettid(2) takes no arguments and cannot fail.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
}

/// Direct a signal at one thread of this process.
pub(crate) fn tgkill(tid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: tgkill(2) with our own pid and a validated signal number only
    // affects this process.
    let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signal) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
