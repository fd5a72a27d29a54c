//! Capability identifiers and the bit-pattern value type they live in.
//!
//! `Capability` is the process-wide constant table of named privilege bits.
//! `BitSet` is a pure value type; it never touches the kernel.

use crate::errors::{CapError, Result};
use crate::kernel;

/// Highest capability number this build knows about (CAP_CHECKPOINT_RESTORE,
/// kernel 5.9). The running kernel's ceiling is probed separately and may be
/// lower; see [`kernel::cap_last_cap`].
pub const COMPILED_LAST_CAP: u8 = 40;

/// A single named unit of root-equivalent privilege, mapped to its fixed
/// kernel bit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Capability {
    Chown = 0,
    DacOverride = 1,
    DacReadSearch = 2,
    Fowner = 3,
    Fsetid = 4,
    Kill = 5,
    Setgid = 6,
    Setuid = 7,
    Setpcap = 8,
    LinuxImmutable = 9,
    NetBindService = 10,
    NetBroadcast = 11,
    NetAdmin = 12,
    NetRaw = 13,
    IpcLock = 14,
    IpcOwner = 15,
    SysModule = 16,
    SysRawio = 17,
    SysChroot = 18,
    SysPtrace = 19,
    SysPacct = 20,
    SysAdmin = 21,
    SysBoot = 22,
    SysNice = 23,
    SysResource = 24,
    SysTime = 25,
    SysTtyConfig = 26,
    Mknod = 27,
    Lease = 28,
    AuditWrite = 29,
    AuditControl = 30,
    Setfcap = 31,
    MacOverride = 32,
    MacAdmin = 33,
    Syslog = 34,
    WakeAlarm = 35,
    BlockSuspend = 36,
    AuditRead = 37,
    Perfmon = 38,
    Bpf = 39,
    CheckpointRestore = 40,
}

impl Capability {
    /// Bit position of this capability.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Look up a capability by bit position, validated against both the
    /// compiled table and the running kernel's ceiling.
    pub fn from_index(index: u8) -> Option<Self> {
        if index > COMPILED_LAST_CAP || index > kernel::cap_last_cap() {
            return None;
        }
        // repr(u8) with contiguous discriminants 0..=COMPILED_LAST_CAP.
        Some(unsafe { std::mem::transmute::<u8, Capability>(index) })
    }

    /// Canonical kernel name, e.g. `cap_net_bind_service`.
    pub fn name(self) -> &'static str {
        match self {
            Capability::Chown => "cap_chown",
            Capability::DacOverride => "cap_dac_override",
            Capability::DacReadSearch => "cap_dac_read_search",
            Capability::Fowner => "cap_fowner",
            Capability::Fsetid => "cap_fsetid",
            Capability::Kill => "cap_kill",
            Capability::Setgid => "cap_setgid",
            Capability::Setuid => "cap_setuid",
            Capability::Setpcap => "cap_setpcap",
            Capability::LinuxImmutable => "cap_linux_immutable",
            Capability::NetBindService => "cap_net_bind_service",
            Capability::NetBroadcast => "cap_net_broadcast",
            Capability::NetAdmin => "cap_net_admin",
            Capability::NetRaw => "cap_net_raw",
            Capability::IpcLock => "cap_ipc_lock",
            Capability::IpcOwner => "cap_ipc_owner",
            Capability::SysModule => "cap_sys_module",
            Capability::SysRawio => "cap_sys_rawio",
            Capability::SysChroot => "cap_sys_chroot",
            Capability::SysPtrace => "cap_sys_ptrace",
            Capability::SysPacct => "cap_sys_pacct",
            Capability::SysAdmin => "cap_sys_admin",
            Capability::SysBoot => "cap_sys_boot",
            Capability::SysNice => "cap_sys_nice",
            Capability::SysResource => "cap_sys_resource",
            Capability::SysTime => "cap_sys_time",
            Capability::SysTtyConfig => "cap_sys_tty_config",
            Capability::Mknod => "cap_mknod",
            Capability::Lease => "cap_lease",
            Capability::AuditWrite => "cap_audit_write",
            Capability::AuditControl => "cap_audit_control",
            Capability::Setfcap => "cap_setfcap",
            Capability::MacOverride => "cap_mac_override",
            Capability::MacAdmin => "cap_mac_admin",
            Capability::Syslog => "cap_syslog",
            Capability::WakeAlarm => "cap_wake_alarm",
            Capability::BlockSuspend => "cap_block_suspend",
            Capability::AuditRead => "cap_audit_read",
            Capability::Perfmon => "cap_perfmon",
            Capability::Bpf => "cap_bpf",
            Capability::CheckpointRestore => "cap_checkpoint_restore",
        }
    }

    /// True if the running kernel reports this capability as supported.
    pub fn supported(self) -> bool {
        self.index() <= kernel::cap_last_cap()
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed-width ordered collection of privilege bits.
///
/// Width is established at construction (the running kernel's capability
/// count by default) and bits past the width are always zero. All operations
/// are total; only construction from a caller-supplied width can fail.
#[derive(Debug, Clone, Copy)]
pub struct BitSet {
    bits: u64,
    width: u8,
}

/// Equality is by bit pattern; two sets of different widths holding the same
/// bits compare equal.
impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl Eq for BitSet {}

impl BitSet {
    /// Empty set sized to the running kernel's capability count.
    pub fn new() -> Self {
        Self {
            bits: 0,
            width: kernel::cap_last_cap() + 1,
        }
    }

    /// Empty set of an explicit width. Fails if `width` exceeds the
    /// runtime-reported capability count.
    pub fn with_width(width: u8) -> Result<Self> {
        let max = kernel::cap_last_cap() + 1;
        if width > max {
            return Err(CapError::InvalidTransition(format!(
                "bitset width {} exceeds kernel capability count {}",
                width, max
            )));
        }
        Ok(Self { bits: 0, width })
    }

    pub(crate) fn from_raw(bits: u64) -> Self {
        let mut set = Self::new();
        set.bits = bits & set.mask();
        set
    }

    pub(crate) fn raw(&self) -> u64 {
        self.bits
    }

    fn mask(&self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    pub fn test(&self, cap: Capability) -> bool {
        self.bits & (1u64 << cap.index()) != 0
    }

    /// Set a bit. Positions past the set's width stay zero.
    pub fn set(&mut self, cap: Capability) {
        self.bits |= 1u64 << cap.index();
        self.bits &= self.mask();
    }

    pub fn clear(&mut self, cap: Capability) {
        self.bits &= !(1u64 << cap.index());
    }

    pub fn clear_all(&mut self) {
        self.bits = 0;
    }

    pub fn union(&mut self, other: &BitSet) {
        self.bits = (self.bits | other.bits) & self.mask();
    }

    pub fn intersect(&mut self, other: &BitSet) {
        self.bits &= other.bits;
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// True if every bit of `self` is also in `other`.
    pub fn subset_of(&self, other: &BitSet) -> bool {
        self.bits & !other.bits == 0
    }

    /// Iterate the capabilities present in this set.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        (0..=COMPILED_LAST_CAP)
            .filter(|i| self.bits & (1u64 << i) != 0)
            .filter_map(Capability::from_index)
    }
}

impl Default for BitSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_index_round_trips() {
        let cap = Capability::from_index(10).unwrap();
        assert_eq!(cap, Capability::NetBindService);
        assert_eq!(cap.index(), 10);
        assert_eq!(cap.name(), "cap_net_bind_service");
    }

    #[test]
    fn capability_from_index_rejects_out_of_range() {
        assert!(Capability::from_index(COMPILED_LAST_CAP + 1).is_none());
        assert!(Capability::from_index(200).is_none());
    }

    #[test]
    fn bitset_set_clear_test() {
        let mut set = BitSet::new();
        assert!(set.is_empty());
        set.set(Capability::Chown);
        assert!(set.test(Capability::Chown));
        assert!(!set.test(Capability::Setuid));
        set.clear(Capability::Chown);
        assert!(set.is_empty());
    }

    #[test]
    fn bitset_union_and_intersect() {
        let mut a = BitSet::new();
        a.set(Capability::Chown);
        let mut b = BitSet::new();
        b.set(Capability::Setuid);

        let mut u = a;
        u.union(&b);
        assert!(u.test(Capability::Chown));
        assert!(u.test(Capability::Setuid));

        u.intersect(&a);
        assert_eq!(u, a);
    }

    #[test]
    fn bitset_equality_is_by_pattern() {
        let mut a = BitSet::new();
        let mut b = BitSet::new();
        a.set(Capability::Kill);
        b.set(Capability::Kill);
        assert_eq!(a, b);
        b.clear_all();
        assert_ne!(a, b);
    }

    #[test]
    fn bitset_width_validation() {
        assert!(BitSet::with_width(1).is_ok());
        assert!(BitSet::with_width(64).is_err());
    }

    #[test]
    fn bitset_subset_relation() {
        let mut small = BitSet::new();
        small.set(Capability::Chown);
        let mut big = small;
        big.set(Capability::Setuid);
        assert!(small.subset_of(&big));
        assert!(!big.subset_of(&small));
    }

    #[test]
    fn bitset_iter_yields_set_bits_in_order() {
        let mut set = BitSet::new();
        set.set(Capability::Setuid);
        set.set(Capability::Chown);
        let caps: Vec<_> = set.iter().collect();
        assert_eq!(caps, vec![Capability::Chown, Capability::Setuid]);
    }
}
