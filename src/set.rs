//! The capability set value type.
//!
//! A `CapabilitySet` is a detached snapshot: mutating it never touches the
//! kernel until it is committed through [`crate::proc::apply`]. The kernel's
//! own consistency rules are enforced here, before any syscall, so an invalid
//! request fails fast with no partial kernel mutation.

use crate::bits::{BitSet, Capability};
use crate::errors::{CapError, Result};
use crate::kernel;

/// Selects which flag category of a [`CapabilitySet`] an operation targets.
/// Bounding and Ambient state have their own accessors since the kernel
/// constrains them differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Effective,
    Permitted,
    Inheritable,
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flag::Effective => f.write_str("effective"),
            Flag::Permitted => f.write_str("permitted"),
            Flag::Inheritable => f.write_str("inheritable"),
        }
    }
}

/// One process's (or one detached snapshot's) complete privilege
/// configuration. Freely copyable; copies share nothing with the kernel or
/// with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    pub(crate) effective: BitSet,
    pub(crate) permitted: BitSet,
    pub(crate) inheritable: BitSet,
    pub(crate) bounding: BitSet,
    pub(crate) ambient: BitSet,
}

impl CapabilitySet {
    /// Fully empty set (no bounding bits either). Useful as an apply target
    /// only after the caller has thought hard about irreversibility.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the calling process's live kernel state. A plain per-thread read:
    /// safe without the broadcast gate because all writes go through the
    /// broadcaster, so this thread's view matches the last commit.
    pub fn from_live() -> Result<Self> {
        let data = kernel::capget()?;
        let mut set = Self {
            effective: BitSet::from_raw(kernel::join_u64(data[0].effective, data[1].effective)),
            permitted: BitSet::from_raw(kernel::join_u64(data[0].permitted, data[1].permitted)),
            inheritable: BitSet::from_raw(kernel::join_u64(
                data[0].inheritable,
                data[1].inheritable,
            )),
            bounding: BitSet::new(),
            ambient: BitSet::new(),
        };
        for index in 0..=kernel::cap_last_cap() {
            let Some(cap) = Capability::from_index(index) else {
                continue;
            };
            if kernel::bounding_has(index) {
                set.bounding.set(cap);
            }
            if kernel::ambient_has(index) {
                set.ambient.set(cap);
            }
        }
        Ok(set)
    }

    /// Independent deep copy. `CapabilitySet` is `Copy`, so this exists for
    /// call sites that want the duplication to be explicit.
    pub fn dup(&self) -> Self {
        *self
    }

    pub fn get_flag(&self, flag: Flag, cap: Capability) -> bool {
        self.flag_bits(flag).test(cap)
    }

    /// Raise or lower one bit in a flag category, rejecting states the
    /// kernel would refuse: Effective requires Permitted, and lowering
    /// Permitted lowers any Effective/Ambient bit that depended on it.
    pub fn set_flag(&mut self, flag: Flag, on: bool, cap: Capability) -> Result<()> {
        if !cap.supported() {
            return Err(CapError::InvalidTransition(format!(
                "{} is not supported by the running kernel",
                cap
            )));
        }
        if on && flag == Flag::Effective && !self.permitted.test(cap) {
            return Err(CapError::InvalidTransition(format!(
                "{} cannot be effective without being permitted",
                cap
            )));
        }
        let bits = self.flag_bits_mut(flag);
        if on {
            bits.set(cap);
        } else {
            bits.clear(cap);
            if flag == Flag::Permitted {
                self.effective.clear(cap);
                self.ambient.clear(cap);
            }
            if flag == Flag::Inheritable {
                self.ambient.clear(cap);
            }
        }
        Ok(())
    }

    pub fn clear_flag(&mut self, flag: Flag) {
        self.flag_bits_mut(flag).clear_all();
        if flag == Flag::Permitted || flag == Flag::Inheritable {
            self.ambient.clear_all();
        }
        if flag == Flag::Permitted {
            self.effective.clear_all();
        }
    }

    pub fn get_bound(&self, cap: Capability) -> bool {
        self.bounding.test(cap)
    }

    /// Remove one capability from the bounding set. The bounding set only
    /// shrinks for the lifetime of the process; there is no raise operation.
    pub fn drop_bound(&mut self, cap: Capability) {
        self.bounding.clear(cap);
    }

    pub fn get_ambient(&self, cap: Capability) -> bool {
        self.ambient.test(cap)
    }

    /// Raise or lower one ambient bit. A bit may be ambient only while it is
    /// both permitted and inheritable.
    pub fn set_ambient(&mut self, on: bool, cap: Capability) -> Result<()> {
        if on && !(self.permitted.test(cap) && self.inheritable.test(cap)) {
            return Err(CapError::InvalidTransition(format!(
                "{} cannot be ambient without being permitted and inheritable",
                cap
            )));
        }
        if on {
            self.ambient.set(cap);
        } else {
            self.ambient.clear(cap);
        }
        Ok(())
    }

    pub(crate) fn bounding_bits(&self) -> &BitSet {
        &self.bounding
    }

    pub(crate) fn ambient_bits(&self) -> &BitSet {
        &self.ambient
    }

    pub(crate) fn epi_raw(&self) -> (u64, u64, u64) {
        (
            self.effective.raw(),
            self.permitted.raw(),
            self.inheritable.raw(),
        )
    }

    /// Consistency check mirroring the kernel's rules, run before a commit.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.effective.subset_of(&self.permitted) {
            return Err(CapError::InvalidTransition(
                "effective set is not a subset of permitted".to_string(),
            ));
        }
        let mut ambient_ceiling = self.permitted;
        ambient_ceiling.intersect(&self.inheritable);
        if !self.ambient.subset_of(&ambient_ceiling) {
            return Err(CapError::InvalidTransition(
                "ambient set exceeds the intersection of permitted and inheritable".to_string(),
            ));
        }
        Ok(())
    }

    fn flag_bits(&self, flag: Flag) -> &BitSet {
        match flag {
            Flag::Effective => &self.effective,
            Flag::Permitted => &self.permitted,
            Flag::Inheritable => &self.inheritable,
        }
    }

    fn flag_bits_mut(&mut self, flag: Flag) -> &mut BitSet {
        match flag {
            Flag::Effective => &mut self.effective,
            Flag::Permitted => &mut self.permitted,
            Flag::Inheritable => &mut self.inheritable,
        }
    }
}

impl std::fmt::Display for CapabilitySet {
    /// `/proc/self/status`-like hex rendering, for logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "eff={:016x} prm={:016x} inh={:016x} bnd={:016x} amb={:016x}",
            self.effective.raw(),
            self.permitted.raw(),
            self.inheritable.raw(),
            self.bounding.raw(),
            self.ambient.raw()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permitted_only(cap: Capability) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        set.set_flag(Flag::Permitted, true, cap).unwrap();
        set
    }

    #[test]
    fn effective_requires_permitted() {
        let mut set = CapabilitySet::empty();
        let err = set
            .set_flag(Flag::Effective, true, Capability::NetBindService)
            .unwrap_err();
        assert!(matches!(err, CapError::InvalidTransition(_)));

        let mut set = permitted_only(Capability::NetBindService);
        set.set_flag(Flag::Effective, true, Capability::NetBindService)
            .unwrap();
        assert!(set.get_flag(Flag::Effective, Capability::NetBindService));
    }

    #[test]
    fn lowering_permitted_lowers_dependents() {
        let mut set = permitted_only(Capability::Kill);
        set.set_flag(Flag::Inheritable, true, Capability::Kill).unwrap();
        set.set_flag(Flag::Effective, true, Capability::Kill).unwrap();
        set.set_ambient(true, Capability::Kill).unwrap();

        set.set_flag(Flag::Permitted, false, Capability::Kill).unwrap();
        assert!(!set.get_flag(Flag::Effective, Capability::Kill));
        assert!(!set.get_ambient(Capability::Kill));
        assert!(set.get_flag(Flag::Inheritable, Capability::Kill));
    }

    #[test]
    fn ambient_requires_permitted_and_inheritable() {
        let mut set = permitted_only(Capability::Chown);
        assert!(set.set_ambient(true, Capability::Chown).is_err());
        set.set_flag(Flag::Inheritable, true, Capability::Chown).unwrap();
        set.set_ambient(true, Capability::Chown).unwrap();
        assert!(set.get_ambient(Capability::Chown));
    }

    #[test]
    fn dup_is_independent() {
        let original = permitted_only(Capability::Setuid);
        let mut copy = original.dup();
        assert_eq!(copy, original);
        copy.set_flag(Flag::Permitted, false, Capability::Setuid).unwrap();
        assert_ne!(copy, original);
        assert!(original.get_flag(Flag::Permitted, Capability::Setuid));
    }

    #[test]
    fn validate_rejects_handcrafted_inconsistency() {
        // clear_flag on Permitted keeps the set consistent, so build an
        // inconsistent one field-by-field.
        let mut set = CapabilitySet::empty();
        set.set_flag(Flag::Permitted, true, Capability::Kill).unwrap();
        set.set_flag(Flag::Effective, true, Capability::Kill).unwrap();
        set.validate().unwrap();

        let mut broken = set;
        broken.effective = {
            let mut bits = BitSet::new();
            bits.set(Capability::Chown);
            bits
        };
        assert!(matches!(
            broken.validate(),
            Err(CapError::InvalidTransition(_))
        ));
    }

    #[test]
    fn validate_error_text_is_plain_ascii() {
        // Error text ends up in terminal logs; keep it plain ASCII.
        let mut broken = CapabilitySet::empty();
        broken.ambient = {
            let mut bits = BitSet::new();
            bits.set(Capability::Chown);
            bits
        };
        let err = broken.validate().unwrap_err();
        let CapError::InvalidTransition(message) = err else {
            panic!("unexpected error variant");
        };
        assert!(message.is_ascii());
    }

    #[test]
    fn from_live_is_internally_consistent() {
        let live = CapabilitySet::from_live().unwrap();
        live.validate().unwrap();
    }

    #[test]
    fn drop_bound_only_clears() {
        let mut set = CapabilitySet::from_live().unwrap();
        set.drop_bound(Capability::SysAdmin);
        assert!(!set.get_bound(Capability::SysAdmin));
    }

    #[test]
    fn display_is_hex_status_style() {
        let text = format!("{}", CapabilitySet::empty());
        assert!(text.starts_with("eff=0000000000000000"));
    }
}
