//! Fixed-size signal bitsets and per-thread mask manipulation

use super::{Signal, NSIG, TERMINATION_SIGNAL};
use crate::error::fatal;
use std::fmt;

/// A set of signal numbers `1..=NSIG`, bit `n - 1` for signal `n`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignalSet([u32; 2]);

impl SignalSet {
    /// No signals
    pub const fn empty() -> Self {
        SignalSet([0, 0])
    }

    /// Every signal a thread may block: all but the termination signal,
    /// which must stay deliverable so an external stop request always lands.
    pub const fn all_maskable() -> Self {
        let term = TERMINATION_SIGNAL.as_raw() as u32;
        SignalSet([!0u32 & !(1 << (term - 1)), !0u32])
    }

    /// Build a set from signals
    pub fn of(signals: &[Signal]) -> Self {
        let mut set = Self::empty();
        for &sig in signals {
            set.add_raw(sig.as_raw());
        }
        set
    }

    /// Add a signal
    pub fn add(&mut self, sig: Signal) {
        self.add_raw(sig.as_raw());
    }

    /// Remove a signal
    pub fn remove(&mut self, sig: Signal) {
        self.remove_raw(sig.as_raw());
    }

    /// Test membership
    pub fn contains(&self, sig: Signal) -> bool {
        self.contains_raw(sig.as_raw())
    }

    /// Add by raw number; out-of-range numbers are ignored
    pub fn add_raw(&mut self, sig: i32) {
        if let Some((word, bit)) = slot(sig) {
            self.0[word] |= bit;
        }
    }

    /// Remove by raw number
    pub fn remove_raw(&mut self, sig: i32) {
        if let Some((word, bit)) = slot(sig) {
            self.0[word] &= !bit;
        }
    }

    /// Test membership by raw number
    pub fn contains_raw(&self, sig: i32) -> bool {
        slot(sig).is_some_and(|(word, bit)| self.0[word] & bit != 0)
    }

    /// True if no signal is set
    pub fn is_empty(&self) -> bool {
        self.0 == [0, 0]
    }

    /// Union of two sets
    pub fn union(self, other: Self) -> Self {
        SignalSet([self.0[0] | other.0[0], self.0[1] | other.0[1]])
    }

    /// Signals in `self` but not in `other`
    pub fn difference(self, other: Self) -> Self {
        SignalSet([self.0[0] & !other.0[0], self.0[1] & !other.0[1]])
    }

    /// The set as one 64-bit word
    pub fn bits(&self) -> u64 {
        self.0[0] as u64 | (self.0[1] as u64) << 32
    }

    /// Rebuild from a 64-bit word
    pub fn from_bits(bits: u64) -> Self {
        SignalSet([bits as u32, (bits >> 32) as u32])
    }

    /// Raw numbers present in the set, ascending
    pub fn iter_raw(&self) -> impl Iterator<Item = i32> + '_ {
        (1..=NSIG).filter(|&sig| self.contains_raw(sig))
    }

    /// Convert to the native representation. Numbers the host does not
    /// know are dropped.
    pub fn to_native(&self) -> libc::sigset_t {
        // SAFETY: sigemptyset fully initializes the set
        unsafe {
            let mut native: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut native);
            for sig in self.iter_raw() {
                libc::sigaddset(&mut native, sig);
            }
            native
        }
    }

    /// Convert from the native representation
    pub fn from_native(native: &libc::sigset_t) -> Self {
        let mut set = Self::empty();
        for sig in 1..=NSIG {
            // SAFETY: native is an initialized sigset_t
            if unsafe { libc::sigismember(native, sig) } == 1 {
                set.add_raw(sig);
            }
        }
        set
    }
}

fn slot(sig: i32) -> Option<(usize, u32)> {
    if (1..=NSIG).contains(&sig) {
        let n = (sig - 1) as u32;
        Some(((n / 32) as usize, 1 << (n % 32)))
    } else {
        None
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.iter_raw().map(|n| match Signal::from_raw(n) {
                Some(sig) => sig.name().to_string(),
                None => n.to_string(),
            }))
            .finish()
    }
}

/// The calling thread's blocked set
pub fn current_mask() -> SignalSet {
    set_thread_mask(libc::SIG_BLOCK, &SignalSet::empty())
}

/// Block `set` on the calling thread, returning the previous mask
pub fn block(set: &SignalSet) -> SignalSet {
    set_thread_mask(libc::SIG_BLOCK, set)
}

/// Unblock `set` on the calling thread, returning the previous mask
pub fn unblock(set: &SignalSet) -> SignalSet {
    set_thread_mask(libc::SIG_UNBLOCK, set)
}

/// Replace the calling thread's mask, returning the previous one
pub fn set_mask(set: &SignalSet) -> SignalSet {
    set_thread_mask(libc::SIG_SETMASK, set)
}

fn set_thread_mask(how: libc::c_int, set: &SignalSet) -> SignalSet {
    let native = set.to_native();
    // SAFETY: both sets are valid for the duration of the call
    unsafe {
        let mut old: libc::sigset_t = std::mem::zeroed();
        let rc = libc::pthread_sigmask(how, &native, &mut old);
        if rc != 0 {
            fatal("pthread_sigmask", rc);
        }
        SignalSet::from_native(&old)
    }
}

/// Replaces the calling thread's mask and restores the previous one on drop.
///
/// Not `Send`: the mask belongs to the thread that pushed it.
pub struct MaskGuard {
    saved: SignalSet,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl MaskGuard {
    /// Set the mask to exactly `set`
    pub fn set(set: &SignalSet) -> Self {
        MaskGuard {
            saved: set_mask(set),
            _not_send: std::marker::PhantomData,
        }
    }

    /// Block every maskable signal
    pub fn block_all() -> Self {
        Self::set(&SignalSet::all_maskable())
    }

    /// Mask that will be restored
    pub fn saved(&self) -> SignalSet {
        self.saved
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        set_mask(&self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_layout() {
        let mut set = SignalSet::empty();
        set.add_raw(1);
        set.add_raw(33);
        assert_eq!(set.bits(), 1 | 1 << 32);
        assert!(set.contains_raw(33));
        assert!(!set.contains_raw(2));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut set = SignalSet::empty();
        set.add_raw(0);
        set.add_raw(NSIG + 1);
        set.add_raw(-3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_all_maskable_excludes_termination() {
        let all = SignalSet::all_maskable();
        assert!(!all.contains(TERMINATION_SIGNAL));
        assert!(all.contains(Signal::Profile));
        assert!(all.contains(Signal::Hangup));
    }

    #[test]
    fn test_native_round_trip_of_named_signals() {
        let set = SignalSet::of(&[Signal::User1, Signal::Pipe, Signal::WindowChange]);
        assert_eq!(SignalSet::from_native(&set.to_native()), set);
    }

    #[test]
    fn test_mask_guard_restores() {
        let before = current_mask();
        {
            let guard = MaskGuard::set(&SignalSet::of(&[Signal::User2]));
            assert_eq!(guard.saved(), before);
            assert!(current_mask().contains(Signal::User2));
        }
        assert_eq!(current_mask(), before);
    }
}
