//! The unified TLB array: `STLB_SETS · STLB_WAYS + MTLB_ENTRIES` entries,
//! each carrying a 3-word `misc`/`entry0`/`entry1` packed encoding (§3).
//!
//! Bit-packed with `modular_bitfield`, continuing the teacher's
//! `#[bitfield] #[repr(u64)] struct Intercepts` pattern
//! (`hypervisor/src/svm/mod.rs`) rather than the raw-shift `Entry(usize)`
//! style in `arch/src/x86_64/paging/mod.rs` — a derive with named accessors
//! is the closer match for a layout the spec already describes field-by-field.

pub mod helpers;

use alloc::vec;
use alloc::boxed::Box;
use modular_bitfield::prelude::*;

use crate::config::{MTLB_ENTRIES, STLB_ENTRIES, STLB_SETS, STLB_WAYS, TLB_MAX};

/// `misc` word of a TLB entry: enable bit, ASID, virtual page number, page
/// size, and the GID tag that makes this a unified (first- and
/// second-stage) TLB.
#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbMisc {
    pub e: B1,
    pub asid: B10,
    /// Bits `[47:13]` of the virtual page number.
    pub vppn: B35,
    /// `log2` of the page size.
    pub ps: B6,
    pub gid: B8,
    #[skip]
    __: B4,
}

/// One half (`entry0` or `entry1`) of a TLB entry's page-frame descriptor.
#[bitfield]
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbPte {
    pub v: B1,
    pub d: B1,
    pub plv: B2,
    pub g: B1,
    pub ppn: B36,
    pub nx: B1,
    pub nr: B1,
    pub rplv: B1,
    #[skip]
    __: B20,
}

/// A single TLB entry: one `misc` word plus the even/odd page-frame halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TlbEntry {
    pub misc: TlbMisc,
    pub entry0: TlbPte,
    pub entry1: TlbPte,
}

impl TlbEntry {
    /// Select even/odd half by bit `PS` of the faulting address, per §4.1
    /// step 5.
    #[must_use]
    pub fn half_for(&self, va: u64) -> TlbPte {
        let ps = self.misc.ps();
        if (va >> ps) & 1 == 0 { self.entry0 } else { self.entry1 }
    }
}

/// Which GIDs a lookup or TLB-instruction helper is allowed to see (§4.1
/// invariant 3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GidFilter {
    /// Host mode: only `GID == 0` (VMM/second-stage) entries participate.
    Host,
    /// Guest mode: entries tagged with this GID, or `GID == 0`.
    Guest(u8),
}

impl GidFilter {
    const fn matches(self, gid: u8) -> bool {
        match self {
            Self::Host => gid == 0,
            Self::Guest(g) => gid == g || gid == 0,
        }
    }
}

/// The unified TLB array.
pub struct TlbArray {
    entries: Box<[TlbEntry]>,
}

impl TlbArray {
    #[must_use]
    pub fn new() -> Self {
        Self { entries: vec![TlbEntry::default(); TLB_MAX].into_boxed_slice() }
    }

    #[must_use]
    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut TlbEntry {
        &mut self.entries[index]
    }

    pub fn invalidate(&mut self, index: usize) {
        self.entries[index] = TlbEntry::default();
    }

    /// STLB set index for a VPN, per B2: "`VPN & 0xff`".
    #[must_use]
    pub const fn stlb_set(vpn: u64) -> usize {
        (vpn & 0xff) as usize
    }

    /// First index of the STLB set `set` (set-major layout: `set * ways`).
    #[must_use]
    pub const fn stlb_set_base(set: usize) -> usize {
        set * STLB_WAYS
    }

    /// Search the array for a matching translation. Mirrors `tlbsrch`
    /// (§4.3) and is reused by the Translation Engine's TLB-search step
    /// (§4.1 step 4) so both paths agree on tie-breaking.
    ///
    /// `vpn` must already be shifted to the entry's granularity (ie. `va >>
    /// (ps + 1)`, covering both halves of a page pair). Global entries
    /// (`G=1` on the selected half) match regardless of `asid`.
    #[must_use]
    pub fn search(&self, filter: GidFilter, vpn: u64, asid: u16, va: u64) -> Option<usize> {
        let set = Self::stlb_set(vpn);
        let base = Self::stlb_set_base(set);
        for way in 0..STLB_WAYS {
            let idx = base + way;
            if self.matches(idx, filter, vpn, asid, va) {
                return Some(idx);
            }
        }
        for mtlb_slot in 0..MTLB_ENTRIES {
            let idx = STLB_ENTRIES + mtlb_slot;
            if self.matches(idx, filter, vpn, asid, va) {
                return Some(idx);
            }
        }
        None
    }

    fn matches(&self, idx: usize, filter: GidFilter, vpn: u64, asid: u16, va: u64) -> bool {
        let entry = &self.entries[idx];
        if entry.misc.e() == 0 {
            return false;
        }
        if !filter.matches(entry.misc.gid()) {
            return false;
        }
        // Callers pre-shift `vpn` to the entry's own granularity (bits
        // `[47:13]` of the virtual address, matching `VPPN`'s width), so a
        // direct compare is correct regardless of the entry's page size.
        if u64::from(entry.misc.vppn()) != vpn {
            return false;
        }
        let half = entry.half_for(va);
        half.g() == 1 || u64::from(entry.misc.asid()) == u64::from(asid)
    }

    /// Invalidate every entry for which `pred` returns `true`. The shared
    /// primitive behind `tlbclr`/`tlbflush`/`invtlb_*` and the `CSR_ASID`
    /// write side effect (§4.2, §4.3) — each just supplies a different
    /// predicate over `(index, &TlbEntry)`.
    pub fn invalidate_matching(&mut self, mut pred: impl FnMut(usize, &TlbEntry) -> bool) {
        for idx in 0..self.entries.len() {
            if pred(idx, &self.entries[idx]) {
                self.entries[idx] = TlbEntry::default();
            }
        }
    }

    /// Choose a random victim index per §4.3 `tlbfill`: an STLB way in the
    /// set for `vpn` if `ps == stlbps`, else a random MTLB index.
    #[must_use]
    pub fn random_victim(stlbps: u8, ps: u8, vpn: u64, random32: u32) -> usize {
        if ps == stlbps {
            let set = Self::stlb_set(vpn);
            let way = (random32 as usize) % STLB_WAYS;
            Self::stlb_set_base(set) + way
        } else {
            STLB_ENTRIES + (random32 as usize) % MTLB_ENTRIES
        }
    }
}

impl Default for TlbArray {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_entry_never_matches() {
        let arr = TlbArray::new();
        assert_eq!(arr.search(GidFilter::Host, 0, 0, 0), None);
    }

    #[test]
    fn host_filter_excludes_guest_entries() {
        let mut arr = TlbArray::new();
        let idx = TlbArray::stlb_set_base(0);
        let entry = arr.entry_mut(idx);
        entry.misc.set_e(1);
        entry.misc.set_gid(3);
        entry.misc.set_vppn(0x10);
        entry.misc.set_asid(7);
        entry.entry0.set_v(1);

        assert_eq!(arr.search(GidFilter::Host, 0x10, 7, 0), None);
        assert_eq!(arr.search(GidFilter::Guest(3), 0x10, 7, 0), Some(idx));
    }

    #[test]
    fn global_entry_ignores_asid() {
        let mut arr = TlbArray::new();
        let idx = TlbArray::stlb_set_base(0);
        let entry = arr.entry_mut(idx);
        entry.misc.set_e(1);
        entry.misc.set_vppn(0x10);
        entry.misc.set_asid(7);
        entry.entry0.set_v(1);
        entry.entry0.set_g(1);

        assert_eq!(arr.search(GidFilter::Host, 0x10, 99, 0), Some(idx));
    }

    #[test]
    fn random_victim_respects_page_size_routing() {
        let stlb_idx = TlbArray::random_victim(14, 14, 0x10, 3);
        assert!(stlb_idx < STLB_ENTRIES);

        let mtlb_idx = TlbArray::random_victim(14, 21, 0x10, 5);
        assert!(mtlb_idx >= STLB_ENTRIES);
    }
}
