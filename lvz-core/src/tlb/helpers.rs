//! Guest-aware TLB instruction helpers (§4.3): `tlbsrch`, `tlbrd`, `tlbwr`,
//! `tlbfill`, `tlbclr`, `tlbflush`, and the `invtlb_*` family.
//!
//! Every helper here reads/writes through the **effective** CSR bank and
//! restricts itself to entries matching the current effective GID — the
//! single physical array becomes per-guest logical TLBs with no copying.

use utils::sanity_assert;

use crate::collaborators::HostEnv;
use crate::cpu::CpuState;
use crate::tlb::{GidFilter, TlbArray, TlbPte};

impl CpuState {
    /// The GID a TLB helper must restrict itself to right now: the live
    /// `GSTAT.GID` in guest mode (or `GTLBC`'s explicit broadcast target),
    /// `0` (VMM) in host mode.
    fn gid_filter(&self) -> GidFilter {
        if self.is_guest_mode() {
            GidFilter::Guest(self.lvz.effective_gid_for_tlb_ops())
        } else {
            GidFilter::Host
        }
    }

    /// `tlbsrch`: locate the entry matching effective `TLBEHI` at the
    /// effective page size; on hit, write its index into effective
    /// `TLBIDX.INDEX` and clear `NE`; on miss, set `NE=1`.
    pub fn tlbsrch(&mut self) {
        let vpn = self.bank().tlbehi;
        let asid = self.bank().asid;
        let filter = self.gid_filter();
        let found = self.tlb.search(filter, vpn, asid, self.bank().tlbehi << 13);

        let bank = self.bank_mut();
        match found {
            Some(idx) => {
                bank.tlbidx.set_index(idx as u16);
                bank.tlbidx.set_ne(0);
            }
            None => bank.tlbidx.set_ne(1),
        }
    }

    /// `tlbrd`: read the entry at effective `TLBIDX.INDEX`. If disabled or
    /// GID-mismatched, clear the output CSRs and set `NE=1`; otherwise copy
    /// `VPPN`/`ASID`/`PS` into the effective bank.
    pub fn tlbrd(&mut self) {
        let index = usize::from(self.bank().tlbidx.index());
        let filter = self.gid_filter();
        let entry = *self.tlb.entry(index);
        let visible = entry.misc.e() == 1 && filter.matches(entry.misc.gid());

        let bank = self.bank_mut();
        if visible {
            bank.tlbehi = u64::from(entry.misc.vppn());
            bank.asid = entry.misc.asid();
            bank.tlbidx.set_ps(entry.misc.ps());
            bank.tlbidx.set_ne(0);
            bank.tlbelo0 = entry.entry0;
            bank.tlbelo1 = entry.entry1;
        } else {
            bank.tlbehi = 0;
            bank.asid = 0;
            bank.tlbelo0 = TlbPte::default();
            bank.tlbelo1 = TlbPte::default();
            bank.tlbidx.set_ne(1);
        }
    }

    /// `tlbwr`: invalidate the old entry at effective `TLBIDX.INDEX`
    /// (flushing the corresponding host-side cached pages), then fill it
    /// from effective `TLBEHI`/`TLBELO0`/`TLBELO1`/`ASID`/`TLBIDX.PS`,
    /// stamping `GID` with the current effective GID. If `NE=1`, the entry
    /// is left invalid instead.
    pub fn tlbwr(&mut self, host: &mut dyn HostEnv) {
        let index = usize::from(self.bank().tlbidx.index());
        self.tlb.invalidate(index);
        host.flush_translation_cache(0xFFFF_FFFF);

        if self.bank().tlbidx.ne() == 1 {
            return;
        }
        self.fill_entry_at(index);
    }

    /// `tlbfill`: pick a random victim index (STLB way for the current set
    /// if `TLBIDX.PS == STLBPS`, else a random MTLB index), invalidate it,
    /// then fill as for `tlbwr`.
    pub fn tlbfill(&mut self, host: &mut dyn HostEnv) {
        let bank = self.bank();
        let vpn = bank.tlbehi;
        let ps = bank.tlbidx.ps();
        let stlbps = bank.stlbps;
        let random = host.guest_random32();
        let index = TlbArray::random_victim(stlbps, ps, vpn, random);

        self.tlb.invalidate(index);
        host.flush_translation_cache(0xFFFF_FFFF);
        self.fill_entry_at(index);
    }

    fn fill_entry_at(&mut self, index: usize) {
        let gid = self.lvz.effective_gid_for_tlb_ops();
        // P1: with virtualization off, every entry this core ever enables
        // must carry GID 0 — there is no guest to tag it for.
        sanity_assert!(self.lvz_available() || gid == 0, "non-zero GID fill with LVZ unavailable");
        let bank = self.bank();
        let (vpn, asid, ps, entry0, entry1) =
            (bank.tlbehi, bank.asid, bank.tlbidx.ps(), bank.tlbelo0, bank.tlbelo1);

        let entry = self.tlb.entry_mut(index);
        entry.misc.set_e(1);
        entry.misc.set_vppn(vpn);
        entry.misc.set_asid(asid);
        entry.misc.set_ps(ps);
        entry.misc.set_gid(gid);
        entry.entry0 = entry0;
        entry.entry1 = entry1;
    }

    /// `tlbclr`: restricted to entries matching the current GID AND
    /// non-global whose `ASID` equals the effective `ASID`.
    pub fn tlbclr(&mut self, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        let asid = self.bank().asid;
        self.tlb.invalidate_matching(|_, entry| {
            filter.matches(entry.misc.gid())
                && entry.entry0.g() == 0
                && entry.misc.asid() == asid
        });
        host.flush_translation_cache(0xFFFF_FFFF);
    }

    /// `tlbflush`: restricted to entries matching the current GID (global
    /// and non-global alike).
    pub fn tlbflush(&mut self, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        self.tlb.invalidate_matching(|_, entry| filter.matches(entry.misc.gid()));
        host.flush_translation_cache(0xFFFF_FFFF);
    }

    /// `invtlb_all`: every entry visible to the current effective GID.
    pub fn invtlb_all(&mut self, host: &mut dyn HostEnv) {
        self.tlbflush(host);
    }

    /// `invtlb_all_g(g)`: every entry whose global bit equals `g`, within
    /// the current effective GID.
    pub fn invtlb_all_g(&mut self, g: bool, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        self.tlb.invalidate_matching(|_, entry| {
            filter.matches(entry.misc.gid()) && (entry.entry0.g() == 1) == g
        });
        host.flush_translation_cache(0xFFFF_FFFF);
    }

    /// `invtlb_all_asid(asid)`: non-global entries matching `asid`.
    pub fn invtlb_all_asid(&mut self, asid: u16, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        self.tlb.invalidate_matching(|_, entry| {
            filter.matches(entry.misc.gid()) && entry.entry0.g() == 0 && entry.misc.asid() == asid
        });
        host.flush_translation_cache(0xFFFF_FFFF);
    }

    /// `invtlb_page_asid(asid, addr)`: non-global entry for `asid` covering
    /// `addr`. Per B3, a matching *global* entry is explicitly NOT
    /// invalidated by this variant.
    pub fn invtlb_page_asid(&mut self, asid: u16, addr: u64, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        let vpn = addr >> 13;
        self.tlb.invalidate_matching(|_, entry| {
            filter.matches(entry.misc.gid())
                && entry.entry0.g() == 0
                && entry.misc.asid() == asid
                && u64::from(entry.misc.vppn()) == vpn
        });
        host.flush_translation_cache(0xFFFF_FFFF);
    }

    /// `invtlb_page_asid_or_g(asid, addr)`: as above, but a matching global
    /// entry IS invalidated too (B3).
    pub fn invtlb_page_asid_or_g(&mut self, asid: u16, addr: u64, host: &mut dyn HostEnv) {
        let filter = self.gid_filter();
        let vpn = addr >> 13;
        self.tlb.invalidate_matching(|_, entry| {
            filter.matches(entry.misc.gid())
                && u64::from(entry.misc.vppn()) == vpn
                && (entry.entry0.g() == 1 || entry.misc.asid() == asid)
        });
        host.flush_translation_cache(0xFFFF_FFFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::GpaClass;
    use crate::vmexit::ExceptionCode;

    struct TestHost {
        flushes: u32,
        random: u32,
    }

    impl HostEnv for TestHost {
        fn raise_exception(&mut self, _code: ExceptionCode) {}
        fn flush_translation_cache(&mut self, _mmu_idx_mask: u32) {
            self.flushes += 1;
        }
        fn guest_random32(&mut self) -> u32 {
            self.random
        }
        fn load_phys_u64(&mut self, _addr: u64) -> u64 {
            0
        }
        fn classify_gpa(&self, _gpa: u64) -> GpaClass {
            GpaClass::Ram
        }
    }

    #[test]
    fn r3_tlbwr_then_tlbrd_round_trips() {
        let mut cpu = CpuState::new(0);
        let mut host = TestHost { flushes: 0, random: 0 };

        cpu.host.tlbehi = 0x1234;
        cpu.host.asid = 9;
        cpu.host.tlbidx.set_index(5);
        cpu.host.tlbidx.set_ps(14);
        cpu.host.tlbelo0.set_v(1);
        cpu.host.tlbelo0.set_ppn(0xaaaa);
        cpu.host.tlbelo1.set_v(1);
        cpu.host.tlbelo1.set_ppn(0xbbbb);

        cpu.tlbwr(&mut host);
        assert_eq!(host.flushes, 1);

        cpu.host.tlbehi = 0;
        cpu.host.asid = 0;
        cpu.host.tlbelo0 = crate::tlb::TlbPte::default();
        cpu.host.tlbelo1 = crate::tlb::TlbPte::default();
        cpu.host.tlbidx.set_index(5);

        cpu.tlbrd();
        assert_eq!(cpu.host.tlbehi, 0x1234);
        assert_eq!(cpu.host.asid, 9);
        assert_eq!(cpu.host.tlbelo0.ppn(), 0xaaaa);
        assert_eq!(cpu.host.tlbelo1.ppn(), 0xbbbb);
    }

    #[test]
    fn tlbsrch_sets_ne_on_miss() {
        let mut cpu = CpuState::new(0);
        cpu.host.tlbehi = 0xdead;
        cpu.tlbsrch();
        assert_eq!(cpu.host.tlbidx.ne(), 1);
    }

    #[test]
    fn p6_tlb_helper_leaves_other_gid_entries_untouched() {
        let mut cpu = CpuState::new(0);
        let mut host = TestHost { flushes: 0, random: 0 };
        cpu.vm_enter();
        {
            let mut gstat = cpu.lvz.gstat;
            gstat.set_gid(3);
            cpu.lvz.gstat = gstat;
        }

        let other_idx = 40;
        {
            let entry = cpu.tlb.entry_mut(other_idx);
            entry.misc.set_e(1);
            entry.misc.set_gid(7);
            entry.misc.set_vppn(0x77);
        }
        let before = *cpu.tlb.entry(other_idx);

        cpu.tlbflush(&mut host);

        assert_eq!(*cpu.tlb.entry(other_idx), before);
    }

    #[test]
    fn b3_invtlb_page_asid_skips_global_entries() {
        let mut cpu = CpuState::new(0);
        let mut host = TestHost { flushes: 0, random: 0 };
        let idx = 10;
        {
            let entry = cpu.tlb.entry_mut(idx);
            entry.misc.set_e(1);
            entry.misc.set_vppn(0x55);
            entry.misc.set_asid(2);
            entry.entry0.set_g(1);
        }

        cpu.invtlb_page_asid(2, 0x55 << 13, &mut host);
        assert_eq!(cpu.tlb.entry(idx).misc.e(), 1, "global entry survives invtlb_page_asid");

        cpu.invtlb_page_asid_or_g(2, 0x55 << 13, &mut host);
        assert_eq!(cpu.tlb.entry(idx).misc.e(), 0, "global entry is cleared by the _or_g variant");
    }

    #[test]
    fn b2_tlbfill_routes_by_page_size() {
        let mut cpu = CpuState::new(0);
        let mut host = TestHost { flushes: 0, random: 7 };
        cpu.host.tlbehi = 0x10;
        cpu.host.stlbps = 14;
        cpu.host.tlbidx.set_ps(14);

        cpu.tlbfill(&mut host);

        let set_base = TlbArray::stlb_set_base(TlbArray::stlb_set(0x10));
        let filled = (set_base..set_base + 8).any(|i| cpu.tlb.entry(i).misc.e() == 1);
        assert!(filled, "STLB-sized fill must land inside the STLB set for its VPN");
    }
}
