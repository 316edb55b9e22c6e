//! The Translation Engine (§4.1): direct-mapped-window shortcuts, first-stage
//! TLB lookup, and (when virtualization is active) second-stage GPA→HPA
//! translation.
//!
//! `Prot` is a raw bitset over a `u8`, continuing the teacher's
//! `Flags<X86_64>` pattern (`arch/src/x86_64/paging/flags.rs`) rather than
//! `modular_bitfield` — a handful of independent yes/no bits reads better as
//! named consts over a scalar than as a derived struct.

use core::ops::BitOr;

use crate::collaborators::{GpaClass, HostEnv};
use crate::config::VALEN;
use crate::cpu::CpuState;
use crate::error::TranslationFault;
use crate::tlb::{GidFilter, TlbPte};
use crate::vmexit::{AccessType, ExceptionCode, MmuIdx, VmExitReason};

/// `TLBRERA` bit 0: set by a host-mode stage-1 `NOMATCH` to mark that the
/// stashed PC belongs to the TLB-refill exception, not an ordinary one
/// (§7, category 1).
const ISTLBR_BIT: u64 = 1;

/// Permissions a successful translation grants, as a bitset over `{READ,
/// WRITE, EXEC}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prot(u8);

impl Prot {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);
    /// Direct-physical and DMW paths grant every permission.
    pub const ALL: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXEC.0);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl BitOr for Prot {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl CpuState {
    /// `get_physical_address(va, access_type, mmu_idx)` (§6). `mmu_idx` is
    /// part of the host-facing contract but carries no information this
    /// algorithm needs beyond what `CRMD`/`GSTAT` already hold; `MmuIdx::Da`
    /// exists so callers can name the already-bypassed case explicitly.
    pub fn translate(
        &mut self,
        va: u64,
        access: AccessType,
        mmu_idx: MmuIdx,
        host: &mut dyn HostEnv,
    ) -> Result<(u64, Prot), TranslationFault> {
        let _ = mmu_idx;
        let crmd = self.bank().crmd;

        // Step 1: direct addressing.
        if crmd.da() != 0 && crmd.pg() == 0 {
            return Ok((va, Prot::ALL));
        }

        // Step 2: direct-mapped windows.
        if let Some(pa) = self.dmw_translate(va, crmd.plv()) {
            return Ok((pa, Prot::ALL));
        }

        // Step 3: canonical-address check.
        if !is_canonical(va) {
            host.raise_exception(TranslationFault::BadAddr.exception_code(access));
            return Err(TranslationFault::BadAddr);
        }

        // Step 4: first-stage TLB search.
        let filter = if self.is_guest_mode() {
            GidFilter::Guest(self.lvz.current_gid())
        } else {
            GidFilter::Host
        };
        let vpn = va >> 13;
        let asid = self.bank().asid;
        let Some(index) = self.tlb.search(filter, vpn, asid, va) else {
            return Err(self.stage1_miss(va, host));
        };

        let entry = *self.tlb.entry(index);
        let half = entry.half_for(va);

        // Step 5: permission decode.
        if let Err(fault) = check_permissions(half, access, crmd.plv()) {
            host.raise_exception(fault.exception_code(access));
            return Err(fault);
        }

        // Step 6: compose PA and permissions.
        let ps = entry.misc.ps();
        let (pa, prot) = compose(half, va, ps);

        // Step 7: second-stage translation under an active guest.
        if self.lvz_available() && self.is_guest_mode() {
            return self.translate_stage2(pa, va, access, prot, host);
        }

        Ok((pa, prot))
    }

    /// Step 2: direct-mapped windows. `va[63:60]` selects a window; its
    /// `vseg` must match and its per-privilege-level bit for `plv` must be
    /// set. The matched window's `pseg` is substituted into the high
    /// nibble the match consumed, per §4.1 step 2 ("substituting the
    /// window's physical segment").
    fn dmw_translate(&self, va: u64, plv: u8) -> Option<u64> {
        let tag = (va >> 60) as u8 & 0xf;
        let window = self.bank().dmw.iter().find(|w| w.vseg() == tag && w.allows_plv(plv))?;
        Some((va & 0x0FFF_FFFF_FFFF_FFFF) | (u64::from(window.pseg()) << 60))
    }

    /// §7 category 1: `NOMATCH` additionally sets `TLBRERA.ISTLBR=1`,
    /// `TLBRBADV=addr`, and fills `TLBREHI.VPPN` to drive the TLB-refill
    /// path. In guest mode this is instead a stage-1 VM-exit (§4.1 step 7
    /// applies only past a successful stage-1 hit, so a stage-1 miss under
    /// an active guest never reaches the refill registers at all).
    fn stage1_miss(&mut self, va: u64, host: &mut dyn HostEnv) -> TranslationFault {
        if self.is_guest_mode() {
            let gid = self.lvz.current_gid();
            self.vm_exit(VmExitReason::Tlb { gva: va, gid }, host);
        } else {
            self.host.tlbrera = self.host.tlbrera | ISTLBR_BIT;
            self.host.tlbrbadv = va;
            self.host.tlbrehi = va >> 13;
            host.raise_exception(ExceptionCode::Tlbr);
        }
        TranslationFault::NoMatch
    }

    /// Second-stage GPA→HPA translation (§4.1 "Second-level translation").
    /// On miss, always faults out to the host rather than falling back to
    /// an identity map — see the design ledger's resolution of the spec's
    /// flagged open question.
    fn translate_stage2(
        &mut self,
        gpa: u64,
        gva: u64,
        access: AccessType,
        stage1_prot: Prot,
        host: &mut dyn HostEnv,
    ) -> Result<(u64, Prot), TranslationFault> {
        let vpn = gpa >> 13;
        let Some(index) = self.tlb.search(GidFilter::Host, vpn, 0, gpa) else {
            self.lvz.trgp = gpa;
            let class = host.classify_gpa(gpa);
            let reason = match class {
                GpaClass::Iocsr => VmExitReason::Iocsr { addr: gpa, access: access.into() },
                GpaClass::Mmio | GpaClass::Ram => VmExitReason::Mmio { gpa, gva, access },
            };
            self.vm_exit(reason, host);
            return Err(TranslationFault::SecondLevelFault);
        };

        let entry = *self.tlb.entry(index);
        let half = entry.half_for(gpa);
        if let Err(fault) = check_permissions(half, access, 0) {
            host.raise_exception(fault.exception_code(access));
            return Err(fault);
        }

        let (hpa, stage2_prot) = compose(half, gpa, entry.misc.ps());
        Ok((hpa, stage1_prot.intersection(stage2_prot)))
    }
}

/// Bits `[63:VALEN]` must be all-0 or all-1 (B1).
fn is_canonical(va: u64) -> bool {
    let top = va >> VALEN;
    top == 0 || top == (u64::MAX >> VALEN)
}

fn check_permissions(half: TlbPte, access: AccessType, plv: u8) -> Result<(), TranslationFault> {
    if half.v() == 0 {
        return Err(TranslationFault::Invalid);
    }
    if access == AccessType::Store && half.d() == 0 {
        return Err(TranslationFault::Dirty);
    }
    if access == AccessType::Fetch && half.nx() == 1 {
        return Err(TranslationFault::Xi);
    }
    if access == AccessType::Load && half.nr() == 1 {
        return Err(TranslationFault::Ri);
    }

    let tlb_plv = half.plv();
    let privilege_ok = if half.rplv() == 1 { plv == tlb_plv } else { plv <= tlb_plv };
    if !privilege_ok {
        return Err(TranslationFault::Pe);
    }
    Ok(())
}

/// Step 6: compose `pa` from the matched half's `PPN` and the low bits of
/// `addr` below the page-size boundary, plus the granted `Prot` set.
fn compose(half: TlbPte, addr: u64, ps: u8) -> (u64, Prot) {
    let ps = u32::from(ps);
    let offset_mask = (1u64 << ps) - 1;
    let pa = (u64::from(half.ppn()) << ps) | (addr & offset_mask);

    let mut prot = Prot::READ;
    if half.d() == 1 {
        prot = prot | Prot::WRITE;
    }
    if half.nx() == 0 {
        prot = prot | Prot::EXEC;
    }
    (pa, prot)
}

impl From<AccessType> for crate::error::AccessKind {
    fn from(access: AccessType) -> Self {
        match access {
            AccessType::Load => Self::Read,
            AccessType::Store => Self::Write,
            AccessType::Fetch => Self::Read,
        }
    }
}
