//! `CsrIndex`, the per-CSR guest trap policy table (§4.2), and the small
//! `GCFG`-gate vocabulary the mediator consults for the conditionally
//! trapped groups.
//!
//! `CsrIndex` is a field enum rather than a bare `u16` so that
//! [`CsrIndex::trap_policy`] is an exhaustive `match`: adding a CSR without
//! deciding its trap policy is a compile error, not a silent default-allow.

use crate::error::AccessKind;

/// Identifies one CSR (or one indexed member of a CSR array, eg. `SAVE[3]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsrIndex {
    Crmd,
    Prmd,
    Euen,
    Misc,
    Ecfg,
    Estat,
    Era,
    Badv,
    Badi,
    Eentry,

    Tlbidx,
    Tlbehi,
    Tlbelo0,
    Tlbelo1,
    Asid,
    Stlbps,
    Pgdl,
    Pgdh,
    Pgd,
    Pwcl,
    Pwch,
    Rvacfg,

    Tid,
    Tcfg,
    Tval,
    Cntc,
    Ticlr,

    Cpuid,
    Prcfg1,
    Prcfg2,
    Prcfg3,

    /// `SAVE[0..16]`.
    Save(u8),
    Llbctl,
    /// `DMW[0..4]`.
    Dmw(u8),

    Tlbrentry,
    Tlbrbadv,
    Tlbrera,
    Tlbrelo0,
    Tlbrelo1,
    Tlbrehi,
    Tlbrprmd,

    /// Implementation-defined machine-error block; opaque index.
    MachineError(u8),
    /// `IMPCTL*` block; opaque index.
    ImpCtl(u8),
    /// Debug block; opaque index.
    Debug(u8),

    /// LVZ control (§3, §6): the hypervisor's own view of `GSTAT`/`GCFG`/
    /// `GINTC`/`GCNTC`/`GTLBC`/`TRGP`, read through the ordinary CSR
    /// mediator rather than a side channel ("readable by the hypervisor via
    /// normal CSR reads of `TRGP`, `GSTAT`, ..."). None of these live in
    /// either [`crate::cpu::CsrBank`]; `CpuState::read_csr`/`write_csr`
    /// special-case them against `self.lvz` before falling through to the
    /// bank-backed path.
    Gstat,
    Gcfg,
    Gintc,
    Gcntc,
    Gtlbc,
    Trgp,
}

/// `GCFG` bit a conditionally-trapped CSR group is gated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcfgGate {
    /// `ESTAT` guest read gate (`GCFG.SITP`).
    Sitp,
    /// `ESTAT` guest write gate (`GCFG.SITO`).
    Sito,
    /// Timer-block guest read gate (`GCFG.TITP`).
    Titp,
    /// Timer-block guest write gate (`GCFG.TITO`).
    Tito,
}

/// One direction's trap decision for a CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapDecision {
    Allow,
    Trap,
    /// Allowed iff the named `GCFG` bit is set.
    Gated(GcfgGate),
}

/// Read and write trap decisions for a CSR, evaluated in guest mode only —
/// host mode always allows (§4.2: "In host mode, all CSRs are accessible
/// directly").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrTrapPolicy {
    pub read: TrapDecision,
    pub write: TrapDecision,
}

impl CsrTrapPolicy {
    const fn both(decision: TrapDecision) -> Self {
        Self { read: decision, write: decision }
    }

    pub(crate) const fn decision(&self, kind: AccessKind) -> TrapDecision {
        match kind {
            AccessKind::Read => self.read,
            AccessKind::Write => self.write,
            // csrxchg traps if either direction would (spec §4.2 table has
            // no exchange row; exchange is read-then-conditional-write, so
            // it must satisfy both).
            AccessKind::Exchange => match (self.read, self.write) {
                (TrapDecision::Trap, _) | (_, TrapDecision::Trap) => TrapDecision::Trap,
                (TrapDecision::Gated(g), _) | (_, TrapDecision::Gated(g)) => {
                    TrapDecision::Gated(g)
                }
                (TrapDecision::Allow, TrapDecision::Allow) => TrapDecision::Allow,
            },
        }
    }
}

impl CsrIndex {
    /// The §4.2 table, as an exhaustive match.
    #[must_use]
    pub const fn trap_policy(self) -> CsrTrapPolicy {
        use TrapDecision::{Allow, Gated, Trap};
        match self {
            Self::Crmd
            | Self::Prmd
            | Self::Euen
            | Self::Misc
            | Self::Ecfg
            | Self::Era
            | Self::Badv
            | Self::Badi
            | Self::Eentry
            | Self::Tlbidx
            | Self::Tlbehi
            | Self::Tlbelo0
            | Self::Tlbelo1
            | Self::Asid
            | Self::Stlbps
            | Self::Pgdl
            | Self::Pgdh
            | Self::Pgd
            | Self::Pwcl
            | Self::Pwch
            | Self::Rvacfg
            | Self::Save(_)
            | Self::Llbctl
            | Self::Dmw(_) => CsrTrapPolicy::both(Allow),

            Self::Estat => CsrTrapPolicy { read: Gated(GcfgGate::Sitp), write: Gated(GcfgGate::Sito) },

            Self::Tid | Self::Tcfg | Self::Tval | Self::Cntc => {
                CsrTrapPolicy { read: Gated(GcfgGate::Titp), write: Gated(GcfgGate::Tito) }
            }

            Self::Ticlr => CsrTrapPolicy::both(Trap),

            Self::Cpuid | Self::Prcfg1 | Self::Prcfg2 | Self::Prcfg3 => {
                CsrTrapPolicy { read: Allow, write: Trap }
            }

            Self::Tlbrentry
            | Self::Tlbrbadv
            | Self::Tlbrera
            | Self::Tlbrelo0
            | Self::Tlbrelo1
            | Self::Tlbrehi
            | Self::Tlbrprmd
            | Self::MachineError(_)
            | Self::ImpCtl(_)
            | Self::Debug(_) => CsrTrapPolicy::both(Trap),

            // LVZ control is the hypervisor's own state, never guest-visible
            // architecture; a guest executing `csrrd`/`csrwr` against any of
            // these always traps. `TRGP` is the one exception named by
            // invariant 6 ("read-only to guests"): guest reads are allowed,
            // guest writes still trap.
            Self::Gstat | Self::Gcfg | Self::Gintc | Self::Gcntc | Self::Gtlbc => {
                CsrTrapPolicy::both(Trap)
            }
            Self::Trgp => CsrTrapPolicy { read: Allow, write: Trap },
        }
    }

    /// Whether reading this CSR computes a value rather than returning a
    /// stored field (§4.2: "for the special cases `PGD`, `TVAL`, `CPUID`,
    /// the engine computes a value").
    #[must_use]
    pub const fn is_computed_read(self) -> bool {
        matches!(self, Self::Pgd | Self::Tval | Self::Cpuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticlr_always_traps() {
        let p = CsrIndex::Ticlr.trap_policy();
        assert_eq!(p.read, TrapDecision::Trap);
        assert_eq!(p.write, TrapDecision::Trap);
    }

    #[test]
    fn cpuid_read_only() {
        let p = CsrIndex::Cpuid.trap_policy();
        assert_eq!(p.read, TrapDecision::Allow);
        assert_eq!(p.write, TrapDecision::Trap);
    }

    #[test]
    fn estat_is_gated() {
        let p = CsrIndex::Estat.trap_policy();
        assert_eq!(p.read, TrapDecision::Gated(GcfgGate::Sitp));
        assert_eq!(p.write, TrapDecision::Gated(GcfgGate::Sito));
    }

    #[test]
    fn exchange_traps_if_either_direction_does() {
        let p = CsrIndex::Cpuid.trap_policy();
        assert_eq!(p.decision(AccessKind::Exchange), TrapDecision::Trap);
    }

    #[test]
    fn tlb_refill_block_always_traps() {
        assert_eq!(CsrIndex::Tlbrentry.trap_policy().read, TrapDecision::Trap);
        assert_eq!(CsrIndex::Tlbrprmd.trap_policy().write, TrapDecision::Trap);
    }
}
