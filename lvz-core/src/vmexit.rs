//! VM-exit reasons, the wire-stable exit context, and the handful of small
//! enums (`AccessType`, `MmuIdx`, `ExceptionCode`) shared across the engine.

use crate::error::AccessKind;
use crate::csr::CsrIndex;

/// Kind of memory access driving a translation or a trap decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Fetch,
    Load,
    Store,
}

/// Privilege index used by the translation engine. Matches the architectural
/// `KERNEL=0, USER=3, DA=4` encoding; `3` being skipped (`1`, `2`) mirrors the
/// real LoongArch PLV numbering and is not a typo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuIdx {
    Kernel = 0,
    User = 3,
    Da = 4,
}

/// Architectural exception codes the core can request via
/// [`crate::collaborators::HostEnv::raise_exception`].
///
/// Numeric values follow the `ECODE` field of `ESTAT` closely enough for
/// test purposes; the surrounding emulator owns the authoritative encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionCode {
    /// Address error, fetch (`ADEF`).
    Adef = 0x08,
    /// Address error, memory access (`ADEM`).
    Adem = 0x09,
    /// Page invalid, load (`PIL`).
    Pil = 0x01,
    /// Page invalid, store (`PIS`).
    Pis = 0x02,
    /// Page invalid, fetch (`PIF`).
    Pif = 0x03,
    /// Page modify exception (store to a non-dirty page).
    Pme = 0x04,
    /// Page non-executable.
    Pnx = 0x0b,
    /// Page non-readable.
    Pnr = 0x0c,
    /// Page privilege illegal.
    Ppi = 0x07,
    /// Instruction privilege error (guest-only instruction in host mode).
    Ipe = 0x0e,
    /// Instruction not existing (`hvcl` without LVZ).
    Ine = 0x0d,
    /// TLB refill (`NOMATCH` drives the refill path, see [`TranslationFault`](crate::error::TranslationFault)).
    Tlbr = 0x3e,
    /// Hypercall / VM-exit entry point (`EXCCODE_HVC`).
    Hvc = 0x3f,
}

/// Tagged VM-exit reason with per-reason payload.
///
/// Migration and any "what happened" query from the hypervisor use
/// [`VmExitReason::wire_code`] for the stable integer; in-process code
/// matches on the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitReason {
    Mmio { gpa: u64, gva: u64, access: AccessType },
    Int,
    Timer,
    Iocsr { addr: u64, access: AccessKind },
    Csrr { csr: CsrIndex },
    Csrw { csr: CsrIndex },
    Csrx { csr: CsrIndex },
    Hypercall { code: u32 },
    Cpucfg { index: u32 },
    Tlb { gva: u64, gid: u8 },
    Cache,
}

impl VmExitReason {
    /// The migration-stable integer encoding from spec's exit-reason table.
    #[must_use]
    pub const fn wire_code(&self) -> u32 {
        match self {
            Self::Mmio { .. } => 1,
            Self::Int => 2,
            Self::Timer => 3,
            Self::Iocsr { .. } => 4,
            Self::Csrr { .. } => 5,
            Self::Csrw { .. } => 6,
            Self::Csrx { .. } => 7,
            Self::Hypercall { .. } => 8,
            Self::Cpucfg { .. } => 9,
            Self::Tlb { .. } => 10,
            Self::Cache => 11,
        }
    }

    const fn gpa(&self) -> u64 {
        match self {
            Self::Mmio { gpa, .. } => *gpa,
            _ => 0,
        }
    }

    const fn gva(&self) -> u64 {
        match self {
            Self::Mmio { gva, .. } | Self::Tlb { gva, .. } => *gva,
            _ => 0,
        }
    }

    const fn gid(&self) -> u8 {
        match self {
            Self::Tlb { gid, .. } => *gid,
            _ => 0,
        }
    }

    const fn access_type_wire(&self) -> u32 {
        match self {
            Self::Mmio { access, .. } => match access {
                AccessType::Fetch => 0,
                AccessType::Load => 1,
                AccessType::Store => 2,
            },
            _ => 0,
        }
    }
}

/// Wire-format VM-exit context, as read by the hypervisor through normal CSR
/// reads of `TRGP`/`GSTAT`/the guest shadow registers (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmExitCtx {
    pub fault_gpa: u64,
    pub fault_gva: u64,
    pub gid: u8,
    pub exit_reason: u32,
    pub access_type: u32,
    pub is_tlb_refill: bool,
}

impl VmExitCtx {
    #[must_use]
    pub const fn from_reason(reason: &VmExitReason) -> Self {
        Self {
            fault_gpa: reason.gpa(),
            fault_gva: reason.gva(),
            gid: reason.gid(),
            exit_reason: reason.wire_code(),
            access_type: reason.access_type_wire(),
            is_tlb_refill: reason.wire_code() == VmExitReason::Tlb { gva: 0, gid: 0 }.wire_code(),
        }
    }
}
