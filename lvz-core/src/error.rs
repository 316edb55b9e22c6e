//! Idiomatic `Result`/enum error types standing in for the architecture's
//! integer fault codes, continuing the teacher's `PagingError` /
//! `IdTrackerError` pattern (`arch/src/x86_64/paging/mod.rs`,
//! `utils/src/collections/id/tracker.rs`).

use crate::csr::CsrIndex;
use crate::vmexit::{AccessType, ExceptionCode};

/// Which direction of CSR access a trapped instruction was performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    /// `csrxchg`; traps if either direction would.
    Exchange,
}

/// Faults from the Translation Engine (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationFault {
    /// Canonical-address check failed (B1).
    BadAddr,
    /// No TLB entry matched; drives the TLB-refill path.
    NoMatch,
    /// Matching entry has `V=0`.
    Invalid,
    /// Store to a non-dirty page.
    Dirty,
    /// Fetch from an `NX` page.
    Xi,
    /// Load from an `NR` page.
    Ri,
    /// Privilege check failed (`RPLV`).
    Pe,
    /// Stage-1 hit, stage-2 (GPA→HPA) miss that requires host intervention.
    SecondLevelFault,
}

impl TranslationFault {
    /// The architectural exception this fault surfaces as (§7, category 1).
    ///
    /// `BadAddr` and `Invalid` can be raised for any access type, so their
    /// exception code varies with it (`ADEF`/`ADEM`, `PIL`/`PIS`/`PIF`); the
    /// other variants are each already access-type-specific at the point
    /// they're raised (eg. `Dirty` only from a store), so `access` doesn't
    /// change their mapping.
    #[must_use]
    pub const fn exception_code(self, access: AccessType) -> ExceptionCode {
        match self {
            Self::BadAddr => match access {
                AccessType::Fetch => ExceptionCode::Adef,
                AccessType::Load | AccessType::Store => ExceptionCode::Adem,
            },
            Self::NoMatch => ExceptionCode::Tlbr,
            Self::Invalid => match access {
                AccessType::Load => ExceptionCode::Pil,
                AccessType::Store => ExceptionCode::Pis,
                AccessType::Fetch => ExceptionCode::Pif,
            },
            Self::Dirty => ExceptionCode::Pme,
            Self::Xi => ExceptionCode::Pnx,
            Self::Ri => ExceptionCode::Pnr,
            Self::Pe => ExceptionCode::Ppi,
            Self::SecondLevelFault => match access {
                AccessType::Fetch => ExceptionCode::Adef,
                AccessType::Load | AccessType::Store => ExceptionCode::Adem,
            },
        }
    }
}

/// Returned by the CSR Mediator when an access must trap (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsrAccessError {
    pub csr: CsrIndex,
    pub kind: AccessKind,
}

/// Category-4 (§7) internal invariant violations: guest-triggerable, never
/// fatal. The offending instruction becomes a no-op and the violation is
/// logged on the guest-error channel rather than propagated as a `Result`
/// the caller must handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestError {
    /// `lddir`/`ldpte` level outside `[1, 4]`.
    LddirLevelOutOfRange(u8),
    /// `GSTAT.GID` write exceeded [`crate::config::MAX_GID`].
    GidOutOfRange(u8),
}

/// Category-5 (§7) migration load failures. No partial state is ever
/// committed: [`crate::cpu::CpuState::load_state`] returns this before
/// mutating the destination `CpuState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationError {
    UnknownMajorVersion(u32),
    Truncated,
}
