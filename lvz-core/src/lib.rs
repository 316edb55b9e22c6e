//! Second-level address translation, GID/ASID-tagged TLB, dual CSR banks,
//! and the VM-entry/exit state machine for a LoongArch-style virtualization
//! extension.
//!
//! This crate is the MMU-and-privilege subsystem only. The instruction
//! decoder, interrupt controller wiring, device model, and migration
//! transport live outside it; this crate consumes only the small set of
//! collaborators in [`collaborators`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod collaborators;
pub mod config;
pub mod cpu;
pub mod csr;
pub mod error;
pub mod lvz;
pub mod serialize;
pub mod tlb;
pub mod translate;
pub mod vmexit;

pub use collaborators::{GpaClass, HostEnv};
pub use cpu::CpuState;
pub use error::{CsrAccessError, GuestError, MigrationError, TranslationFault};
pub use serialize::{LVZ_SUBSECTION_VERSION, MAJOR_VERSION, TLB_SUBSECTION_VERSION};
pub use vmexit::{AccessType, ExceptionCode, MmuIdx, VmExitCtx, VmExitReason};
