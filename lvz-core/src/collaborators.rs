//! The four external primitives this core consumes (§1) and the GPA
//! classification policy (§4.1) supplied by the surrounding machine.
//!
//! Per the "cycle-free ownership" design note, `CpuState` never stores a
//! `HostEnv`: it is threaded through as `&mut dyn HostEnv` on every call that
//! needs it, so the CPU state itself never holds a reference back to the
//! machine that embeds it.

use crate::vmexit::ExceptionCode;

/// How a GPA should be treated by the second-level translator (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpaClass {
    /// Backed by RAM; a second-level TLB miss may be filled.
    Ram,
    /// Device MMIO window; a second-level miss must trap to the host.
    Mmio,
    /// IOCSR address space; traps through the IOCSR gate, not the MMIO one.
    Iocsr,
}

/// The host emulator's side of the contract (§1, §6).
pub trait HostEnv {
    /// Request the architectural exception pipeline for `code`.
    fn raise_exception(&mut self, code: ExceptionCode);

    /// Invalidate cached host-side mappings for the given mmu-idx mask.
    fn flush_translation_cache(&mut self, mmu_idx_mask: u32);

    /// Draw a 32-bit value from the guest-random entropy source used for TLB
    /// victim selection (§4.3). Routing this through a collaborator rather
    /// than `core`-provided randomness keeps replacement deterministic in
    /// tests.
    fn guest_random32(&mut self) -> u32;

    /// Read a 64-bit little-endian word from host physical memory at `addr`.
    fn load_phys_u64(&mut self, addr: u64) -> u64;

    /// Classify a GPA for the second-level translator (§4.1). Default
    /// treats everything as RAM, matching a flat-memory test harness; a real
    /// machine overrides this with its MMIO/IOCSR window list.
    fn classify_gpa(&self, _gpa: u64) -> GpaClass {
        GpaClass::Ram
    }
}
