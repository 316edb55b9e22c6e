//! Compile-time array geometry and other fixed constants.
//!
//! Grounded on the teacher's `pub const BASIC_PAGE_SIZE` / `ENTRIES_PER_TABLE`
//! placement (`arch/src/lib.rs`, `arch/src/x86_64/paging/mod.rs`): one flat
//! module of `pub const`s rather than a runtime-configurable settings struct,
//! since none of this varies after the vCPU is constructed.

/// Ways per STLB set.
pub const STLB_WAYS: usize = 8;
/// Sets in the STLB.
pub const STLB_SETS: usize = 256;
/// Total STLB entries (`STLB_WAYS * STLB_SETS`).
pub const STLB_ENTRIES: usize = STLB_WAYS * STLB_SETS;
/// Fully-associative MTLB entries.
pub const MTLB_ENTRIES: usize = 64;
/// Total entries in the unified TLB array. MTLB entries occupy indices
/// `[STLB_ENTRIES, TLB_MAX)`.
pub const TLB_MAX: usize = STLB_ENTRIES + MTLB_ENTRIES;

/// Width of the virtual-address field that must be canonical (bits above
/// this must be all-0 or all-1). 48 matches the common LoongArch64 VALEN.
pub const VALEN: u32 = 48;

/// Bit width of the `GSTAT.GID` field itself.
pub const GID_WIDTH: u32 = 8;
/// Largest GID this configuration actually supports. Deliberately smaller
/// than `2^GID_WIDTH - 1`: the field is 8 bits wide architecturally, but an
/// implementation only wires up enough GIDs for its configured maximum
/// guest count, and must reject guest-visible writes that set bits above
/// that (supplemented feature #3). `0` is reserved for the VMM/second-stage
/// tag and is not itself an assignable guest GID.
pub const MAX_GID: u8 = 15;

/// Number of `SAVE` scratch CSRs.
pub const NUM_SAVE: usize = 16;
/// Number of direct-mapped windows.
pub const NUM_DMW: usize = 4;

/// `EXCCODE_HVC`, the architectural exception code raised on every VM-exit.
pub const EXCCODE_HVC: u32 = 0x3f;
