//! The State Serializer (§4.5): the migratable image of a [`CpuState`] —
//! both CSR banks, the TLB array, and the LVZ control block — laid out as a
//! flat, versioned byte stream.
//!
//! Field order and widths are fixed per version; a reader rejects an
//! unknown *major* version outright but tolerates additive *subsection*
//! versions (a subsection grew new trailing fields since the image was
//! written). This mirrors how the rest of the core treats a "read" as
//! all-or-nothing (§7, category 5: "no partial state is ever committed").
//!
//! Per-field packing reuses [`crate::cpu::read_csr_from`]/`write_csr_into` —
//! the same code path the CSR Mediator uses — rather than re-deriving each
//! bitfield register's byte layout a second time here.

use alloc::vec::Vec;

use crate::config::{NUM_DMW, NUM_SAVE, TLB_MAX};
use crate::cpu::{read_csr_from, write_csr_into, CpuState, CsrBank};
use crate::csr::CsrIndex;
use crate::error::MigrationError;
use crate::lvz::{Gcfg, Gstat, Gtlbc, LvzBlock};
use crate::tlb::{TlbArray, TlbEntry, TlbMisc, TlbPte};
use crate::vmexit::VmExitCtx;

/// Base CPU image version. Bump on any field-list change, never on
/// reordering (§6, "Persisted state").
pub const MAJOR_VERSION: u32 = 2;
/// TLB subsection version.
pub const TLB_SUBSECTION_VERSION: u32 = 0;
/// LVZ subsection version.
pub const LVZ_SUBSECTION_VERSION: u32 = 1;

/// The fixed field order for one [`CsrBank`] (§3), excluding the three
/// computed-read registers (`PGD`, `TVAL`, `CPUID`), which have no storage
/// of their own to migrate.
fn bank_field_order() -> impl Iterator<Item = CsrIndex> {
    const FIXED: &[CsrIndex] = &[
        CsrIndex::Crmd,
        CsrIndex::Prmd,
        CsrIndex::Euen,
        CsrIndex::Misc,
        CsrIndex::Ecfg,
        CsrIndex::Estat,
        CsrIndex::Era,
        CsrIndex::Badv,
        CsrIndex::Badi,
        CsrIndex::Eentry,
        CsrIndex::Tlbidx,
        CsrIndex::Tlbehi,
        CsrIndex::Tlbelo0,
        CsrIndex::Tlbelo1,
        CsrIndex::Asid,
        CsrIndex::Stlbps,
        CsrIndex::Pgdl,
        CsrIndex::Pgdh,
        CsrIndex::Pwcl,
        CsrIndex::Pwch,
        CsrIndex::Tlbrentry,
        CsrIndex::Tlbrbadv,
        CsrIndex::Tlbrera,
        CsrIndex::Tlbrelo0,
        CsrIndex::Tlbrelo1,
        CsrIndex::Tlbrehi,
        CsrIndex::Tlbrprmd,
        CsrIndex::Tid,
        CsrIndex::Tcfg,
        CsrIndex::Cntc,
        CsrIndex::Ticlr,
        CsrIndex::Llbctl,
        CsrIndex::Rvacfg,
        CsrIndex::Prcfg1,
        CsrIndex::Prcfg2,
        CsrIndex::Prcfg3,
        CsrIndex::MachineError(0),
        CsrIndex::ImpCtl(0),
        CsrIndex::Debug(0),
    ];
    FIXED
        .iter()
        .copied()
        .chain((0..NUM_DMW as u8).map(CsrIndex::Dmw))
        .chain((0..NUM_SAVE as u8).map(CsrIndex::Save))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MigrationError> {
        let end = self.pos.checked_add(n).ok_or(MigrationError::Truncated)?;
        let slice = self.bytes.get(self.pos..end).ok_or(MigrationError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, MigrationError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, MigrationError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, MigrationError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn bool(&mut self) -> Result<bool, MigrationError> {
        Ok(self.u8()? != 0)
    }
}

fn put_u32(out: &mut Vec<u8>, val: u32) {
    out.extend_from_slice(&val.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, val: u64) {
    out.extend_from_slice(&val.to_le_bytes());
}

fn put_bool(out: &mut Vec<u8>, val: bool) {
    out.push(u8::from(val));
}

fn write_bank(out: &mut Vec<u8>, bank: &CsrBank) {
    for csr in bank_field_order() {
        put_u64(out, read_csr_from(bank, csr));
    }
}

fn read_bank(r: &mut Reader) -> Result<CsrBank, MigrationError> {
    let mut bank = CsrBank::default();
    for csr in bank_field_order() {
        let val = r.u64()?;
        write_csr_into(&mut bank, csr, val);
    }
    Ok(bank)
}

impl CpuState {
    /// Serializes the full migratable image (§4.5): both CSR banks (the
    /// guest subsection only when `cpucfg2.LVZ` is set), the TLB array, and
    /// the LVZ block.
    #[must_use]
    pub fn serialize_state(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u32(&mut out, MAJOR_VERSION);
        put_u32(&mut out, TLB_SUBSECTION_VERSION);
        put_u32(&mut out, LVZ_SUBSECTION_VERSION);

        write_bank(&mut out, &self.host);

        put_bool(&mut out, self.cpucfg2_lvz);
        if self.cpucfg2_lvz {
            write_bank(&mut out, &self.guest);
        }

        for i in 0..TLB_MAX {
            let entry = self.tlb.entry(i);
            put_u64(&mut out, u64::from_le_bytes(entry.misc.into_bytes()));
            put_u64(&mut out, u64::from_le_bytes(entry.entry0.into_bytes()));
            put_u64(&mut out, u64::from_le_bytes(entry.entry1.into_bytes()));
        }

        put_u64(&mut out, u64::from_le_bytes(self.lvz.gstat.into_bytes()));
        put_u64(&mut out, u64::from_le_bytes(self.lvz.gcfg.into_bytes()));
        put_u32(&mut out, self.lvz.gintc);
        put_u64(&mut out, self.lvz.gcntc);
        put_u64(&mut out, u64::from_le_bytes(self.lvz.gtlbc.into_bytes()));
        put_u64(&mut out, self.lvz.trgp);
        put_bool(&mut out, self.lvz.lvz_enabled);

        let ctx = self.lvz.vm_exit_ctx;
        put_u64(&mut out, ctx.fault_gpa);
        put_u64(&mut out, ctx.fault_gva);
        out.push(ctx.gid);
        put_u32(&mut out, ctx.exit_reason);
        put_u32(&mut out, ctx.access_type);
        put_bool(&mut out, ctx.is_tlb_refill);

        out
    }

    /// Loads `bytes` into `self`, replacing every migratable field in one
    /// shot. Rejects an unknown major version or a truncated buffer
    /// *before* touching `self` (§7, category 5: "no partial state is ever
    /// committed"); a subsection version newer than the ones named above is
    /// accepted as long as this build's fixed prefix still parses — any
    /// trailing additive fields a newer writer appended are simply left
    /// unread.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), MigrationError> {
        let mut r = Reader::new(bytes);
        let major = r.u32()?;
        if major != MAJOR_VERSION {
            return Err(MigrationError::UnknownMajorVersion(major));
        }
        let _tlb_subsection_version = r.u32()?;
        let _lvz_subsection_version = r.u32()?;

        let host = read_bank(&mut r)?;
        let guest_present = r.bool()?;
        let guest = if guest_present { read_bank(&mut r)? } else { CsrBank::default() };

        let mut tlb = TlbArray::new();
        for i in 0..TLB_MAX {
            let misc = TlbMisc::from_bytes(r.u64()?.to_le_bytes());
            let entry0 = TlbPte::from_bytes(r.u64()?.to_le_bytes());
            let entry1 = TlbPte::from_bytes(r.u64()?.to_le_bytes());
            *tlb.entry_mut(i) = TlbEntry { misc, entry0, entry1 };
        }

        let gstat = Gstat::from_bytes(r.u64()?.to_le_bytes());
        let gcfg = Gcfg::from_bytes(r.u64()?.to_le_bytes());
        let gintc = r.u32()?;
        let gcntc = r.u64()?;
        let gtlbc = Gtlbc::from_bytes(r.u64()?.to_le_bytes());
        let trgp = r.u64()?;
        let lvz_enabled = r.bool()?;

        let fault_gpa = r.u64()?;
        let fault_gva = r.u64()?;
        let gid = r.u8()?;
        let exit_reason = r.u32()?;
        let access_type = r.u32()?;
        let is_tlb_refill = r.bool()?;
        let vm_exit_ctx = VmExitCtx { fault_gpa, fault_gva, gid, exit_reason, access_type, is_tlb_refill };

        // Nothing above has mutated `self`: a truncated or malformed buffer
        // fails out via `?` before this point, so a rejected load never
        // leaves `self` in a partially-updated state.
        self.host = host;
        self.guest = guest;
        self.cpucfg2_lvz = guest_present;
        self.tlb = tlb;
        self.lvz = LvzBlock { gstat, gcfg, gintc, gcntc, gtlbc, trgp, lvz_enabled, vm_exit_ctx };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r1_round_trip_reproduces_every_field() {
        let mut cpu = CpuState::new(3);
        cpu.host.eentry = 0xdead_beef;
        cpu.guest.eentry = 0xcafe_babe;
        cpu.lvz.lvz_enabled = true;
        cpu.lvz.trgp = 0x1234;
        {
            let entry = cpu.tlb.entry_mut(5);
            entry.misc.set_e(1);
            entry.misc.set_gid(3);
            entry.entry0.set_ppn(0xaa);
        }

        let bytes = cpu.serialize_state();
        let mut restored = CpuState::new(0);
        restored.load_state(&bytes).unwrap();

        assert_eq!(restored.host, cpu.host);
        assert_eq!(restored.guest, cpu.guest);
        assert_eq!(restored.lvz, cpu.lvz);
        for i in 0..TLB_MAX {
            assert_eq!(restored.tlb.entry(i), cpu.tlb.entry(i));
        }
    }

    #[test]
    fn s6_migration_round_trip_with_mixed_gid_entries() {
        let mut cpu = CpuState::new(0);
        cpu.lvz.lvz_enabled = true;
        for (idx, gid) in [(0usize, 0u8), (1, 0), (2, 5), (3, 5)] {
            let entry = cpu.tlb.entry_mut(idx);
            entry.misc.set_e(1);
            entry.misc.set_gid(gid);
            entry.misc.set_vppn(idx as u64 * 0x10);
        }

        let bytes = cpu.serialize_state();
        let mut restored = CpuState::new(7);
        restored.load_state(&bytes).unwrap();

        for idx in 0..4 {
            assert_eq!(restored.tlb.entry(idx), cpu.tlb.entry(idx));
        }
        assert_eq!(restored.lvz, cpu.lvz);
    }

    #[test]
    fn rejects_unknown_major_version() {
        let cpu = CpuState::new(0);
        let mut bytes = cpu.serialize_state();
        bytes[0] = 0xff;
        let mut restored = CpuState::new(0);
        let before = restored.host.eentry;
        let err = restored.load_state(&bytes).unwrap_err();
        assert!(matches!(err, MigrationError::UnknownMajorVersion(_)));
        assert_eq!(restored.host.eentry, before, "rejected load must not mutate destination state");
    }

    #[test]
    fn truncated_buffer_is_rejected_without_mutation() {
        let cpu = CpuState::new(0);
        let bytes = cpu.serialize_state();
        let mut restored = CpuState::new(0);
        restored.host.eentry = 0x42;
        let err = restored.load_state(&bytes[..10]).unwrap_err();
        assert_eq!(err, MigrationError::Truncated);
        assert_eq!(restored.host.eentry, 0x42);
    }

    #[test]
    fn guest_bank_subsection_is_skipped_without_lvz_support() {
        let mut cpu = CpuState::new(0);
        cpu.cpucfg2_lvz = false;
        cpu.guest.eentry = 0x9999;

        let bytes = cpu.serialize_state();
        let mut restored = CpuState::new(0);
        restored.guest.eentry = 0x1111;
        restored.load_state(&bytes).unwrap();

        assert_eq!(restored.guest, CsrBank::default(), "guest bank is not carried when cpucfg2.LVZ is unset");
    }
}
