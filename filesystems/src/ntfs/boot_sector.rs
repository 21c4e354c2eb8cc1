//! BIOS Parameter Block / boot sector parsing (§3, §6).
//!
//! Field layout is grounded on `formatters/src/ntfs/structures.rs`'s
//! `NtfsBootSector`. That version is a `#[repr(C, packed)]` struct read with
//! a raw pointer cast, which is sound only because the byte buffer backing
//! it happens to come from a `Vec<u8>` read at a known offset; this version
//! parses field-by-field through [`Cursor`] instead, so the same logic works
//! whether the boot sector arrived via `BlockDevice::read_bytes` or a test
//! fixture slice of the wrong length.

use ntfs_core::{NtfsError, NtfsResult};

use super::constants::NTFS_OEM_ID;
use super::cursor::Cursor;

pub const BOOT_SECTOR_SIZE: usize = 512;
const BOOT_SIGNATURE: u16 = 0xAA55;

/// Parsed BIOS Parameter Block plus the NTFS-specific extension fields.
#[derive(Debug, Clone, Copy)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub media_descriptor: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mftmirr_lcn: u64,
    pub clusters_per_mft_record: i8,
    pub clusters_per_index_buffer: i8,
    pub volume_serial: u64,
}

impl BootSector {
    /// Parses and validates a 512-byte boot sector.
    pub fn parse(buf: &[u8]) -> NtfsResult<Self> {
        if buf.len() < BOOT_SECTOR_SIZE {
            return Err(NtfsError::BadFormat(format!(
                "boot sector buffer too short: {} bytes",
                buf.len()
            )));
        }

        let mut c = Cursor::at(buf, 3);
        let oem_id = c.read_bytes(8)?;
        if oem_id != NTFS_OEM_ID {
            return Err(NtfsError::BadFormat("not an NTFS volume (bad OEM id)".into()));
        }

        let bytes_per_sector = c.read_u16()?;
        let sectors_per_cluster = c.read_u8()?;
        c.seek(0x1C);
        let _hidden_sectors = c.read_u32()?;
        c.seek(0x28);
        let total_sectors = c.read_u64()?;
        let mft_lcn = c.read_u64()?;
        let mftmirr_lcn = c.read_u64()?;
        let clusters_per_mft_record = c.read_u8()? as i8;
        c.seek(0x44);
        let clusters_per_index_buffer = c.read_u8()? as i8;
        c.seek(0x48);
        let volume_serial = c.read_u64()?;

        let mut sig = Cursor::at(buf, BOOT_SECTOR_SIZE - 2);
        let signature = sig.read_u16()?;
        if signature != BOOT_SIGNATURE {
            return Err(NtfsError::BadFormat("invalid boot sector signature".into()));
        }

        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return Err(NtfsError::BadFormat(format!(
                "invalid bytes per sector: {bytes_per_sector}"
            )));
        }
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(NtfsError::BadFormat(format!(
                "invalid sectors per cluster: {sectors_per_cluster}"
            )));
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            media_descriptor: 0xF8,
            total_sectors,
            mft_lcn,
            mftmirr_lcn,
            clusters_per_mft_record,
            clusters_per_index_buffer,
            volume_serial,
        })
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// MFT record size in bytes. A positive `clusters_per_mft_record` counts
    /// whole clusters; a negative value is `2^|n|` bytes, used whenever one
    /// MFT record would otherwise be smaller than a cluster.
    pub fn mft_record_size(&self) -> u32 {
        if self.clusters_per_mft_record > 0 {
            self.clusters_per_mft_record as u32 * self.bytes_per_cluster()
        } else {
            1u32 << (-self.clusters_per_mft_record) as u32
        }
    }

    /// Index allocation buffer size in bytes, same sign convention as
    /// [`Self::mft_record_size`].
    pub fn index_buffer_size(&self) -> u32 {
        if self.clusters_per_index_buffer > 0 {
            self.clusters_per_index_buffer as u32 * self.bytes_per_cluster()
        } else {
            1u32 << (-self.clusters_per_index_buffer) as u32
        }
    }

    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_boot_sector() -> Vec<u8> {
        let mut buf = vec![0u8; BOOT_SECTOR_SIZE];
        buf[3..11].copy_from_slice(NTFS_OEM_ID);
        buf[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        buf[0x0D] = 8; // sectors per cluster
        buf[0x28..0x30].copy_from_slice(&2_000_000u64.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&4u64.to_le_bytes()); // mft_lcn
        buf[0x38..0x40].copy_from_slice(&100_000u64.to_le_bytes()); // mftmirr_lcn
        buf[0x40] = (-10i8) as u8; // 2^10 = 1024-byte MFT records
        buf[0x44] = (-12i8) as u8; // 2^12 = 4096-byte index buffers
        buf[0x48..0x50].copy_from_slice(&0x1234_5678_9ABC_DEF0u64.to_le_bytes());
        buf[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        buf
    }

    #[test]
    fn parses_valid_boot_sector() {
        let buf = sample_boot_sector();
        let bs = BootSector::parse(&buf).unwrap();
        assert_eq!(bs.bytes_per_sector, 512);
        assert_eq!(bs.sectors_per_cluster, 8);
        assert_eq!(bs.bytes_per_cluster(), 4096);
        assert_eq!(bs.mft_lcn, 4);
        assert_eq!(bs.mft_record_size(), 1024);
        assert_eq!(bs.index_buffer_size(), 4096);
        assert_eq!(bs.total_clusters(), 250_000);
    }

    #[test]
    fn rejects_bad_oem_id() {
        let mut buf = sample_boot_sector();
        buf[3..11].copy_from_slice(b"FAT32   ");
        assert!(matches!(BootSector::parse(&buf), Err(NtfsError::BadFormat(_))));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buf = sample_boot_sector();
        buf[510..512].copy_from_slice(&[0, 0]);
        assert!(matches!(BootSector::parse(&buf), Err(NtfsError::BadFormat(_))));
    }

    #[test]
    fn rejects_non_power_of_two_cluster_size() {
        let mut buf = sample_boot_sector();
        buf[0x0D] = 3;
        assert!(matches!(BootSector::parse(&buf), Err(NtfsError::BadFormat(_))));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let buf = vec![0u8; 100];
        assert!(matches!(BootSector::parse(&buf), Err(NtfsError::BadFormat(_))));
    }

    #[test]
    fn positive_clusters_per_mft_record_counts_whole_clusters() {
        let mut buf = sample_boot_sector();
        buf[0x40] = 2;
        let bs = BootSector::parse(&buf).unwrap();
        assert_eq!(bs.mft_record_size(), 2 * 4096);
    }
}
