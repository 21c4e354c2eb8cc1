//! Attribute header parse/emit (§3, §4.4, §6).
//!
//! Field layout is grounded on `formatters/src/ntfs/structures.rs`'s
//! `AttributeHeader` / `ResidentAttributeHeader` / `NonResidentAttributeHeader`
//! (there read via `#[repr(C, packed)]` + raw pointer cast); here the same
//! fields are read and written through [`Cursor`]/[`CursorMut`] so a
//! malformed attribute header returns [`NtfsError::BadFormat`] instead of
//! reading past the end of an unaligned packed struct.

use ntfs_core::{NtfsError, NtfsResult};

use super::cursor::{Cursor, CursorMut};
use super::runs::RunList;

pub const ATTR_HEADER_LEN: usize = 16;
pub const RESIDENT_HEADER_LEN: usize = ATTR_HEADER_LEN + 8;
pub const NONRESIDENT_HEADER_LEN: usize = ATTR_HEADER_LEN + 48;

/// `resident_flag` on a resident attribute: the value also participates in
/// a `$FILE_NAME` directory index.
pub const RESIDENT_FLAG_INDEXED: u8 = 0x01;

/// The attribute body: either inline bytes or a non-resident run list plus
/// the three size fields NTFS tracks for a non-resident stream.
#[derive(Debug, Clone)]
pub enum AttributeBody {
    Resident { data: Vec<u8>, indexed: bool },
    NonResident {
        starting_vcn: u64,
        runs: RunList,
        compression_unit: u16,
        allocated_size: u64,
        data_size: u64,
        initialized_size: u64,
    },
}

impl AttributeBody {
    pub fn is_resident(&self) -> bool {
        matches!(self, AttributeBody::Resident { .. })
    }

    /// Logical size of the stream: `value_length` for resident,
    /// `data_size` for non-resident.
    pub fn data_size(&self) -> u64 {
        match self {
            AttributeBody::Resident { data, .. } => data.len() as u64,
            AttributeBody::NonResident { data_size, .. } => *data_size,
        }
    }
}

/// One decoded attribute: header fields plus its body.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub type_code: u32,
    pub attribute_id: u16,
    pub name: String,
    pub flags: u16,
    pub body: AttributeBody,
}

impl Attribute {
    /// Parses one attribute starting at `offset` in `record`. Returns the
    /// attribute plus the offset of the next attribute header.
    pub fn parse(record: &[u8], offset: usize) -> NtfsResult<(Self, usize)> {
        let mut c = Cursor::at(record, offset);
        let type_code = c.read_u32()?;
        let record_length = c.read_u32()? as usize;
        if record_length < ATTR_HEADER_LEN || offset + record_length > record.len() {
            return Err(NtfsError::BadFormat(format!(
                "attribute at {offset} has invalid record_length {record_length}"
            )));
        }
        let non_resident = c.read_u8()?;
        let name_length = c.read_u8()? as usize;
        let name_offset = c.read_u16()? as usize;
        let flags = c.read_u16()?;
        let attribute_id = c.read_u16()?;

        let name = if name_length > 0 {
            let mut nc = Cursor::at(record, offset + name_offset);
            nc.read_utf16(name_length)?
        } else {
            String::new()
        };

        let body = if non_resident == 0 {
            let mut rc = Cursor::at(record, offset + ATTR_HEADER_LEN);
            let value_length = rc.read_u32()? as usize;
            let value_offset = rc.read_u16()? as usize;
            let indexed_flag = rc.read_u8()?;
            let data_start = offset + value_offset;
            if data_start + value_length > record.len() {
                return Err(NtfsError::BadFormat(
                    "resident attribute value extends past record".into(),
                ));
            }
            AttributeBody::Resident {
                data: record[data_start..data_start + value_length].to_vec(),
                indexed: indexed_flag & RESIDENT_FLAG_INDEXED != 0,
            }
        } else {
            let mut rc = Cursor::at(record, offset + ATTR_HEADER_LEN);
            let starting_vcn = rc.read_u64()?;
            let last_vcn = rc.read_u64()?;
            let data_runs_offset = rc.read_u16()? as usize;
            let compression_unit = rc.read_u16()?;
            rc.advance(4); // padding
            let allocated_size = rc.read_u64()?;
            let data_size = rc.read_u64()?;
            let initialized_size = rc.read_u64()?;

            let runs_start = offset + data_runs_offset;
            if runs_start > offset + record_length {
                return Err(NtfsError::BadFormat("data runs offset past attribute end".into()));
            }
            let runs_bytes = &record[runs_start..offset + record_length];
            let runs = RunList::from_bytes(runs_bytes, starting_vcn)?;
            if last_vcn != 0 && runs.highest_vcn() != last_vcn {
                return Err(NtfsError::BadFormat(format!(
                    "non-resident attribute last_vcn {last_vcn} disagrees with decoded runs"
                )));
            }
            AttributeBody::NonResident {
                starting_vcn,
                runs,
                compression_unit,
                allocated_size,
                data_size,
                initialized_size,
            }
        };

        Ok((
            Self { type_code, attribute_id, name, flags, body },
            offset + record_length,
        ))
    }

    /// Serializes this attribute to its on-disk form, 8-byte aligned as
    /// every attribute in an MFT record must be (§4.4 `insert_attr`).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut w = CursorMut::new(&mut out);
        w.write_u32(self.type_code);
        w.write_u32(0); // record_length placeholder, patched below
        let name_units = self.name.encode_utf16().count();

        match &self.body {
            AttributeBody::Resident { data, indexed } => {
                w.write_u8(0);
                w.write_u8(name_units as u8);
                let name_offset = RESIDENT_HEADER_LEN as u16;
                w.write_u16(name_offset);
                w.write_u16(self.flags);
                w.write_u16(self.attribute_id);
                w.write_u32(data.len() as u32);
                let value_offset = name_offset as usize + name_units * 2;
                w.write_u16(value_offset as u16);
                w.write_u8(if *indexed { RESIDENT_FLAG_INDEXED } else { 0 });
                w.write_u8(0);
                w.write_utf16(&self.name);
                w.pad_to(8);
                w.write_bytes(data);
            }
            AttributeBody::NonResident {
                starting_vcn,
                runs,
                compression_unit,
                allocated_size,
                data_size,
                initialized_size,
            } => {
                w.write_u8(1);
                w.write_u8(name_units as u8);
                let name_offset = NONRESIDENT_HEADER_LEN as u16;
                w.write_u16(name_offset);
                w.write_u16(self.flags);
                w.write_u16(self.attribute_id);
                w.write_u64(*starting_vcn);
                w.write_u64(runs.highest_vcn());
                let runs_offset = name_offset as usize + name_units * 2;
                w.write_u16(runs_offset as u16);
                w.write_u16(*compression_unit);
                w.write_bytes(&[0u8; 4]);
                w.write_u64(*allocated_size);
                w.write_u64(*data_size);
                w.write_u64(*initialized_size);
                w.write_utf16(&self.name);
                w.pad_to(8);
                w.write_bytes(&runs.to_bytes());
            }
        }
        w.pad_to(8);
        let len = out.len() as u32;
        out[4..8].copy_from_slice(&len.to_le_bytes());
        out
    }
}
