//! MFT record parse/emit and in-record attribute stream editing (§4.4,
//! `mi_*` operations).
//!
//! Header field layout is grounded on `formatters/src/ntfs/structures.rs`'s
//! `MftRecordHeader`; fixup handling is grounded on `mft_writer.rs`'s
//! inline USA logic, now shared through [`super::fixup`]. Attribute-stream
//! editing (`insert_attr`/`remove_attr`/`resize_attr`/`pack_runs`) has no
//! equivalent in the reference driver (it only ever builds one attribute at
//! a time into a freshly formatted record); it is written from the spec's
//! §4.4 contract in the same `Cursor`-based idiom as [`super::attribute`].

use ntfs_core::{NtfsError, NtfsResult};

use super::attribute::{Attribute, AttributeBody, ATTR_HEADER_LEN, NONRESIDENT_HEADER_LEN};
use super::constants::{ATTR_END, MFT_RECORD_BAD_SIGNATURE, MFT_RECORD_IN_USE, MFT_RECORD_IS_DIRECTORY, MFT_RECORD_SIGNATURE};
use super::cursor::Cursor;
use super::fixup;
use super::runs::RunList;

/// `(record number, sequence number)` pair NTFS uses to reference a file or
/// an MFT subrecord, catching use-after-free of a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MftRef {
    pub rno: u64,
    pub sequence_number: u16,
}

impl MftRef {
    pub const NONE: MftRef = MftRef { rno: 0, sequence_number: 0 };

    pub fn is_none(&self) -> bool {
        self.sequence_number == 0
    }

    pub fn to_raw(self) -> u64 {
        // Low 48 bits: record number (NTFS3_64BIT_CLUSTER left undecided per
        // spec's Open Questions; see DESIGN.md). High 16 bits: sequence number.
        (self.rno & 0x0000_FFFF_FFFF_FFFF) | ((self.sequence_number as u64) << 48)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self { rno: raw & 0x0000_FFFF_FFFF_FFFF, sequence_number: (raw >> 48) as u16 }
    }
}

const HEADER_LEN: usize = 48;

/// Computes `(usa_offset, usa_count, attrs_offset)` for a record of
/// `record_size` bytes. The USA always starts right after the fixed
/// header; the attribute stream starts right after the USA, 8-byte aligned.
fn layout(record_size: usize) -> (u16, u16, u16) {
    let usa_offset = HEADER_LEN as u16;
    let usa_count = fixup::usa_count_for_len(record_size);
    let attrs_offset = (usa_offset as usize + usa_count as usize * 2).div_ceil(8) * 8;
    (usa_offset, usa_count, attrs_offset as u16)
}

/// One parsed MFT record: header fields plus the decoded attribute stream.
pub struct MftRecord {
    pub rno: u64,
    pub sequence_number: u16,
    pub flags: u16,
    pub base_record: MftRef,
    pub next_attr_id: u16,
    record_size: usize,
    attrs_offset: u16,
    bytes_used: u32,
    attributes: Vec<Attribute>,
    dirty: bool,
    usn: u16,
}

impl MftRecord {
    /// Creates a blank, valid, in-use record for `rno`, bumping the
    /// sequence number (wrapping `0 -> 1`, §9 "sequence number wrap").
    pub fn format_new(rno: u64, prev_sequence_number: u16, is_directory: bool, record_size: usize) -> Self {
        let sequence_number = if prev_sequence_number == 0 { 1 } else { prev_sequence_number };
        let mut flags = MFT_RECORD_IN_USE;
        if is_directory {
            flags |= MFT_RECORD_IS_DIRECTORY;
        }
        let (_, _, attrs_offset) = layout(record_size);
        Self {
            rno,
            sequence_number,
            flags,
            base_record: MftRef::NONE,
            next_attr_id: 0,
            record_size,
            attrs_offset,
            bytes_used: attrs_offset as u32 + 8, // attribute stream + ATTR_END marker
            attributes: Vec::new(),
            dirty: true,
            usn: 0,
        }
    }

    /// Reads and validates a record image: applies fixup, checks the
    /// signature, and cross-checks the stored record number.
    pub fn read(buf: &mut [u8], expected_rno: u64, record_size: usize) -> NtfsResult<Self> {
        if buf.len() != record_size {
            return Err(NtfsError::BadFormat(format!(
                "record size mismatch: expected {record_size}, got {}",
                buf.len()
            )));
        }

        let mut c = Cursor::new(buf);
        let sig = c.read_bytes(4)?;
        if sig == MFT_RECORD_BAD_SIGNATURE {
            return Err(NtfsError::BadFormat(format!("record {expected_rno} marked BAAD")));
        }
        if sig != MFT_RECORD_SIGNATURE {
            return Err(NtfsError::BadFormat(format!("record {expected_rno} has bad signature")));
        }
        let usa_offset = c.read_u16()? as usize;
        let usa_count = c.read_u16()? as usize;

        fixup::remove(buf, usa_offset, usa_count)?;

        let mut c = Cursor::at(buf, 8);
        let _lsn = c.read_u64()?;
        let sequence_number = c.read_u16()?;
        let _link_count = c.read_u16()?;
        let attrs_offset = c.read_u16()?;
        let flags = c.read_u16()?;
        let bytes_used = c.read_u32()?;
        let _bytes_allocated = c.read_u32()?;
        let base_record = MftRef::from_raw(c.read_u64()?);
        let next_attr_id = c.read_u16()?;
        c.advance(2);
        let mft_record_number = c.read_u32()? as u64;

        if mft_record_number != expected_rno {
            return Err(NtfsError::BadFormat(format!(
                "record number mismatch: header says {mft_record_number}, expected {expected_rno}"
            )));
        }

        let mut attributes = Vec::new();
        let mut offset = attrs_offset as usize;
        while offset + 4 <= bytes_used as usize {
            let type_code = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
            if type_code == ATTR_END {
                break;
            }
            let (attr, next) = Attribute::parse(buf, offset)?;
            attributes.push(attr);
            offset = next;
        }

        Ok(Self {
            rno: expected_rno,
            sequence_number,
            flags,
            base_record,
            next_attr_id,
            record_size,
            attrs_offset,
            bytes_used,
            attributes,
            dirty: false,
            usn: 0,
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & MFT_RECORD_IN_USE != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & MFT_RECORD_IS_DIRECTORY != 0
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn find_attr(&self, type_code: u32, name: &str, id: Option<u16>) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.type_code == type_code && a.name == name && id.map_or(true, |id| a.attribute_id == id))
    }

    fn free_space(&self) -> usize {
        self.record_size - self.bytes_used as usize
    }

    /// Inserts a new attribute, 8-byte-aligning its encoded size, in
    /// canonical `(type, name, id)` order. Fails with `NoRoom` if it does
    /// not fit; callers recover by moving attributes into a subrecord via
    /// an `$ATTRIBUTE_LIST` (§4.4, §7 "no-room is recovered internally").
    pub fn insert_attr(&mut self, mut attr: Attribute) -> NtfsResult<u16> {
        let id = self.next_attr_id;
        attr.attribute_id = id;
        let encoded_len = attr.encode().len();
        if encoded_len % 8 != 0 {
            return Err(NtfsError::BadFormat("attribute did not encode 8-byte aligned".into()));
        }
        if encoded_len > self.free_space() {
            return Err(NtfsError::NoRoom(self.record_size as u32));
        }

        let insert_at = self
            .attributes
            .iter()
            .position(|a| (a.type_code, &a.name) > (attr.type_code, &attr.name))
            .unwrap_or(self.attributes.len());
        self.attributes.insert(insert_at, attr);
        self.next_attr_id = self.next_attr_id.wrapping_add(1);
        self.bytes_used += encoded_len as u32;
        self.dirty = true;
        Ok(id)
    }

    pub fn remove_attr(&mut self, type_code: u32, id: u16) -> NtfsResult<()> {
        let pos = self
            .attributes
            .iter()
            .position(|a| a.type_code == type_code && a.attribute_id == id)
            .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}:{id}")))?;
        let removed = self.attributes.remove(pos);
        self.bytes_used -= removed.encode().len() as u32;
        self.dirty = true;
        Ok(())
    }

    /// Replaces an attribute's body in place, re-encoding it and checking
    /// the record still fits (§4.4 `resize_attr`). Fails with `NoRoom` on
    /// grow-overflow; the caller is responsible for falling back to moving
    /// the attribute into a subrecord.
    pub fn resize_attr(&mut self, type_code: u32, id: u16, new: Attribute) -> NtfsResult<()> {
        let pos = self
            .attributes
            .iter()
            .position(|a| a.type_code == type_code && a.attribute_id == id)
            .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}:{id}")))?;
        let old_len = self.attributes[pos].encode().len();
        let new_len = new.encode().len();
        if new_len > old_len && new_len - old_len > self.free_space() {
            return Err(NtfsError::NoRoom(self.record_size as u32));
        }
        self.bytes_used = self.bytes_used - old_len as u32 + new_len as u32;
        self.attributes[pos] = new;
        self.dirty = true;
        Ok(())
    }

    /// Packs as much of `runs` (starting at `svcn`) as fits in this record's
    /// remaining free space into the named non-resident attribute's
    /// data-run tail, replacing whatever run list it currently has (§4.4
    /// `mi_*` contract). Returns the number of VCNs actually packed, which
    /// may be fewer than `runs` holds past `svcn` — the caller packs the
    /// rest into a further subrecord, starting its `$ATTRIBUTE_LIST` entry's
    /// `starting_vcn` at `svcn + packed_vcns` (§4.1, §4.4).
    pub fn pack_runs(&mut self, type_code: u32, id: u16, runs: &RunList, svcn: u64) -> NtfsResult<u64> {
        let pos = self
            .attributes
            .iter()
            .position(|a| a.type_code == type_code && a.attribute_id == id)
            .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}:{id}")))?;
        let (compression_unit, allocated_size, data_size, initialized_size) = match &self.attributes[pos].body {
            AttributeBody::NonResident { compression_unit, allocated_size, data_size, initialized_size, .. } => {
                (*compression_unit, *allocated_size, *data_size, *initialized_size)
            }
            AttributeBody::Resident { .. } => {
                return Err(NtfsError::BadFormat("pack_runs called on a resident attribute".into()));
            }
        };
        let name = self.attributes[pos].name.clone();
        let flags = self.attributes[pos].flags;
        let old_len = self.attributes[pos].encode().len();

        // Non-run bytes of the encoded attribute (header + name, 8-byte
        // aligned), mirroring the layout `Attribute::encode` writes before
        // the run bytes themselves.
        let name_units = name.encode_utf16().count();
        let fixed_len = (NONRESIDENT_HEADER_LEN + name_units * 2).div_ceil(8) * 8;
        let budget = self.free_space() + old_len;
        if budget <= fixed_len {
            return Err(NtfsError::NoRoom(self.record_size as u32));
        }
        let run_budget = budget - fixed_len;

        let mut buf = vec![0u8; run_budget];
        let (bytes_written, packed_vcns) = runs.pack(svcn, usize::MAX, &mut buf, run_budget)?;
        let packed = RunList::from_bytes(&buf[..bytes_written], svcn)?;

        let new_attr = Attribute {
            type_code,
            attribute_id: id,
            name,
            flags,
            body: AttributeBody::NonResident {
                starting_vcn: svcn,
                runs: packed,
                compression_unit,
                allocated_size,
                data_size,
                initialized_size,
            },
        };
        self.resize_attr(type_code, id, new_attr)?;
        Ok(packed_vcns)
    }

    /// True once any of `insert_attr`/`remove_attr`/`resize_attr` has
    /// changed this record since it was last read from or written to disk
    /// (§4.4 `write_inode`: "writes all dirty records").
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Returns the next update sequence number for this record, skipping
    /// the `0` and `0xFFFF` sentinels `fixup` reserves for "never applied"
    /// (§4.4 `write_inode`, "bumped by one on every write").
    pub fn next_usn(&mut self) -> u16 {
        let mut n = self.usn.wrapping_add(1);
        if n == 0 || n == 0xFFFF {
            n = 1;
        }
        self.usn = n;
        n
    }

    /// Serializes the record, applying fixup, ready for `BlockDevice::write_bytes`.
    pub fn write(&self, usn: u16) -> NtfsResult<Vec<u8>> {
        let mut buf = vec![0u8; self.record_size];
        buf[0..4].copy_from_slice(MFT_RECORD_SIGNATURE);
        let (usa_offset, usa_count, attrs_offset) = layout(self.record_size);
        buf[4..6].copy_from_slice(&usa_offset.to_le_bytes());
        buf[6..8].copy_from_slice(&usa_count.to_le_bytes());
        buf[8..16].copy_from_slice(&0u64.to_le_bytes()); // lsn
        buf[16..18].copy_from_slice(&self.sequence_number.to_le_bytes());
        buf[18..20].copy_from_slice(&1u16.to_le_bytes()); // link_count
        buf[20..22].copy_from_slice(&attrs_offset.to_le_bytes());
        buf[22..24].copy_from_slice(&self.flags.to_le_bytes());

        let mut offset = attrs_offset as usize;
        for attr in &self.attributes {
            let encoded = attr.encode();
            buf[offset..offset + encoded.len()].copy_from_slice(&encoded);
            offset += encoded.len();
        }
        buf[offset..offset + 4].copy_from_slice(&ATTR_END.to_le_bytes());
        offset += 8;

        buf[24..28].copy_from_slice(&(offset as u32).to_le_bytes()); // bytes_used
        buf[28..32].copy_from_slice(&(self.record_size as u32).to_le_bytes()); // bytes_allocated
        buf[32..40].copy_from_slice(&self.base_record.to_raw().to_le_bytes());
        buf[40..42].copy_from_slice(&self.next_attr_id.to_le_bytes());
        buf[44..48].copy_from_slice(&(self.rno as u32).to_le_bytes());

        fixup::apply(&mut buf, usa_offset as usize, usa_count as usize, usn)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attribute::AttributeBody;
    use crate::ntfs::constants::{ATTR_DATA, ATTR_FILE_NAME};

    fn sample_attr(id_hint: &str) -> Attribute {
        Attribute {
            type_code: ATTR_FILE_NAME,
            attribute_id: 0,
            name: id_hint.to_string(),
            flags: 0,
            body: AttributeBody::Resident { data: vec![1, 2, 3, 4], indexed: false },
        }
    }

    #[test]
    fn format_new_wraps_sequence_number_zero_to_one() {
        let rec = MftRecord::format_new(5, 0, false, 1024);
        assert_eq!(rec.sequence_number, 1);
    }

    #[test]
    fn write_then_read_round_trips_attributes() {
        let mut rec = MftRecord::format_new(12, 3, true, 1024);
        rec.insert_attr(sample_attr("")).unwrap();
        let bytes = rec.write(1).unwrap();

        let mut buf = bytes;
        let parsed = MftRecord::read(&mut buf, 12, 1024).unwrap();
        assert_eq!(parsed.sequence_number, 3);
        assert!(parsed.is_directory());
        assert_eq!(parsed.attributes().len(), 1);
        assert_eq!(parsed.attributes()[0].type_code, ATTR_FILE_NAME);
    }

    #[test]
    fn record_number_mismatch_is_bad_format() {
        let rec = MftRecord::format_new(12, 1, false, 1024);
        let mut bytes = rec.write(1).unwrap();
        assert!(matches!(
            MftRecord::read(&mut bytes, 99, 1024),
            Err(NtfsError::BadFormat(_))
        ));
    }

    #[test]
    fn insert_attr_fails_with_no_room_when_record_full() {
        let mut rec = MftRecord::format_new(1, 1, false, 64);
        let big = Attribute {
            type_code: ATTR_FILE_NAME,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::Resident { data: vec![0u8; 200], indexed: false },
        };
        assert!(matches!(rec.insert_attr(big), Err(NtfsError::NoRoom(_))));
    }

    #[test]
    fn remove_attr_frees_space_for_reinsertion() {
        let mut rec = MftRecord::format_new(1, 1, false, 128);
        let id = rec.insert_attr(sample_attr("")).unwrap();
        rec.remove_attr(ATTR_FILE_NAME, id).unwrap();
        assert!(rec.find_attr(ATTR_FILE_NAME, "", None).is_none());
    }

    #[test]
    fn pack_runs_replaces_the_attribute_tail_and_reports_covered_vcns() {
        use crate::ntfs::runs::Run;

        let mut rec = MftRecord::format_new(1, 1, false, 1024);
        let mut runs = RunList::default();
        runs.append(Some(100), 10);
        let attr = Attribute {
            type_code: ATTR_DATA,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::NonResident {
                starting_vcn: 0,
                runs: RunList::default(),
                compression_unit: 0,
                allocated_size: 0,
                data_size: 0,
                initialized_size: 0,
            },
        };
        let id = rec.insert_attr(attr).unwrap();

        let packed_vcns = rec.pack_runs(ATTR_DATA, id, &runs, 0).unwrap();
        assert_eq!(packed_vcns, 10);

        let found = rec.find_attr(ATTR_DATA, "", Some(id)).unwrap();
        match &found.body {
            AttributeBody::NonResident { runs, starting_vcn, .. } => {
                assert_eq!(*starting_vcn, 0);
                assert_eq!(runs.runs(), &[Run { vcn: 0, lcn: Some(100), length: 10 }]);
            }
            _ => panic!("expected non-resident"),
        }
    }

    #[test]
    fn pack_runs_on_a_resident_attribute_is_bad_format() {
        let mut rec = MftRecord::format_new(1, 1, false, 1024);
        let id = rec.insert_attr(sample_attr("")).unwrap();
        assert!(matches!(
            rec.pack_runs(ATTR_FILE_NAME, id, &RunList::default(), 0),
            Err(NtfsError::BadFormat(_))
        ));
    }

    #[test]
    fn mft_ref_round_trips_through_raw_form() {
        let r = MftRef { rno: 0x1234, sequence_number: 7 };
        assert_eq!(MftRef::from_raw(r.to_raw()), r);
    }

    #[test]
    fn bad_signature_rejected() {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(b"OOPS");
        assert!(matches!(
            MftRecord::read(&mut buf, 0, 1024),
            Err(NtfsError::BadFormat(_))
        ));
    }
}
