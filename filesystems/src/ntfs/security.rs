//! EA store and `$Secure` descriptor store (§4.7).
//!
//! No file in the reference driver implements extended attributes or
//! `$Secure` deduplication (its NTFS support is read/format-oriented, not
//! a POSIX xattr layer), so this module follows the spec's §4.7 contract
//! directly. The `EA_FULL` record layout and DWORD alignment follow the
//! same manual little-endian idiom as [`super::attribute`]. `$SII`/`$SDH`
//! reuse [`super::index::IndexTree`] rather than a bare map, and descriptor
//! bytes live in an in-memory `$SDS` byte stream addressed the same way the
//! real stream is: a 16-byte-aligned run of `(hash, security_id, offset,
//! length)` headers each immediately followed by the descriptor bytes they
//! describe.

use ntfs_core::{NtfsError, NtfsResult};

use super::constants::MAX_EA_DATA_SIZE;
use super::cursor::{Cursor, CursorMut};
use super::index::{collate_security_hash, collate_ulong, IndexEntry, IndexTree};
use super::record::MftRef;

/// `set_ea` creation policy, named after the POSIX xattr flags they mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetEaFlags {
    /// No constraint: create or overwrite.
    None,
    /// Fail if the name already exists.
    Create,
    /// Fail if the name does not already exist.
    Replace,
}

/// One decoded `EA_FULL` record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EaEntry {
    name: String,
    value: Vec<u8>,
}

fn encoded_len(name: &str, value: &[u8]) -> usize {
    // flags(1) + name_len(1) + value_len(2) + name + NUL + value, DWORD aligned.
    (4 + name.len() + 1 + value.len()).div_ceil(4) * 4
}

/// The decoded `$EA` payload: an ordered list of name/value entries, capped
/// at [`MAX_EA_DATA_SIZE`] total.
#[derive(Debug, Clone, Default)]
pub struct EaStore {
    entries: Vec<EaEntry>,
}

impl EaStore {
    pub fn decode(data: &[u8]) -> NtfsResult<Self> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= data.len() {
            let mut c = Cursor::at(data, pos);
            let _flags = c.read_u8()?;
            let name_len = c.read_u8()? as usize;
            let value_len = c.read_u16()? as usize;
            let name = c.read_bytes(name_len)?.to_vec();
            let _nul = c.read_u8()?;
            let value = c.read_bytes(value_len)?.to_vec();
            entries.push(EaEntry {
                name: String::from_utf8(name)
                    .map_err(|_| NtfsError::BadFormat("EA name is not valid UTF-8".into()))?,
                value,
            });
            let entry_len = encoded_len(&entries.last().unwrap().name, &entries.last().unwrap().value);
            pos += entry_len;
        }
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for e in &self.entries {
            let mut w = CursorMut::new(&mut out);
            w.write_u8(0);
            w.write_u8(e.name.len() as u8);
            w.write_u16(e.value.len() as u16);
            w.write_bytes(e.name.as_bytes());
            w.write_u8(0);
            w.write_bytes(&e.value);
            w.pad_to(4);
        }
        out
    }

    pub fn get_ea(&self, name: &str) -> Option<&[u8]> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.value.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_packed_size(&self) -> usize {
        self.entries.iter().map(|e| encoded_len(&e.name, &e.value)).sum()
    }

    /// Sets, creates, replaces, or deletes one EA entry (§4.7 `set_ea`).
    /// An empty `value` with [`SetEaFlags::Replace`] deletes the entry.
    pub fn set_ea(&mut self, name: &str, value: Vec<u8>, flags: SetEaFlags) -> NtfsResult<()> {
        let existing = self.entries.iter().position(|e| e.name == name);

        match (existing, flags) {
            (None, SetEaFlags::Replace) => {
                return Err(NtfsError::NotFound(format!("ea {name}")));
            }
            (Some(_), SetEaFlags::Create) => {
                return Err(NtfsError::Exists(format!("ea {name}")));
            }
            _ => {}
        }

        if let Some(pos) = existing {
            if flags == SetEaFlags::Replace && value.is_empty() {
                self.entries.remove(pos);
                return Ok(());
            }
            self.entries[pos].value = value;
        } else {
            self.entries.push(EaEntry { name: name.to_string(), value });
        }

        if self.total_packed_size() > MAX_EA_DATA_SIZE as usize {
            return Err(NtfsError::TooLarge(format!(
                "EA payload exceeds {MAX_EA_DATA_SIZE} bytes"
            )));
        }
        Ok(())
    }
}

fn hash_descriptor(bytes: &[u8]) -> u32 {
    // FNV-1a: simple, deterministic, matches the "hash+id" key `$SDH` uses
    // for dedup lookup without needing a cryptographic hash.
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

/// First security_id handed out; NTFS reserves the ids below this for its
/// own well-known descriptors the way it reserves low MFT record numbers.
const SECURITY_ID_START: u32 = 256;

/// `hash(4) + security_id(4) + offset(8) + length(4)`, the on-disk
/// `$SDS` entry header real NTFS prefixes every stored descriptor with.
const SDS_HEADER_LEN: usize = 20;

/// `$SDS` entries are 16-byte aligned so a header never straddles a cache
/// line boundary smaller implementations rely on; real NTFS aligns (and
/// mirrors across 256 KiB blocks) for the same reason, stripped here to the
/// alignment since there's no crash-consistency story for this in-memory
/// stream to protect.
const SDS_ALIGN: usize = 16;

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

fn encode_sds_header(out: &mut Vec<u8>, hash: u32, security_id: u32, offset: u64, length: u32) {
    out.extend_from_slice(&hash.to_le_bytes());
    out.extend_from_slice(&security_id.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
}

fn encode_offset_length(offset: u64, length: u32) -> Vec<u8> {
    let mut payload = offset.to_le_bytes().to_vec();
    payload.extend_from_slice(&length.to_le_bytes());
    payload
}

fn decode_offset_length(payload: &[u8]) -> NtfsResult<(u64, u32)> {
    if payload.len() < 12 {
        return Err(NtfsError::BadFormat("security index entry payload too short".into()));
    }
    let offset = u64::from_le_bytes(payload[0..8].try_into().unwrap());
    let length = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    Ok((offset, length))
}

/// `$Secure`: the deduplicated security descriptor store backing
/// `$STANDARD_INFORMATION.security_id` (§4.7). `sii` maps security_id to a
/// `$SDS` offset, `sdh` maps (hash, security_id) to the same offset for
/// dedup lookups by hash — the same two-index shape real NTFS uses so a
/// lookup by id never has to hash-scan and a lookup by hash never has to
/// scan every id.
pub struct SecurityDescriptorStore {
    sds: Vec<u8>,
    sii: IndexTree,
    sdh: IndexTree,
    next_id: u32,
}

impl Default for SecurityDescriptorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityDescriptorStore {
    pub fn new() -> Self {
        let mut sii = IndexTree::new(collate_ulong, 4096);
        let mut sdh = IndexTree::new(collate_security_hash, 4096);
        for tree in [&mut sii, &mut sdh] {
            tree.root.entries.push(IndexEntry {
                key: Vec::new(),
                reference: MftRef::NONE,
                payload: Vec::new(),
                sub_node_vcn: None,
            });
        }
        Self { sds: Vec::new(), sii, sdh, next_id: SECURITY_ID_START }
    }

    fn read_descriptor(&self, offset: u64, length: u32) -> NtfsResult<&[u8]> {
        let start = offset as usize + SDS_HEADER_LEN;
        let end = offset as usize + length as usize;
        self.sds.get(start..end).ok_or_else(|| NtfsError::BadFormat("$SDS entry out of range".into()))
    }

    /// Scans `$SDH` for an existing descriptor with the same hash and
    /// identical bytes, returning its security_id.
    fn find_duplicate(&self, hash: u32, descriptor: &[u8]) -> Option<u32> {
        for entry in self.sdh.iter_sorted() {
            if entry.key.len() < 8 {
                continue;
            }
            let entry_hash = u32::from_le_bytes(entry.key[0..4].try_into().ok()?);
            if entry_hash != hash {
                continue;
            }
            let (offset, length) = decode_offset_length(&entry.payload).ok()?;
            if self.read_descriptor(offset, length).ok() == Some(descriptor) {
                return Some(u32::from_le_bytes(entry.key[4..8].try_into().ok()?));
            }
        }
        None
    }

    /// Inserts a descriptor, deduplicating against any existing descriptor
    /// with the same hash and bytes. Returns the security_id to stamp into
    /// `$STANDARD_INFORMATION`.
    pub fn insert_security(&mut self, descriptor: &[u8]) -> u32 {
        let hash = hash_descriptor(descriptor);
        if let Some(existing_id) = self.find_duplicate(hash, descriptor) {
            return existing_id;
        }

        let security_id = self.next_id;
        self.next_id += 1;

        let offset = align_up(self.sds.len(), SDS_ALIGN) as u64;
        self.sds.resize(offset as usize, 0);
        let length = (SDS_HEADER_LEN + descriptor.len()) as u32;
        encode_sds_header(&mut self.sds, hash, security_id, offset, length);
        self.sds.extend_from_slice(descriptor);

        let sii_key = security_id.to_le_bytes().to_vec();
        let mut sdh_key = hash.to_le_bytes().to_vec();
        sdh_key.extend_from_slice(&security_id.to_le_bytes());
        let payload = encode_offset_length(offset, length);

        self.sii
            .insert_entry(IndexEntry { key: sii_key, reference: MftRef::NONE, payload: payload.clone(), sub_node_vcn: None })
            .expect("security_id was just assigned and is unique");
        self.sdh
            .insert_entry(IndexEntry { key: sdh_key, reference: MftRef::NONE, payload, sub_node_vcn: None })
            .expect("hash+security_id pair was just assigned and is unique");

        security_id
    }

    pub fn get(&self, security_id: u32) -> Option<&[u8]> {
        let key = security_id.to_le_bytes();
        let found = self.sii.find(&key).ok()?;
        if !found.exact {
            return None;
        }
        let (offset, length) = decode_offset_length(&found.entry.payload).ok()?;
        self.read_descriptor(offset, length).ok()
    }

    pub fn len(&self) -> usize {
        (self.next_id - SECURITY_ID_START) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == SECURITY_ID_START
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let mut store = EaStore::default();
        store.set_ea("user.foo", b"bar".to_vec(), SetEaFlags::None).unwrap();
        assert_eq!(store.get_ea("user.foo"), Some(b"bar".as_slice()));
    }

    #[test]
    fn replace_with_empty_value_deletes() {
        let mut store = EaStore::default();
        store.set_ea("user.foo", b"bar".to_vec(), SetEaFlags::None).unwrap();
        store.set_ea("user.foo", Vec::new(), SetEaFlags::Replace).unwrap();
        assert_eq!(store.get_ea("user.foo"), None);
    }

    #[test]
    fn create_flag_fails_on_existing_name() {
        let mut store = EaStore::default();
        store.set_ea("user.foo", b"a".to_vec(), SetEaFlags::None).unwrap();
        assert!(matches!(
            store.set_ea("user.foo", b"b".to_vec(), SetEaFlags::Create),
            Err(NtfsError::Exists(_))
        ));
    }

    #[test]
    fn replace_flag_fails_when_absent() {
        let mut store = EaStore::default();
        assert!(matches!(
            store.set_ea("user.foo", b"a".to_vec(), SetEaFlags::Replace),
            Err(NtfsError::NotFound(_))
        ));
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let mut store = EaStore::default();
        store.set_ea("system.dos_attrib", vec![0x20], SetEaFlags::None).unwrap();
        store.set_ea("user.note", b"hello world".to_vec(), SetEaFlags::None).unwrap();
        let bytes = store.encode();
        let decoded = EaStore::decode(&bytes).unwrap();
        assert_eq!(decoded.get_ea("system.dos_attrib"), Some([0x20].as_slice()));
        assert_eq!(decoded.get_ea("user.note"), Some(b"hello world".as_slice()));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut store = EaStore::default();
        let huge = vec![0u8; MAX_EA_DATA_SIZE as usize + 1];
        assert!(matches!(
            store.set_ea("user.big", huge, SetEaFlags::None),
            Err(NtfsError::TooLarge(_))
        ));
    }

    #[test]
    fn insert_security_dedups_identical_descriptors() {
        let mut store = SecurityDescriptorStore::new();
        let id1 = store.insert_security(b"descriptor-bytes");
        let id2 = store.insert_security(b"descriptor-bytes");
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_security_assigns_distinct_ids_for_distinct_descriptors() {
        let mut store = SecurityDescriptorStore::new();
        let id1 = store.insert_security(b"one");
        let id2 = store.insert_security(b"two");
        assert_ne!(id1, id2);
        assert_eq!(store.get(id1), Some(b"one".as_slice()));
        assert_eq!(store.get(id2), Some(b"two".as_slice()));
    }

    #[test]
    fn get_of_unknown_security_id_is_none() {
        let store = SecurityDescriptorStore::new();
        assert_eq!(store.get(999), None);
    }

    #[test]
    fn descriptors_persist_in_the_sds_stream_at_their_recorded_offset() {
        let mut store = SecurityDescriptorStore::new();
        let id = store.insert_security(b"a-descriptor");
        let key = id.to_le_bytes();
        let found = store.sii.find(&key).unwrap();
        assert!(found.exact);
        let (offset, length) = decode_offset_length(&found.entry.payload).unwrap();
        assert_eq!(length as usize, SDS_HEADER_LEN + b"a-descriptor".len());
        assert_eq!(&store.sds[offset as usize + SDS_HEADER_LEN..offset as usize + length as usize], b"a-descriptor");
    }

    #[test]
    fn many_descriptors_survive_index_splits_and_round_trip() {
        let mut store = SecurityDescriptorStore::new();
        let mut ids = Vec::new();
        for i in 0..200u32 {
            let descriptor = format!("descriptor-{i}").into_bytes();
            ids.push((i, store.insert_security(&descriptor)));
        }
        for (i, id) in ids {
            let expected = format!("descriptor-{i}").into_bytes();
            assert_eq!(store.get(id), Some(expected.as_slice()));
        }
        assert_eq!(store.len(), 200);
    }

    #[test]
    fn reinserting_an_existing_descriptor_does_not_grow_the_sds_stream() {
        let mut store = SecurityDescriptorStore::new();
        store.insert_security(b"stable-descriptor");
        let len_after_first = store.sds.len();
        store.insert_security(b"stable-descriptor");
        assert_eq!(store.sds.len(), len_after_first);
    }
}
