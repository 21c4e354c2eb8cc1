//! Volume state machine and mount entry point (§5, §6, §9).
//!
//! Ties together every other module the way the reference driver's
//! `mount/fuse.rs` and `ops_rw.rs`/`ops_rw_v2.rs` do: one `RwLock<Wnd>` per
//! bitmap, one `Mutex<NtfsInode>` per open file behind an `Arc` in a shared
//! table, and a sticky `clean → dirty → error` state. Nothing here reads or
//! writes raw bytes itself past the boot sector and the bootstrap `$MFT`
//! record; every other record goes through [`NtfsVolume::read_record_raw`],
//! which walks `$MFT`'s own data runs the same way the reference driver's
//! `mft_table.rs` resolves record offsets before it ever turns to the VFS
//! layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use ntfs_core::{BlockDevice, NtfsError, NtfsResult};

use super::allocator::{refresh_zone, ClusterAllocator, MftAllocator};
use super::attribute::{Attribute, AttributeBody};
use super::bitmap::Wnd;
use super::boot_sector::BootSector;
use super::constants::{
    ALLOCATE_DEFAULT, ATTR_BITMAP, ATTR_DATA, MFT_REC_BITMAP, MFT_REC_LOGFILE, MFT_REC_ROOT,
};

/// Number of MFT records `$MftMirr` keeps a mirror copy of (§6 `$MftMirr`):
/// `$MFT`, `$MftMirr`, `$LogFile`, `$Volume`.
const MFT_MIRROR_RECORD_COUNT: u64 = 4;
use super::inode::{ClusterStore, NtfsInode, RecordAllocator, RecordWriter};
use super::logfile::{self, LogFileStatus, ReplayHook};
use super::record::MftRecord;
use super::runs::RunList;
use super::security::SecurityDescriptorStore;

/// Mount-time options (§6 "Configuration"). All default off, matching the
/// reference driver's `mount/fuse.rs` option table.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub umask: Option<u16>,
    pub fmask: Option<u16>,
    pub dmask: Option<u16>,
    pub sys_immutable: bool,
    pub discard: bool,
    pub sparse: bool,
    pub showmeta: bool,
    pub nohidden: bool,
    pub force: bool,
    pub no_acs_rules: bool,
    pub prealloc: bool,
}

/// Volume state machine (§5). `Clean` is only restored by a clean unmount;
/// `Error` is sticky until a `force` remount clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Clean,
    Dirty,
    Error,
}

/// The mounted volume: everything a single-process, std-concurrency NTFS
/// driver needs to serve reads and writes (§5 "Concurrency & resource
/// model").
pub struct NtfsVolume {
    device: Arc<dyn BlockDevice>,
    pub boot: BootSector,
    pub options: MountOptions,
    mft_data_runs: RwLock<RunList>,
    cluster_bitmap: RwLock<Wnd>,
    mft_bitmap: RwLock<Wnd>,
    cluster_allocator: Mutex<ClusterAllocator>,
    mft_allocator: Mutex<MftAllocator>,
    pub security: Mutex<SecurityDescriptorStore>,
    inodes: Mutex<HashMap<u64, Arc<Mutex<NtfsInode>>>>,
    state: Mutex<VolumeState>,
}

impl NtfsVolume {
    /// Mounts `device`: reads the boot sector, bootstraps `$MFT` by reading
    /// its own record 0 directly at `mft_lcn`, then resolves `$Bitmap`
    /// (record 6, the volume's cluster bitmap) and `$LogFile` (record 2)
    /// through the now-known `$MFT` data runs.
    ///
    /// `replay_hook`, when given, is invoked once if `$LogFile` reports a
    /// pending replay; with no hook and no `force` option this returns
    /// [`NtfsError::ReplayNeeded`] rather than mounting an inconsistent
    /// volume (§5 "the core calls [the replayer] once at mount").
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        replay_hook: Option<&dyn ReplayHook>,
    ) -> NtfsResult<Arc<Self>> {
        let boot_bytes = device.read_bytes(0, super::boot_sector::BOOT_SECTOR_SIZE)?;
        let boot = BootSector::parse(&boot_bytes)?;
        let cluster_size = boot.bytes_per_cluster() as u64;
        let record_size = boot.mft_record_size() as usize;

        let mft_rec0_lbo = boot.mft_lcn * cluster_size;
        let mut rec0_bytes = device.read_bytes(mft_rec0_lbo, record_size)?;
        let rec0 = MftRecord::read(&mut rec0_bytes, super::constants::MFT_REC_MFT, record_size)?;

        let data_attr = rec0
            .find_attr(ATTR_DATA, "", None)
            .ok_or_else(|| NtfsError::BadFormat("$MFT record has no $DATA attribute".into()))?;
        let mft_data_runs = match &data_attr.body {
            AttributeBody::NonResident { runs, .. } => runs.clone(),
            AttributeBody::Resident { .. } => {
                return Err(NtfsError::BadFormat("$MFT $DATA must be non-resident".into()));
            }
        };

        let bitmap_attr = rec0
            .find_attr(ATTR_BITMAP, "", None)
            .ok_or_else(|| NtfsError::BadFormat("$MFT record has no $BITMAP attribute".into()))?;
        let mft_bitmap_bytes = match &bitmap_attr.body {
            AttributeBody::Resident { data, .. } => data.clone(),
            AttributeBody::NonResident { .. } => {
                return Err(NtfsError::NotSupported("non-resident $MFT $BITMAP".into()));
            }
        };
        let mft_clusters_used = mft_data_runs.cluster_count();
        let mft_record_count = mft_clusters_used * cluster_size / record_size as u64;
        let mft_bitmap = Wnd::from_bytes(&mft_bitmap_bytes, mft_record_count);

        let volume = Arc::new(Self {
            device,
            boot,
            options,
            mft_data_runs: RwLock::new(mft_data_runs),
            cluster_bitmap: RwLock::new(Wnd::new(boot.total_clusters())),
            mft_bitmap: RwLock::new(mft_bitmap),
            cluster_allocator: Mutex::new(ClusterAllocator::new()),
            mft_allocator: Mutex::new(MftAllocator::new(MFT_REC_FREE_START)),
            security: Mutex::new(SecurityDescriptorStore::new()),
            inodes: Mutex::new(HashMap::new()),
            state: Mutex::new(VolumeState::Clean),
        });
        volume.inodes.lock().unwrap().insert(
            super::constants::MFT_REC_MFT,
            Arc::new(Mutex::new(NtfsInode::new(rec0, record_size))),
        );

        let mut bitmap_file_bytes = volume.read_record_raw(MFT_REC_BITMAP)?;
        let bitmap_file = MftRecord::read(&mut bitmap_file_bytes, MFT_REC_BITMAP, record_size)?;
        if let Some(attr) = bitmap_file.find_attr(ATTR_DATA, "", None) {
            if let AttributeBody::NonResident { runs, .. } = &attr.body {
                let cluster_bitmap_bytes = volume.read_runs(runs)?;
                let mut guard = volume.cluster_bitmap.write().unwrap();
                *guard = Wnd::from_bytes(&cluster_bitmap_bytes, volume.boot.total_clusters());
                let (zone_start, zone_end) = refresh_zone(mft_clusters_used, volume.boot.total_clusters());
                guard.zone_set(zone_start, zone_end - zone_start);
            }
        }

        let log_bytes = volume.read_record_bytes_best_effort(MFT_REC_LOGFILE, record_size);
        if let Some(log_bytes) = log_bytes {
            let status = logfile::ensure_replayed(&log_bytes, replay_hook, volume.device.as_ref(), volume.options.force)?;
            if status == LogFileStatus::NeedsReplay {
                log::warn!("mounting with pending $LogFile replay (force={})", volume.options.force);
                *volume.state.lock().unwrap() = VolumeState::Dirty;
            }
        }

        log::info!("mounted NTFS volume: {} total clusters, {} MFT records", volume.boot.total_clusters(), mft_record_count);
        Ok(volume)
    }

    fn read_record_bytes_best_effort(&self, rno: u64, record_size: usize) -> Option<Vec<u8>> {
        let mut raw = self.read_record_raw(rno).ok()?;
        let record = MftRecord::read(&mut raw, rno, record_size).ok()?;
        let attr = record.find_attr(ATTR_DATA, "", None)?;
        match &attr.body {
            AttributeBody::NonResident { runs, .. } => self.read_runs(runs).ok(),
            AttributeBody::Resident { data, .. } => Some(data.clone()),
        }
    }

    /// Reads one MFT record's raw bytes by translating `rno` through
    /// `$MFT`'s own data runs. Assumes `record_size <= cluster_size` (every
    /// volume in the test suite and every default `mkntfs` layout); a
    /// volume formatted with records larger than one cluster is out of
    /// scope (decision recorded in DESIGN.md).
    pub fn read_record_raw(&self, rno: u64) -> NtfsResult<Vec<u8>> {
        let record_size = self.boot.mft_record_size() as u64;
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let records_per_cluster = (cluster_size / record_size).max(1);
        let vcn = rno / records_per_cluster;
        let in_cluster_offset = (rno % records_per_cluster) * record_size;

        let runs = self.mft_data_runs.read().unwrap();
        let lcn = runs
            .vcn_to_lcn(vcn)?
            .ok_or_else(|| NtfsError::BadFormat(format!("MFT record {rno} falls in a sparse run")))?;
        drop(runs);

        let lbo = lcn * cluster_size + in_cluster_offset;
        self.device.read_bytes(lbo, record_size as usize)
    }

    /// Writes one MFT record's raw bytes back through `$MFT`'s data runs,
    /// durably when `sync` is set (§5 "Ordering guarantees").
    pub fn write_record_raw(&self, rno: u64, bytes: &[u8], sync: bool) -> NtfsResult<()> {
        let record_size = self.boot.mft_record_size() as u64;
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let records_per_cluster = (cluster_size / record_size).max(1);
        let vcn = rno / records_per_cluster;
        let in_cluster_offset = (rno % records_per_cluster) * record_size;

        let runs = self.mft_data_runs.read().unwrap();
        let lcn = runs
            .vcn_to_lcn(vcn)?
            .ok_or_else(|| NtfsError::BadFormat(format!("MFT record {rno} falls in a sparse run")))?;
        drop(runs);

        let lbo = lcn * cluster_size + in_cluster_offset;
        self.device.write_bytes(lbo, bytes, sync)?;
        self.mark_dirty();
        Ok(())
    }

    /// Copies the first [`MFT_MIRROR_RECORD_COUNT`] MFT records to their
    /// mirror location at `$MftMirr`'s LCN (§5 "Ordering guarantees":
    /// metadata durability pairs `write_inode(sync=true)` on a system record
    /// with this call). `wait` is forwarded to the device as the `sync` flag
    /// on the mirror write itself.
    pub fn ntfs_update_mftmirr(&self, wait: bool) -> NtfsResult<()> {
        let record_size = self.boot.mft_record_size() as u64;
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let mirror_lbo = self.boot.mftmirr_lcn * cluster_size;
        for rno in 0..MFT_MIRROR_RECORD_COUNT {
            let bytes = self.read_record_raw(rno)?;
            self.device.write_bytes(mirror_lbo + rno * record_size, &bytes, wait)?;
        }
        Ok(())
    }

    /// Reads every cluster named by `runs`, concatenated in VCN order;
    /// sparse runs read back as zeroes.
    pub fn read_runs(&self, runs: &RunList) -> NtfsResult<Vec<u8>> {
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let mut out = Vec::with_capacity((runs.cluster_count() * cluster_size) as usize);
        for run in runs.runs() {
            let len_bytes = (run.length * cluster_size) as usize;
            match run.lcn {
                Some(lcn) => out.extend(self.device.read_bytes(lcn * cluster_size, len_bytes)?),
                None => out.extend(std::iter::repeat(0u8).take(len_bytes)),
            }
        }
        Ok(out)
    }

    pub fn state(&self) -> VolumeState {
        *self.state.lock().unwrap()
    }

    /// Moves `Clean` to `Dirty` on first mutation (§5). A volume already
    /// `Error` or `Dirty` is unaffected.
    pub fn mark_dirty(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == VolumeState::Clean {
            *state = VolumeState::Dirty;
        }
    }

    /// Marks the volume `Error` on detected on-disk corruption (§5). Sticky
    /// until a `force` remount.
    pub fn mark_error(&self) {
        log::error!("volume marked error after on-disk corruption was detected");
        *self.state.lock().unwrap() = VolumeState::Error;
    }

    /// Returns the cached inode for `rno`, loading its base record (and,
    /// via `$ATTRIBUTE_LIST`, every subrecord) from disk on first access.
    pub fn get_inode(self: &Arc<Self>, rno: u64) -> NtfsResult<Arc<Mutex<NtfsInode>>> {
        if let Some(existing) = self.inodes.lock().unwrap().get(&rno) {
            return Ok(existing.clone());
        }

        let record_size = self.boot.mft_record_size() as usize;
        let mut bytes = self.read_record_raw(rno)?;
        let record = match MftRecord::read(&mut bytes, rno, record_size) {
            Ok(r) => r,
            Err(err) => {
                self.mark_error();
                return Err(err);
            }
        };
        let mut inode = NtfsInode::new(record, record_size);

        if inode.has_attribute_list() {
            let sub_rnos: Vec<u64> = inode
                .attr_list_entries()
                .iter()
                .map(|e| e.base_record.rno)
                .filter(|&sub_rno| sub_rno != rno)
                .collect();
            for sub_rno in sub_rnos {
                if inode.owns_subrecord(sub_rno) {
                    continue;
                }
                let mut sub_bytes = self.read_record_raw(sub_rno)?;
                let sub = MftRecord::read(&mut sub_bytes, sub_rno, record_size)?;
                inode.adopt_subrecord(sub);
            }
        }

        let arc = Arc::new(Mutex::new(inode));
        self.inodes.lock().unwrap().insert(rno, arc.clone());
        Ok(arc)
    }

    /// Returns the root directory's inode (record 5).
    pub fn root_inode(self: &Arc<Self>) -> NtfsResult<Arc<Mutex<NtfsInode>>> {
        self.get_inode(MFT_REC_ROOT)
    }

    pub fn allocate_clusters(&self, hint_lcn: u64, want_len: u64) -> NtfsResult<(u64, u64)> {
        let mut bitmap = self.cluster_bitmap.write().unwrap();
        let mut alloc = self.cluster_allocator.lock().unwrap();
        let result = alloc.look_for_free_space(&mut bitmap, hint_lcn, want_len, ALLOCATE_DEFAULT);
        if result.is_ok() {
            self.mark_dirty();
        }
        result
    }

    pub fn free_clusters(&self, lcn: u64, len: u64) {
        let mut bitmap = self.cluster_bitmap.write().unwrap();
        self.cluster_allocator.lock().unwrap().mark_as_free_ex(&mut bitmap, lcn, len);
        self.mark_dirty();
    }

    /// Builds a [`RecordAllocator`] bound to this volume's MFT bitmap, for
    /// a single inode's attribute-list growth/shrink operation.
    pub fn record_allocator(self: &Arc<Self>) -> VolumeRecordAllocator {
        VolumeRecordAllocator { volume: self.clone() }
    }

    /// Builds a [`ClusterStore`] bound to this volume's cluster bitmap and
    /// device, for a single attribute's resident/non-resident resize (§4.4).
    pub fn cluster_store(self: &Arc<Self>) -> VolumeClusterStore {
        VolumeClusterStore { volume: self.clone() }
    }

    /// Zeroes freshly grown `$MFT` record slots so a stale record left over
    /// from the clusters' previous use is never read back as valid (§4.3
    /// `clear_mft_tail`).
    fn clear_mft_tail(&self, lcn: u64, cluster_count: u64) -> NtfsResult<()> {
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let zeros = vec![0u8; (cluster_count * cluster_size) as usize];
        self.device.write_bytes(lcn * cluster_size, &zeros, false)
    }

    /// Grows `$MFT::$DATA` by one cluster chunk and extends the MFT bitmap
    /// to match, once [`MftAllocator::look_free_mft`] reports the record
    /// bitmap exhausted even for a privileged caller (§4.3 `look_free_mft`,
    /// step 2). Allocates the new clusters from the volume's own cluster
    /// bitmap, zeroes them via [`Self::clear_mft_tail`], appends the extent
    /// to the in-memory run list and to `$MFT`'s own `$DATA` attribute on
    /// disk, then extends [`Wnd`] to cover the new record slots. Returns the
    /// number of new record slots made available.
    fn grow_mft(self: &Arc<Self>) -> NtfsResult<u64> {
        let cluster_size = self.boot.bytes_per_cluster() as u64;
        let record_size = self.boot.mft_record_size() as u64;
        let records_per_cluster = (cluster_size / record_size).max(1);

        let hint = self
            .mft_data_runs
            .read()
            .unwrap()
            .runs()
            .last()
            .and_then(|r| r.lcn)
            .map(|lcn| lcn + 1)
            .unwrap_or(0);
        let (lcn, got) = self.allocate_clusters(hint, 1)?;
        if got == 0 {
            return Err(NtfsError::NoSpace);
        }
        self.clear_mft_tail(lcn, got)?;

        let runs_snapshot = {
            let mut runs = self.mft_data_runs.write().unwrap();
            runs.append(Some(lcn), got);
            runs.clone()
        };
        let new_data_size = runs_snapshot.cluster_count() * cluster_size;

        let mft_inode = self.get_inode(super::constants::MFT_REC_MFT)?;
        {
            let mut mft_inode = mft_inode.lock().unwrap();
            let id = mft_inode
                .base
                .find_attr(ATTR_DATA, "", None)
                .ok_or_else(|| NtfsError::BadFormat("$MFT record has no $DATA attribute".into()))?
                .attribute_id;
            let candidate = Attribute {
                type_code: ATTR_DATA,
                attribute_id: id,
                name: String::new(),
                flags: 0,
                body: AttributeBody::NonResident {
                    starting_vcn: 0,
                    runs: runs_snapshot,
                    compression_unit: 0,
                    allocated_size: new_data_size,
                    data_size: new_data_size,
                    initialized_size: new_data_size,
                },
            };
            mft_inode.base.resize_attr(ATTR_DATA, id, candidate)?;
            let usn = mft_inode.base.next_usn();
            let bytes = mft_inode.base.write(usn)?;
            self.write_record_raw(super::constants::MFT_REC_MFT, &bytes, true)?;
            mft_inode.base.clear_dirty();
        }

        let added_records = got * records_per_cluster;
        let mut mft_bitmap = self.mft_bitmap.write().unwrap();
        let new_record_count = mft_bitmap.nbits() + added_records;
        mft_bitmap.extend(new_record_count);
        drop(mft_bitmap);

        log::info!("grew $MFT by {got} cluster(s): {added_records} new record slots, {new_record_count} total");
        Ok(added_records)
    }
}

impl RecordWriter for NtfsVolume {
    fn write_record(&self, rno: u64, bytes: &[u8], sync: bool) -> NtfsResult<()> {
        self.write_record_raw(rno, bytes, sync)
    }
}

const MFT_REC_FREE_START: u64 = super::constants::MFT_REC_FREE;

/// [`RecordAllocator`] backed by the volume's MFT bitmap (§4.3, §4.4). Kept
/// as a short-lived value borrowed for one inode operation rather than
/// stored, so its lock acquisitions stay scoped to that operation (§5 lock
/// ordering: inode mutex before MFT bitmap).
pub struct VolumeRecordAllocator {
    volume: Arc<NtfsVolume>,
}

impl RecordAllocator for VolumeRecordAllocator {
    fn alloc_subrecord(&mut self) -> NtfsResult<u64> {
        {
            let mut bitmap = self.volume.mft_bitmap.write().unwrap();
            let mut alloc = self.volume.mft_allocator.lock().unwrap();
            match alloc.look_free_mft(&mut bitmap, true) {
                Ok(rno) => {
                    self.volume.mark_dirty();
                    return Ok(rno);
                }
                Err(NtfsError::NoSpace) => {}
                Err(e) => return Err(e),
            }
        }
        // Both pools are exhausted even for this privileged caller: grow
        // $MFT by a cluster chunk and retry once (§4.3 look_free_mft step 2).
        self.volume.grow_mft()?;
        let mut bitmap = self.volume.mft_bitmap.write().unwrap();
        let mut alloc = self.volume.mft_allocator.lock().unwrap();
        let rno = alloc.look_free_mft(&mut bitmap, true)?;
        self.volume.mark_dirty();
        Ok(rno)
    }

    fn free_subrecord(&mut self, rno: u64) {
        let mut bitmap = self.volume.mft_bitmap.write().unwrap();
        self.volume.mft_allocator.lock().unwrap().mark_rec_free(&mut bitmap, rno);
        self.volume.mark_dirty();
    }
}

/// [`ClusterStore`] backed by the volume's cluster bitmap and device (§4.4).
/// Short-lived for the same reason as [`VolumeRecordAllocator`]: its lock
/// acquisitions should stay scoped to one attribute resize.
pub struct VolumeClusterStore {
    volume: Arc<NtfsVolume>,
}

impl ClusterStore for VolumeClusterStore {
    fn cluster_size(&self) -> u64 {
        self.volume.boot.bytes_per_cluster() as u64
    }

    fn alloc_clusters(&mut self, hint_lcn: u64, want_len: u64) -> NtfsResult<(u64, u64)> {
        self.volume.allocate_clusters(hint_lcn, want_len)
    }

    fn free_clusters(&mut self, lcn: u64, len: u64) {
        self.volume.free_clusters(lcn, len);
    }

    fn read_clusters(&mut self, lcn: u64, len: u64) -> NtfsResult<Vec<u8>> {
        let cluster_size = self.cluster_size();
        self.volume.device.read_bytes(lcn * cluster_size, (len * cluster_size) as usize)
    }

    fn write_clusters(&mut self, lcn: u64, bytes: &[u8]) -> NtfsResult<()> {
        let cluster_size = self.cluster_size();
        self.volume.device.write_bytes(lcn * cluster_size, bytes, false)?;
        self.volume.mark_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntfs::attribute::Attribute;
    use crate::ntfs::constants::*;
    use crate::ntfs::record::MftRecord;
    use crate::ntfs::runs::{Run, RunList};
    use ntfs_core::InMemoryDevice;

    const BYTES_PER_SECTOR: u16 = 512;
    const SECTORS_PER_CLUSTER: u8 = 8;
    const CLUSTER_SIZE: u64 = BYTES_PER_SECTOR as u64 * SECTORS_PER_CLUSTER as u64;
    const RECORD_SIZE: usize = 1024;
    const TOTAL_CLUSTERS: u64 = 4096;

    fn boot_sector_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; super::super::boot_sector::BOOT_SECTOR_SIZE];
        buf[3..11].copy_from_slice(NTFS_OEM_ID);
        buf[0x0B..0x0D].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        buf[0x0D] = SECTORS_PER_CLUSTER;
        buf[0x28..0x30].copy_from_slice(&(TOTAL_CLUSTERS * SECTORS_PER_CLUSTER as u64).to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&4u64.to_le_bytes()); // mft_lcn
        buf[0x38..0x40].copy_from_slice(&20u64.to_le_bytes()); // mftmirr_lcn
        buf[0x40] = (-10i8) as u8; // 1024-byte records
        buf[0x44] = (-12i8) as u8;
        buf[0x48..0x50].copy_from_slice(&0u64.to_le_bytes());
        buf[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        buf
    }

    /// Builds a minimal device image: boot sector, a bootstrap `$MFT`
    /// record 0 whose `$DATA` runs cover clusters holding the MFT records
    /// themselves, a trivial `$MFT` `$BITMAP`, and an empty `$Bitmap` file
    /// record (6) so mount can resolve the volume cluster bitmap.
    fn minimal_device() -> Arc<InMemoryDevice> {
        let device_size = (TOTAL_CLUSTERS * CLUSTER_SIZE) as usize;
        let device = InMemoryDevice::new(device_size);
        device.write_bytes(0, &boot_sector_bytes(), false).unwrap();

        let records_per_cluster = CLUSTER_SIZE as usize / RECORD_SIZE;
        let mft_clusters = 8u64;
        let mft_record_count = mft_clusters * records_per_cluster as u64;

        let mut rec0 = MftRecord::format_new(MFT_REC_MFT, 1, false, RECORD_SIZE);
        let runs = RunList::new(vec![Run { vcn: 0, lcn: Some(4), length: mft_clusters }]);
        rec0.insert_attr(Attribute {
            type_code: ATTR_DATA,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::NonResident {
                starting_vcn: 0,
                runs,
                compression_unit: 0,
                allocated_size: mft_clusters * CLUSTER_SIZE,
                data_size: mft_clusters * CLUSTER_SIZE,
                initialized_size: mft_clusters * CLUSTER_SIZE,
            },
        })
        .unwrap();
        let mut bitmap_bytes = vec![0u8; mft_record_count.div_ceil(8) as usize];
        bitmap_bytes[0] = 0b0111_1111; // records 0..6 in use
        rec0.insert_attr(Attribute {
            type_code: ATTR_BITMAP,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::Resident { data: bitmap_bytes, indexed: false },
        })
        .unwrap();
        let rec0_bytes = rec0.write(1).unwrap();
        device.write_bytes(4 * CLUSTER_SIZE, &rec0_bytes, false).unwrap();

        let mut rec6 = MftRecord::format_new(MFT_REC_BITMAP, 1, false, RECORD_SIZE);
        let cluster_bitmap_bytes = vec![0u8; (TOTAL_CLUSTERS / 8) as usize];
        rec6.insert_attr(Attribute {
            type_code: ATTR_DATA,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::NonResident {
                starting_vcn: 0,
                runs: RunList::new(vec![Run { vcn: 0, lcn: Some(30), length: 1 }]),
                compression_unit: 0,
                allocated_size: CLUSTER_SIZE,
                data_size: cluster_bitmap_bytes.len() as u64,
                initialized_size: cluster_bitmap_bytes.len() as u64,
            },
        })
        .unwrap();
        let rec6_bytes = rec6.write(1).unwrap();
        let rec6_offset = (MFT_REC_BITMAP as usize / records_per_cluster) as u64 * CLUSTER_SIZE
            + (MFT_REC_BITMAP as usize % records_per_cluster) as u64 * RECORD_SIZE as u64;
        device.write_bytes(4 * CLUSTER_SIZE + rec6_offset, &rec6_bytes, false).unwrap();
        device.write_bytes(30 * CLUSTER_SIZE, &cluster_bitmap_bytes, false).unwrap();

        let mut root = MftRecord::format_new(MFT_REC_ROOT, 1, true, RECORD_SIZE);
        root.insert_attr(Attribute {
            type_code: ATTR_STANDARD_INFORMATION,
            attribute_id: 0,
            name: String::new(),
            flags: 0,
            body: AttributeBody::Resident { data: vec![0u8; 48], indexed: false },
        })
        .unwrap();
        let root_bytes = root.write(1).unwrap();
        let root_offset = (MFT_REC_ROOT as usize / records_per_cluster) as u64 * CLUSTER_SIZE
            + (MFT_REC_ROOT as usize % records_per_cluster) as u64 * RECORD_SIZE as u64;
        device.write_bytes(4 * CLUSTER_SIZE + root_offset, &root_bytes, false).unwrap();

        Arc::new(device)
    }

    #[test]
    fn mount_reads_boot_sector_and_starts_clean() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();
        assert_eq!(volume.state(), VolumeState::Clean);
        assert_eq!(volume.boot.mft_lcn, 4);
    }

    #[test]
    fn root_inode_loads_and_is_a_directory() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();
        let root = volume.root_inode().unwrap();
        assert!(root.lock().unwrap().base.is_directory());
    }

    #[test]
    fn allocate_clusters_marks_volume_dirty() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();
        assert_eq!(volume.state(), VolumeState::Clean);
        volume.allocate_clusters(0, 4).unwrap();
        assert_eq!(volume.state(), VolumeState::Dirty);
    }

    #[test]
    fn get_inode_caches_the_same_arc() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();
        let a = volume.get_inode(MFT_REC_ROOT).unwrap();
        let b = volume.get_inode(MFT_REC_ROOT).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn ntfs_update_mftmirr_copies_the_first_system_records() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

        volume.ntfs_update_mftmirr(true).unwrap();

        for rno in 0..super::MFT_MIRROR_RECORD_COUNT {
            let original = volume.read_record_raw(rno).unwrap();
            let mirrored = volume
                .device
                .read_bytes(20 * CLUSTER_SIZE + rno * RECORD_SIZE as u64, RECORD_SIZE)
                .unwrap();
            assert_eq!(original, mirrored, "record {rno} did not mirror correctly");
        }
    }

    #[test]
    fn alloc_subrecord_grows_mft_when_both_pools_are_exhausted() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

        let nbits_before = volume.mft_bitmap.read().unwrap().nbits();
        volume.mft_bitmap.write().unwrap().set_used(0, nbits_before);

        let mut allocator = volume.record_allocator();
        let rno = allocator.alloc_subrecord().unwrap();

        let nbits_after = volume.mft_bitmap.read().unwrap().nbits();
        assert!(nbits_after > nbits_before, "mft bitmap should have grown");
        assert!(rno >= nbits_before, "new record should come from the grown region");
        assert!(volume.mft_bitmap.read().unwrap().is_used(rno, 1));

        let mft_data_clusters = volume.mft_data_runs.read().unwrap().cluster_count();
        assert!(mft_data_clusters > 8, "$MFT $DATA should have grown by at least one cluster");

        let mft_inode = volume.get_inode(MFT_REC_MFT).unwrap();
        let mft_inode = mft_inode.lock().unwrap();
        let attr = mft_inode.base.find_attr(ATTR_DATA, "", None).unwrap();
        match &attr.body {
            AttributeBody::NonResident { runs, data_size, .. } => {
                assert_eq!(runs.cluster_count(), mft_data_clusters);
                assert_eq!(*data_size, mft_data_clusters * CLUSTER_SIZE);
            }
            AttributeBody::Resident { .. } => panic!("$MFT $DATA must stay non-resident after growth"),
        }
    }

    #[test]
    fn grow_mft_zeroes_the_newly_allocated_clusters() {
        let device = minimal_device();
        let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

        let clusters_before = volume.mft_data_runs.read().unwrap().cluster_count();
        volume.grow_mft().unwrap();
        let runs = volume.mft_data_runs.read().unwrap();
        let new_run = runs.runs().last().unwrap();
        assert_eq!(new_run.vcn, clusters_before);

        let lcn = new_run.lcn.expect("newly grown run must not be sparse");
        let bytes = volume.device.read_bytes(lcn * CLUSTER_SIZE, CLUSTER_SIZE as usize).unwrap();
        assert!(bytes.iter().all(|&b| b == 0), "grown cluster must be zeroed");
    }
}
