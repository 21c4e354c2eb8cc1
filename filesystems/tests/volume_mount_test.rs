//! Cross-module integration test: mounts a hand-built volume image and
//! exercises the record/attribute/inode/allocator stack through
//! `NtfsVolume`'s public surface, the way the reference driver's own
//! `tests/` directory exercises a formatted image end to end.

use std::sync::{Arc, Once};

use ntfs_core::InMemoryDevice;
use ntfs_driver_core::ntfs::attribute::{Attribute, AttributeBody};
use ntfs_driver_core::ntfs::boot_sector::BOOT_SECTOR_SIZE;
use ntfs_driver_core::ntfs::constants::*;
use ntfs_driver_core::ntfs::record::MftRecord;
use ntfs_driver_core::ntfs::runs::{Run, RunList};
use ntfs_driver_core::{MountOptions, NtfsVolume, VolumeState};

const BYTES_PER_SECTOR: u16 = 512;
const SECTORS_PER_CLUSTER: u8 = 8;
const CLUSTER_SIZE: u64 = BYTES_PER_SECTOR as u64 * SECTORS_PER_CLUSTER as u64;
const RECORD_SIZE: usize = 1024;
const TOTAL_CLUSTERS: u64 = 2048;

fn boot_sector_bytes() -> Vec<u8> {
    let mut buf = vec![0u8; BOOT_SECTOR_SIZE];
    buf[3..11].copy_from_slice(NTFS_OEM_ID);
    buf[0x0B..0x0D].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
    buf[0x0D] = SECTORS_PER_CLUSTER;
    buf[0x28..0x30].copy_from_slice(&(TOTAL_CLUSTERS * SECTORS_PER_CLUSTER as u64).to_le_bytes());
    buf[0x30..0x38].copy_from_slice(&4u64.to_le_bytes());
    buf[0x38..0x40].copy_from_slice(&12u64.to_le_bytes());
    buf[0x40] = (-10i8) as u8;
    buf[0x44] = (-12i8) as u8;
    buf[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
    buf
}

fn record_offset(rno: u64, records_per_cluster: u64) -> u64 {
    (rno / records_per_cluster) * CLUSTER_SIZE + (rno % records_per_cluster) * RECORD_SIZE as u64
}

static INIT_LOGGER: Once = Once::new();

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn build_device() -> Arc<InMemoryDevice> {
    init_logger();
    let device = InMemoryDevice::new((TOTAL_CLUSTERS * CLUSTER_SIZE) as usize);
    device.write_bytes(0, &boot_sector_bytes(), false).unwrap();

    let records_per_cluster = CLUSTER_SIZE / RECORD_SIZE as u64;
    let mft_clusters = 4u64;
    let mft_record_count = mft_clusters * records_per_cluster;

    let mut rec0 = MftRecord::format_new(MFT_REC_MFT, 1, false, RECORD_SIZE);
    rec0.insert_attr(Attribute {
        type_code: ATTR_DATA,
        attribute_id: 0,
        name: String::new(),
        flags: 0,
        body: AttributeBody::NonResident {
            starting_vcn: 0,
            runs: RunList::new(vec![Run { vcn: 0, lcn: Some(4), length: mft_clusters }]),
            compression_unit: 0,
            allocated_size: mft_clusters * CLUSTER_SIZE,
            data_size: mft_clusters * CLUSTER_SIZE,
            initialized_size: mft_clusters * CLUSTER_SIZE,
        },
    })
    .unwrap();
    let mut mft_bitmap_bytes = vec![0u8; mft_record_count.div_ceil(8) as usize];
    mft_bitmap_bytes[0] = 0b0111_1111;
    rec0.insert_attr(Attribute {
        type_code: ATTR_BITMAP,
        attribute_id: 0,
        name: String::new(),
        flags: 0,
        body: AttributeBody::Resident { data: mft_bitmap_bytes, indexed: false },
    })
    .unwrap();
    device.write_bytes(4 * CLUSTER_SIZE, &rec0.write(1).unwrap(), false).unwrap();

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
    let rec6_offset = record_offset(MFT_REC_BITMAP, records_per_cluster);
    device
        .write_bytes(4 * CLUSTER_SIZE + rec6_offset, &rec6.write(1).unwrap(), false)
        .unwrap();
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
    let root_offset = record_offset(MFT_REC_ROOT, records_per_cluster);
    device
        .write_bytes(4 * CLUSTER_SIZE + root_offset, &root.write(1).unwrap(), false)
        .unwrap();

    Arc::new(device)
}

#[test]
fn mount_then_allocate_then_read_inode_round_trips() {
    let device = build_device();
    let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

    assert_eq!(volume.state(), VolumeState::Clean);

    let root = volume.root_inode().unwrap();
    assert!(root.lock().unwrap().base.is_directory());

    let (lcn, len) = volume.allocate_clusters(0, 16).unwrap();
    assert_eq!(len, 16);
    assert_eq!(volume.state(), VolumeState::Dirty);

    volume.free_clusters(lcn, len);

    let (lcn2, len2) = volume.allocate_clusters(0, 16).unwrap();
    assert_eq!(len2, 16);
    assert_eq!(lcn2, lcn, "freed clusters should be reusable by a later allocation");
}

#[test]
fn attr_set_size_converts_to_nonresident_through_the_volume_cluster_store() {
    let device = build_device();
    let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

    let root_arc = volume.root_inode().unwrap();
    let mut root = root_arc.lock().unwrap();
    root.insert_resident(ATTR_DATA, "", vec![1, 2, 3], false, &mut volume.record_allocator())
        .unwrap();

    let mut alloc = volume.record_allocator();
    let mut clusters = volume.cluster_store();
    root.attr_set_size(ATTR_DATA, "", 5000, &mut alloc, &mut clusters).unwrap();

    match &root.find_attr(ATTR_DATA, "").unwrap().body {
        AttributeBody::NonResident { data_size, .. } => assert_eq!(*data_size, 5000),
        _ => panic!("expected non-resident"),
    }
}

#[test]
fn record_allocator_round_trips_through_the_volume_mft_bitmap() {
    let device = build_device();
    let volume = NtfsVolume::mount(device, MountOptions::default(), None).unwrap();

    let mut alloc = volume.record_allocator();
    let rno = {
        use ntfs_driver_core::ntfs::inode::RecordAllocator;
        alloc.alloc_subrecord().unwrap()
    };
    assert!(rno >= MFT_REC_FREE);

    {
        use ntfs_driver_core::ntfs::inode::RecordAllocator;
        alloc.free_subrecord(rno);
    }
}
