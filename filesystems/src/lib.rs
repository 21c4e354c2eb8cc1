//! NTFS read/write filesystem driver core: the on-disk layout manager that
//! turns a block device holding an NTFS volume into a live, mutable file
//! tree. See `ntfs::volume::NtfsVolume` for the entry point.

pub mod ntfs;

pub use ntfs::volume::{MountOptions, NtfsVolume, VolumeState};
