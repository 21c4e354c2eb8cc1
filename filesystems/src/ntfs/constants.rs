//! On-disk constants: signatures, fixed record numbers, attribute type
//! codes, and the various flag bits. Nothing here allocates or validates —
//! see `boot_sector.rs` and `record.rs` for the structures that use them.

/// Boot sector OEM id for an NTFS volume.
pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";
/// MFT record signature for a record in use (or formerly in use).
pub const MFT_RECORD_SIGNATURE: &[u8; 4] = b"FILE";
/// MFT record signature for a record the volume's own journal replay marked bad.
pub const MFT_RECORD_BAD_SIGNATURE: &[u8; 4] = b"BAAD";
/// Index block (`$INDEX_ALLOCATION` node) signature.
pub const INDEX_BLOCK_SIGNATURE: &[u8; 4] = b"INDX";

/// Fixed MFT record numbers (§6). The first `MFT_REC_FREE` records are reserved.
pub const MFT_REC_MFT: u64 = 0;
pub const MFT_REC_MFTMIRR: u64 = 1;
pub const MFT_REC_LOGFILE: u64 = 2;
pub const MFT_REC_VOLUME: u64 = 3;
pub const MFT_REC_ATTRDEF: u64 = 4;
pub const MFT_REC_ROOT: u64 = 5;
pub const MFT_REC_BITMAP: u64 = 6;
pub const MFT_REC_BOOT: u64 = 7;
pub const MFT_REC_BADCLUS: u64 = 8;
pub const MFT_REC_SECURE: u64 = 9;
pub const MFT_REC_UPCASE: u64 = 10;
pub const MFT_REC_EXTEND: u64 = 11;
/// Number of reserved record slots at the head of the MFT.
pub const MFT_REC_FREE: u64 = 24;

/// Attribute type codes (§6).
pub const ATTR_STANDARD_INFORMATION: u32 = 0x10;
pub const ATTR_ATTRIBUTE_LIST: u32 = 0x20;
pub const ATTR_FILE_NAME: u32 = 0x30;
pub const ATTR_OBJECT_ID: u32 = 0x40;
pub const ATTR_SECURITY_DESCRIPTOR: u32 = 0x50;
pub const ATTR_VOLUME_NAME: u32 = 0x60;
pub const ATTR_VOLUME_INFORMATION: u32 = 0x70;
pub const ATTR_DATA: u32 = 0x80;
pub const ATTR_INDEX_ROOT: u32 = 0x90;
pub const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
pub const ATTR_BITMAP: u32 = 0xB0;
pub const ATTR_REPARSE_POINT: u32 = 0xC0;
pub const ATTR_EA_INFORMATION: u32 = 0xD0;
pub const ATTR_EA: u32 = 0xE0;
pub const ATTR_LOGGED_UTILITY_STREAM: u32 = 0x100;
/// Attribute-stream end marker (not a real attribute header).
pub const ATTR_END: u32 = 0xFFFF_FFFF;

/// MFT record header flags.
pub const MFT_RECORD_IN_USE: u16 = 0x0001;
pub const MFT_RECORD_IS_DIRECTORY: u16 = 0x0002;

/// `$FILE_NAME` namespace byte.
pub const FILE_NAME_POSIX: u8 = 0x00;
pub const FILE_NAME_WIN32: u8 = 0x01;
pub const FILE_NAME_DOS: u8 = 0x02;
pub const FILE_NAME_WIN32_AND_DOS: u8 = 0x03;

/// Windows `FILE_ATTRIBUTE_*` bits this core reasons about directly.
pub const FILE_ATTRIBUTE_READONLY: u32 = 0x0000_0001;
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x0000_0002;
pub const FILE_ATTRIBUTE_SYSTEM: u32 = 0x0000_0004;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x0000_0010;
pub const FILE_ATTRIBUTE_ARCHIVE: u32 = 0x0000_0020;
pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0000_0400;
pub const FILE_ATTRIBUTE_SPARSE_FILE: u32 = 0x0000_0200;
pub const FILE_ATTRIBUTE_COMPRESSED: u32 = 0x0000_0800;

/// Index entry flags (§4.5).
pub const INDEX_ENTRY_NODE: u16 = 0x01;
pub const INDEX_ENTRY_END: u16 = 0x02;

/// Index root header flag: this node has child nodes.
pub const INDEX_NODE: u32 = 0x01;

/// `$SII`/`$SDH`/`$O`/`$Q`/`$R` are the canonical `$Secure`/`$ObjId`/`$Reparse`
/// sub-indexes this core supports in `index::KeyKind`.
pub const COLLATION_FILE_NAME: u32 = 0x01;
pub const COLLATION_NTOFS_ULONG: u32 = 0x10;
pub const COLLATION_NTOFS_SID: u32 = 0x11;
pub const COLLATION_NTOFS_SECURITY_HASH: u32 = 0x12;
pub const COLLATION_NTOFS_ULONGS: u32 = 0x13;

/// `attr_size_tr` — threshold below which a shrinking non-resident attribute
/// is converted back to resident. Inherited from the reference driver; see
/// DESIGN.md "Open Question Decisions".
pub const ATTR_SIZE_TR: u32 = 320;

/// Maximum combined size of one inode's `$EA` payload.
pub const MAX_EA_DATA_SIZE: u32 = 64 * 1024;

/// Maximum file/attribute name length, in UTF-16 code units.
pub const MAX_NAME_LEN: usize = 255;

/// Size, in bits, of the MFT-record reserved allocation pool (§4.3).
pub const MFT_RESERVED_POOL_BITS: usize = 8;

/// Allocation placement hints for the space allocator (§4.3), passed as a
/// plain bitmask the way the rest of this core passes on-disk flag words.
pub const ALLOCATE_DEFAULT: u32 = 0;
/// Prefer the MFT zone when servicing this request.
pub const ALLOCATE_MFT: u32 = 0x1;
/// Allow dipping into the MFT zone reserve if the general pool is exhausted.
pub const ALLOCATE_FORCE: u32 = 0x2;

/// `Wnd::find` search-mode flags (§4.2).
pub const BITMAP_FIND_NONE: u32 = 0;
/// Only succeed if the returned run has exactly the requested length.
pub const BITMAP_FIND_FULL: u32 = 0x1;
/// Atomically mark the returned bits used before returning.
pub const BITMAP_FIND_MARK_AS_USED: u32 = 0x2;
