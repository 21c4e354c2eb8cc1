//! Space allocator (§4.3): cluster and MFT-record allocation on top of
//! [`Wnd`]. Two independent bitmaps share this module's allocation
//! vocabulary but are locked and grown independently by [`crate::ntfs::volume`];
//! this module only implements the per-bitmap allocation policy.

use ntfs_core::{NtfsError, NtfsResult};

use super::bitmap::Wnd;
use super::constants::BITMAP_FIND_MARK_AS_USED;

/// Cluster allocator: wraps the volume's cluster bitmap with a
/// next-free-LCN hint so sequential allocation requests stay local.
pub struct ClusterAllocator {
    next_free_lcn: u64,
}

impl ClusterAllocator {
    pub fn new() -> Self {
        Self { next_free_lcn: 0 }
    }

    /// Allocates up to `want_len` contiguous clusters starting near
    /// `hint_lcn` (or the remembered next-free hint if `hint_lcn` is 0).
    /// Returns the allocated `(lcn, got_len)`; `got_len <= want_len`.
    pub fn look_for_free_space(
        &mut self,
        bitmap: &mut Wnd,
        hint_lcn: u64,
        want_len: u64,
        opt: u32,
    ) -> NtfsResult<(u64, u64)> {
        let hint = if hint_lcn != 0 { hint_lcn } else { self.next_free_lcn };
        let (lcn, got_len) = bitmap.find(want_len, hint, opt | BITMAP_FIND_MARK_AS_USED)?;
        self.next_free_lcn = lcn + got_len;
        Ok((lcn, got_len))
    }

    pub fn mark_as_free_ex(&self, bitmap: &mut Wnd, lcn: u64, len: u64) {
        bitmap.set_free(lcn, len);
    }
}

impl Default for ClusterAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of reserved MFT-record slots held back for internal operations
/// (attribute-list expansion, MFT extension) so they cannot deadlock
/// waiting on a free record the way an ordinary create could.
pub const RESERVED_POOL_BITS: u64 = super::constants::MFT_RESERVED_POOL_BITS as u64;

/// MFT record-number allocator: wraps the MFT bitmap plus a small reserved
/// pool that only privileged (internal) callers may dip into.
pub struct MftAllocator {
    next_free_rno: u64,
}

impl MftAllocator {
    pub fn new(start_rno: u64) -> Self {
        Self { next_free_rno: start_rno }
    }

    /// Allocates one free MFT record number. `privileged` callers (internal
    /// operations growing the attribute list or the MFT itself) may draw
    /// from the reserved pool when the general bitmap is exhausted.
    pub fn look_free_mft(&mut self, bitmap: &mut Wnd, privileged: bool) -> NtfsResult<u64> {
        let general_bits = bitmap.nbits().saturating_sub(RESERVED_POOL_BITS);
        if self.next_free_rno < general_bits {
            if let Ok((rno, 1)) =
                bitmap.find(1, self.next_free_rno, BITMAP_FIND_MARK_AS_USED)
            {
                if rno < general_bits {
                    self.next_free_rno = rno + 1;
                    return Ok(rno);
                }
                // find() wandered into the reserved pool; undo and fall through.
                bitmap.set_free(rno, 1);
            }
        }

        if privileged {
            if let Ok((rno, 1)) = bitmap.find(1, general_bits, BITMAP_FIND_MARK_AS_USED) {
                return Ok(rno);
            }
        }

        Err(NtfsError::NoSpace)
    }

    pub fn mark_rec_free(&self, bitmap: &mut Wnd, rno: u64) {
        bitmap.set_free(rno, 1);
    }
}

/// Computed MFT zone bounds after a growth event (§4.2 zone, §4.3 `refresh_zone`).
pub fn refresh_zone(mft_bitmap_nbits: u64, total_clusters: u64) -> (u64, u64) {
    // Reserve roughly an eighth of the volume, capped, for MFT growth —
    // mirrors the fraction the reference NTFS driver targets for its own
    // zone so the MFT rarely fragments across the volume.
    let zone_len = (total_clusters / 8).min(total_clusters.saturating_sub(mft_bitmap_nbits));
    (mft_bitmap_nbits, mft_bitmap_nbits + zone_len)
}
