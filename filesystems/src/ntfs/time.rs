//! NT time: 100-nanosecond ticks since 1601-01-01 00:00:00 UTC.
//!
//! `std_timestamps.rs` in the reference driver saturates to `0` for any time
//! before the Unix epoch, which loses every `$STANDARD_INFORMATION` timestamp
//! that predates 1970 and fails to round-trip exactly even inside that range
//! (it drops sub-second precision below 100ns going through `SystemTime`).
//! This core keeps the conversion exact and total: every `u64` NT time maps
//! to a `SystemTime` and back to the same `u64`, with no panics and no silent
//! clamping to zero.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NT epoch (1601-01-01) and the Unix epoch (1970-01-01).
const EPOCH_DIFF_SECS: i64 = 11_644_473_600;
/// NT time ticks per `Duration` nanosecond unit (100ns per tick).
const NANOS_PER_TICK: u32 = 100;

/// Converts an NT time value to a [`SystemTime`].
///
/// Never fails: NT time is unsigned and the NT epoch predates the Unix epoch
/// by about 369 years, so every representable `u64` is representable as a
/// `SystemTime` on every platform this core targets.
pub fn nt_time_to_system_time(nt_time: u64) -> SystemTime {
    // Work in signed nanoseconds-since-Unix-epoch throughout so the sign of
    // the result never has to be untangled from a separate secs/nanos split.
    let nanos_since_nt_epoch = nt_time as i128 * NANOS_PER_TICK as i128;
    let nanos_since_unix_epoch =
        nanos_since_nt_epoch - EPOCH_DIFF_SECS as i128 * 1_000_000_000;
    let secs = nanos_since_unix_epoch.div_euclid(1_000_000_000);
    let subsec_nanos = nanos_since_unix_epoch.rem_euclid(1_000_000_000) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, subsec_nanos)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0) + Duration::new(0, subsec_nanos)
    }
}

/// Converts a [`SystemTime`] to an NT time value.
///
/// Clamps to `0` / `u64::MAX` only for times so far outside NTFS's usable
/// range (roughly years 1601-60056) that a `u64` tick count cannot hold
/// them; ordinary filesystem timestamps never hit either clamp.
pub fn system_time_to_nt_time(time: SystemTime) -> u64 {
    let nanos_since_unix_epoch: i128 = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    };
    let nanos_since_nt_epoch =
        nanos_since_unix_epoch + EPOCH_DIFF_SECS as i128 * 1_000_000_000;
    let ticks = nanos_since_nt_epoch.div_euclid(NANOS_PER_TICK as i128);
    ticks.clamp(0, u64::MAX as i128) as u64
}

/// Returns the current time as an NT time value.
pub fn now() -> u64 {
    system_time_to_nt_time(SystemTime::now())
}

/// Formats an NT time value for log output, e.g. `2024-03-05 12:00:00 UTC`.
pub fn format_nt_time(nt_time: u64) -> String {
    let secs = system_time_to_nt_time_secs(nt_time);
    match chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => format!("out-of-range NT time {nt_time}"),
    }
}

fn system_time_to_nt_time_secs(nt_time: u64) -> i64 {
    let st = nt_time_to_system_time(nt_time);
    match st.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// The four timestamps carried by `$STANDARD_INFORMATION` and (duplicated)
/// by `$FILE_NAME`, all in NT time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamps {
    pub created: u64,
    pub modified: u64,
    pub mft_modified: u64,
    pub accessed: u64,
}

impl Timestamps {
    /// All four timestamps set to the current time.
    pub fn now() -> Self {
        let t = now();
        Self { created: t, modified: t, mft_modified: t, accessed: t }
    }

    /// Returns a copy with `modified` and `mft_modified` bumped to now,
    /// matching what a data write does to `$STANDARD_INFORMATION` (§4.6).
    pub fn touch_modified(&self) -> Self {
        let t = now();
        log::trace!("touch_modified: {}", format_nt_time(t));
        Self { modified: t, mft_modified: t, ..*self }
    }

    /// Returns a copy with only `accessed` bumped to now.
    pub fn touch_accessed(&self) -> Self {
        Self { accessed: now(), ..*self }
    }

    /// Decodes the pre-3.0 48-byte `$STANDARD_INFORMATION` body: four NT
    /// timestamps followed by `file_attributes`/`max_versions`/
    /// `version_number`/`class_id`, each a `u32`. The trailing fields beyond
    /// the timestamps round-trip opaquely through [`StandardInformation`].
    pub fn decode(data: &[u8]) -> Option<(Self, StandardInformationTail)> {
        if data.len() < 48 {
            return None;
        }
        let timestamps = Self {
            created: u64::from_le_bytes(data[0..8].try_into().ok()?),
            modified: u64::from_le_bytes(data[8..16].try_into().ok()?),
            mft_modified: u64::from_le_bytes(data[16..24].try_into().ok()?),
            accessed: u64::from_le_bytes(data[24..32].try_into().ok()?),
        };
        let tail = StandardInformationTail {
            file_attributes: u32::from_le_bytes(data[32..36].try_into().ok()?),
            max_versions: u32::from_le_bytes(data[36..40].try_into().ok()?),
            version_number: u32::from_le_bytes(data[40..44].try_into().ok()?),
            class_id: u32::from_le_bytes(data[44..48].try_into().ok()?),
        };
        Some((timestamps, tail))
    }

    /// Encodes back into the 48-byte layout [`Self::decode`] reads.
    pub fn encode(&self, tail: &StandardInformationTail) -> [u8; 48] {
        let mut buf = [0u8; 48];
        buf[0..8].copy_from_slice(&self.created.to_le_bytes());
        buf[8..16].copy_from_slice(&self.modified.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mft_modified.to_le_bytes());
        buf[24..32].copy_from_slice(&self.accessed.to_le_bytes());
        buf[32..36].copy_from_slice(&tail.file_attributes.to_le_bytes());
        buf[36..40].copy_from_slice(&tail.max_versions.to_le_bytes());
        buf[40..44].copy_from_slice(&tail.version_number.to_le_bytes());
        buf[44..48].copy_from_slice(&tail.class_id.to_le_bytes());
        buf
    }
}

/// The non-timestamp fields of `$STANDARD_INFORMATION`, carried through
/// `touch_modified`/`touch_accessed` unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardInformationTail {
    pub file_attributes: u32,
    pub max_versions: u32,
    pub version_number: u32,
    pub class_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_system_time() {
        for nt in [0u64, 1, 116_444_736_000_000_000, 133_000_000_000_000_000, u64::MAX / 2] {
            let st = nt_time_to_system_time(nt);
            let back = system_time_to_nt_time(st);
            assert_eq!(nt, back, "round trip failed for {nt}");
        }
    }

    #[test]
    fn unix_epoch_matches_known_nt_time() {
        // 1970-01-01 00:00:00 UTC in NT time is a well-known constant.
        assert_eq!(system_time_to_nt_time(UNIX_EPOCH), 116_444_736_000_000_000);
        assert_eq!(nt_time_to_system_time(116_444_736_000_000_000), UNIX_EPOCH);
    }

    #[test]
    fn predates_unix_epoch_without_clamping() {
        let nt = 1u64; // 1601-01-01 00:00:00.0000001 UTC
        let st = nt_time_to_system_time(nt);
        assert!(st < UNIX_EPOCH);
        assert_eq!(system_time_to_nt_time(st), nt);
    }

    #[test]
    fn touch_modified_bumps_modified_and_mft_modified_only() {
        let base = Timestamps { created: 10, modified: 10, mft_modified: 10, accessed: 10 };
        let touched = base.touch_modified();
        assert_eq!(touched.created, 10);
        assert_eq!(touched.accessed, 10);
        assert!(touched.modified >= base.modified);
        assert!(touched.mft_modified >= base.mft_modified);
    }

    #[test]
    fn standard_information_round_trips_through_encode_decode() {
        let timestamps = Timestamps { created: 1, modified: 2, mft_modified: 3, accessed: 4 };
        let tail = StandardInformationTail { file_attributes: 0x20, max_versions: 0, version_number: 0, class_id: 0 };
        let bytes = timestamps.encode(&tail);
        let (decoded, decoded_tail) = Timestamps::decode(&bytes).unwrap();
        assert_eq!(decoded, timestamps);
        assert_eq!(decoded_tail, tail);
    }

    #[test]
    fn standard_information_decode_rejects_short_buffers() {
        assert!(Timestamps::decode(&[0u8; 40]).is_none());
    }
}
