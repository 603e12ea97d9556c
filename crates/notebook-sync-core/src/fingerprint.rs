//! Cheap change-detection fingerprints.
//!
//! A [`Fingerprint`] is the `(key, modified, size)` triple of a stored item.
//! It stands in for a content checksum: if any of the three fields differ the
//! item is assumed to have changed. Modification times are kept at whole-second
//! resolution because filesystem mtime precision ranges from 1s to 1ns and the
//! sub-second part adds noise without reliable signal.
//!
//! Size is the only signal for "content changed within the same second". Two
//! writes of equal length inside one second are indistinguishable; this is a
//! known false negative of the scheme, not something it tries to fix.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identity plus metadata of one stored item.
///
/// Equality is structural over all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint<K> {
    pub key: K,
    /// Unix seconds, rounded to the nearest second.
    pub modified: i64,
    /// Size in bytes.
    pub size: u64,
}

impl<K> Fingerprint<K> {
    pub fn new(key: K, modified: i64, size: u64) -> Self {
        Self {
            key,
            modified,
            size,
        }
    }

    /// Builds a fingerprint from a filesystem timestamp.
    pub fn from_system_time(key: K, modified: SystemTime, size: u64) -> Self {
        Self::new(key, unix_seconds(modified), size)
    }

    /// Builds a fingerprint from a chrono timestamp.
    pub fn from_datetime(key: K, modified: DateTime<Utc>, size: u64) -> Self {
        Self::new(key, datetime_seconds(modified), size)
    }
}

/// Converts a [`SystemTime`] into Unix seconds, rounded to the nearest second.
///
/// Times before the epoch produce negative values.
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => round_secs(after) as i64,
        Err(before) => -(round_secs(before.duration()) as i64),
    }
}

/// Converts a chrono timestamp into Unix seconds, rounded to the nearest second.
pub fn datetime_seconds(time: DateTime<Utc>) -> i64 {
    let secs = time.timestamp();
    if time.timestamp_subsec_nanos() >= 500_000_000 {
        secs + 1
    } else {
        secs
    }
}

/// Inverse of [`datetime_seconds`]. Out-of-range values clamp to the epoch.
pub fn seconds_to_datetime(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// The current time truncated to a whole second.
pub fn now_seconds() -> DateTime<Utc> {
    seconds_to_datetime(Utc::now().timestamp())
}

fn round_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() >= 500_000_000)
}

/// Builds a key → fingerprint map from best-effort metadata reads.
///
/// Items whose metadata read yields `None` (deleted mid-scan, permission
/// denied) are left out instead of failing the batch. On duplicate keys the
/// last one wins.
pub fn collect_fingerprints<K, I>(items: I) -> HashMap<K, Fingerprint<K>>
where
    K: Eq + Hash + Clone,
    I: IntoIterator<Item = Option<Fingerprint<K>>>,
{
    items
        .into_iter()
        .flatten()
        .map(|fp| (fp.key.clone(), fp))
        .collect()
}
