//! Network-adjusted time from peer samples.
//!
//! Each connected peer contributes the timestamp from its version message.
//! The median of the collected offsets is applied to the local clock when
//! judging block timestamps, so a skewed local clock does not make the node
//! reject honest blocks. Sample weighting keeps any single peer from pushing
//! the offset past a fixed bound.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Maximum number of offset samples retained.
const MAX_TIME_SAMPLES: usize = 200;

/// Offsets need at least this many samples before the median is applied.
const MIN_TIME_SAMPLES: usize = 5;

/// A median offset at or beyond this magnitude disables adjustment entirely;
/// something is wrong with either the local clock or most of the peer set.
const MAX_ALLOWED_OFFSET_SECS: i64 = 70 * 60;

/// A clock adjusted by the median offset of remote peer clocks.
///
/// Shared as `Arc<MedianTime>` between the peer handles that feed it and the
/// validator that reads it.
pub struct MedianTime {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Offsets (remote minus local) in seconds, insertion order.
    offsets: Vec<i64>,
    /// Sources that already contributed, one sample each.
    known_sources: HashSet<String>,
    /// Currently applied offset.
    offset_secs: i64,
}

impl MedianTime {
    /// Create a time source with no samples (zero offset).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                offsets: Vec::new(),
                known_sources: HashSet::new(),
                offset_secs: 0,
            }),
        }
    }

    /// Record a timestamp sample from the given source.
    ///
    /// Only the first sample per source counts; the retained set is bounded
    /// to [`MAX_TIME_SAMPLES`]. The applied offset is recomputed on odd
    /// sample counts once enough samples exist, which keeps the median stable
    /// while samples stream in pairs.
    pub fn add_time_sample(&self, source: &str, timestamp: i64) {
        let mut inner = self.inner.lock();

        if !inner.known_sources.insert(source.to_string()) {
            return;
        }

        let offset = timestamp - unix_now();
        if inner.offsets.len() == MAX_TIME_SAMPLES {
            inner.offsets.remove(0);
        }
        inner.offsets.push(offset);
        debug!(source, offset, samples = inner.offsets.len(), "Added time sample");

        let count = inner.offsets.len();
        if count < MIN_TIME_SAMPLES || count % 2 == 0 {
            return;
        }

        let mut sorted = inner.offsets.clone();
        sorted.sort_unstable();
        let median = sorted[count / 2];

        if median.abs() < MAX_ALLOWED_OFFSET_SECS {
            inner.offset_secs = median;
        } else if inner.offset_secs != 0 {
            warn!(
                median,
                "Median time offset exceeds allowed bound; using local clock"
            );
            inner.offset_secs = 0;
        } else {
            inner.offset_secs = 0;
        }
    }

    /// Current unix time adjusted by the accepted median offset.
    pub fn adjusted_time(&self) -> i64 {
        unix_now() + self.inner.lock().offset_secs
    }

    /// The currently applied offset in seconds.
    pub fn offset_secs(&self) -> i64 {
        self.inner.lock().offset_secs
    }
}

impl Default for MedianTime {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
