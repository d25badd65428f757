use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Encoded value standing for an infinite duration.
const INFINITE: u64 = u64::MAX;

const fn duration_to_u64(duration: Duration) -> u64 {
    (duration.as_secs() << 32) | duration.subsec_nanos() as u64
}

const fn u64_to_duration(secs_nanos: u64) -> Duration {
    Duration::new(secs_nanos >> 32, secs_nanos as u32)
}

const fn encode(duration: Option<Duration>) -> u64 {
    match duration {
        Some(d) if d.as_secs() < u32::MAX as u64 => duration_to_u64(d),
        // Anything beyond u32::MAX seconds is treated as infinite
        _ => INFINITE,
    }
}

const fn decode(v: u64) -> Option<Duration> {
    match v {
        INFINITE => None,
        v => Some(u64_to_duration(v)),
    }
}

/// An optional [`Duration`] that can be shared and updated across tasks.
///
/// `None` stands for an infinite duration.
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) fn new(duration: Option<Duration>) -> Self {
        Self(AtomicU64::new(encode(duration)))
    }

    pub(crate) fn store(&self, duration: Option<Duration>, order: Ordering) {
        self.0.store(encode(duration), order);
    }

    pub(crate) fn load(&self, order: Ordering) -> Option<Duration> {
        decode(self.0.load(order))
    }
}
