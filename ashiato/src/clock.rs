//! Wall clock sources and kernel time reconciliation.
//!
//! Kernel events are stamped with a monotonic nanosecond counter which has
//! no fixed epoch. [KernelClock] converts those timestamps into wall clock
//! time by maintaining an epoch (boot time) which is derived from the first
//! event seen and then corrected by clock synchronization samples.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::debug;

use crate::util::ns_duration;

/// Source of the current wall clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock returning the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline(always)]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock whose time only moves when told to. It is meant to drive
/// expiration deterministically (tests, simulations).
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = t;
    }

    pub fn advance(&self, d: Duration) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct KernelClock {
    epoch: Option<DateTime<Utc>>,
    max_drift: Duration,
}

impl KernelClock {
    pub fn new(max_drift: Duration) -> Self {
        Self {
            epoch: None,
            max_drift,
        }
    }

    #[inline(always)]
    pub fn epoch(&self) -> Option<DateTime<Utc>> {
        self.epoch
    }

    /// Converts a kernel timestamp into wall clock time. The first
    /// conversion sets a provisional epoch so that `kernel_ns` maps to `now`.
    pub fn to_wall(&mut self, kernel_ns: u64, now: DateTime<Utc>) -> DateTime<Utc> {
        let ts = ns_duration(kernel_ns);
        let epoch = *self.epoch.get_or_insert_with(|| now - ts);
        epoch + ts
    }

    /// Applies a synchronization sample made of a kernel timestamp and the
    /// wall clock time (in ns since UNIX epoch) taken at the same instant.
    /// The epoch is only replaced when it drifted more than the maximum
    /// allowed. Returns true if the epoch was replaced.
    pub fn sync(&mut self, kernel_ns: u64, wall_ns: u64) -> bool {
        let boot_time =
            DateTime::<Utc>::default() + ns_duration(wall_ns) - ns_duration(kernel_ns);

        match self.epoch {
            Some(epoch) => {
                let mut drift = boot_time - epoch;
                if drift < Duration::zero() {
                    drift = -drift;
                }
                if drift > self.max_drift {
                    debug!(
                        "clock drift of {drift} detected, replacing epoch {epoch} with {boot_time}"
                    );
                    self.epoch = Some(boot_time);
                    return true;
                }
                false
            }
            None => {
                debug!("epoch set by clock sync to {boot_time}");
                self.epoch = Some(boot_time);
                true
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn wall_ns(t: DateTime<Utc>) -> u64 {
        t.timestamp_nanos_opt().unwrap() as u64
    }

    #[test]
    fn test_provisional_epoch() {
        let now = ts("2024-03-01T10:00:00Z");
        let mut kc = KernelClock::new(Duration::milliseconds(100));

        assert_eq!(kc.to_wall(5_000_000_000, now), now);
        assert_eq!(kc.epoch(), Some(now - Duration::seconds(5)));
        // subsequent conversions do not depend on now anymore
        assert_eq!(
            kc.to_wall(6_000_000_000, now + Duration::hours(1)),
            now + Duration::seconds(1)
        );
    }

    #[test]
    fn test_sync_within_drift() {
        let now = ts("2024-03-01T10:00:00Z");
        let mut kc = KernelClock::new(Duration::milliseconds(100));
        let before = kc.to_wall(1_000_000_000, now);

        // sample says boot time is 50ms later than our epoch
        let sample = now + Duration::milliseconds(50);
        assert!(!kc.sync(1_000_000_000, wall_ns(sample)));
        assert_eq!(kc.to_wall(1_000_000_000, now), before);
    }

    #[test]
    fn test_sync_beyond_drift() {
        let now = ts("2024-03-01T10:00:00Z");
        let mut kc = KernelClock::new(Duration::milliseconds(100));
        kc.to_wall(1_000_000_000, now);

        let sample = now + Duration::seconds(2);
        assert!(kc.sync(1_000_000_000, wall_ns(sample)));
        assert_eq!(kc.to_wall(1_000_000_000, now), sample);
        assert_eq!(
            kc.to_wall(3_000_000_000, now),
            sample + Duration::seconds(2)
        );
    }

    #[test]
    fn test_manual_clock() {
        let start = ts("2024-03-01T10:00:00Z");
        let c = ManualClock::new(start);
        c.advance(Duration::seconds(30));
        assert_eq!(c.now(), start + Duration::seconds(30));
        c.set(start);
        assert_eq!(c.now(), start);
    }
}
