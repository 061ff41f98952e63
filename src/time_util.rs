use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp as carried on kernel input events: seconds and
/// microseconds since the epoch, matching `struct timeval`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventTime {
    pub sec: i64,
    pub usec: i64,
}

impl EventTime {
    #[must_use]
    pub const fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    /// Millisecond difference `self - earlier`, truncating sub-millisecond
    /// remainders the way the kernel timestamps are compared.
    #[must_use]
    pub const fn msec_since(self, earlier: Self) -> i64 {
        (self.usec / 1000 - earlier.usec / 1000) + (self.sec - earlier.sec) * 1000
    }

    /// The absolute time `millis` milliseconds after `self`.
    #[must_use]
    pub const fn msec_after(self, millis: i64) -> Self {
        let usec = self.usec + (millis % 1000) * 1000;
        Self {
            sec: self.sec + millis / 1000 + usec / 1_000_000,
            usec: usec % 1_000_000,
        }
    }
}

impl From<SystemTime> for EventTime {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs() as i64,
                usec: i64::from(d.subsec_micros()),
            },
            // a pre-epoch clock only happens on badly broken systems
            Err(_) => Self::default(),
        }
    }
}

/// Source of "now" for the resolver's timeout checks.
///
/// Production code uses [`SystemClock`] so ages compare against the
/// CLOCK_REALTIME timestamps the kernel stamps on events; tests drive a
/// manual clock.
pub trait Clock: Send {
    fn now(&self) -> EventTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> EventTime {
        SystemTime::now().into()
    }
}
