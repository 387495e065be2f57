//! Monotonic time for periodic task release

use core::{cmp::Ordering, ops};
use std::io;

pub use core::time::Duration;

const NANOS_IN_ONE_SEC: i64 = 1_000_000_000;

/// A reading of `CLOCK_MONOTONIC`. Opaque and useful only with `Duration`
#[derive(Clone, Copy)]
pub struct Instant {
    ts: libc::timespec,
}

impl PartialEq for Instant {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Instant {}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ts.tv_sec, self.ts.tv_nsec).cmp(&(other.ts.tv_sec, other.ts.tv_nsec))
    }
}

impl core::fmt::Debug for Instant {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Instant({}.{:09})", self.ts.tv_sec, self.ts.tv_nsec)
    }
}

fn clock_gettime(clk_id: libc::clockid_t) -> io::Result<libc::timespec> {
    let mut ts = core::mem::MaybeUninit::<libc::timespec>::uninit();
    let res = unsafe { libc::clock_gettime(clk_id, ts.as_mut_ptr()) };
    if res == 0 {
        Ok(unsafe { ts.assume_init() })
    } else {
        Err(io::Error::last_os_error())
    }
}

impl Instant {
    /// Returns an instant corresponding to "now".
    pub fn now() -> Self {
        // CLOCK_MONOTONIC is always present on Linux, the call can only fail on a bad pointer
        let ts = clock_gettime(libc::CLOCK_MONOTONIC).unwrap_or(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        });
        Self { ts }
    }

    /// Returns `Some(t)` where t is the time `self + duration` if t can be represented as `Instant`
    /// (which means it's inside the bounds of the underlying data structure), `None` otherwise.
    pub fn checked_add(&self, dur: Duration) -> Option<Instant> {
        let mut secs = self
            .ts
            .tv_sec
            .checked_add(i64::try_from(dur.as_secs()).ok()?)?;
        let mut nanos = self.ts.tv_nsec + i64::from(dur.subsec_nanos());

        if nanos >= NANOS_IN_ONE_SEC {
            nanos -= NANOS_IN_ONE_SEC;
            secs = secs.checked_add(1)?;
        }

        Some(Instant {
            ts: libc::timespec {
                tv_sec: secs,
                tv_nsec: nanos,
            },
        })
    }

    /// Returns the amount of time elapsed from another instant to this one, or `None` if that
    /// instant is later than this one.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        if self < &earlier {
            None
        } else {
            let (sec, nsec) = if self.ts.tv_nsec >= earlier.ts.tv_nsec {
                (
                    self.ts.tv_sec - earlier.ts.tv_sec,
                    self.ts.tv_nsec - earlier.ts.tv_nsec,
                )
            } else {
                (
                    self.ts.tv_sec - 1 - earlier.ts.tv_sec,
                    self.ts.tv_nsec + NANOS_IN_ONE_SEC - earlier.ts.tv_nsec,
                )
            };

            // NOTE `nsec` is always less than `1_000_000_000`
            // NOTE `sec` is always positive
            Some(Duration::new(sec as u64, nsec as u32))
        }
    }

    /// Returns the amount of time elapsed from another instant to this one, or zero duration if
    /// that instant is later than this one.
    pub fn saturating_duration_since(&self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().saturating_duration_since(*self)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Self;

    fn add(self, dur: Duration) -> Self {
        self.checked_add(dur).unwrap_or(Instant {
            ts: libc::timespec {
                tv_sec: i64::MAX,
                tv_nsec: 0,
            },
        })
    }
}

impl From<Instant> for libc::timespec {
    fn from(i: Instant) -> libc::timespec {
        i.ts
    }
}

/// Sleeps until the monotonic clock reaches `deadline`. Returns at once for past deadlines.
pub fn delay_until(deadline: Instant) {
    let ts: libc::timespec = deadline.into();
    loop {
        let res = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                core::ptr::null_mut(),
            )
        };
        // Woken by a signal, go back to sleep
        if res != libc::EINTR {
            break;
        }
    }
}

/// Keeps the CPU busy for `budget` of wall time
pub fn spin_for(budget: Duration) {
    let start = Instant::now();
    while start.elapsed() < budget {
        core::hint::spin_loop();
    }
}
