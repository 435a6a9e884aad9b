use std::time::{Duration, Instant};

/// Unit a rate is expressed in: bits or bytes, per second (the only unit the
/// public builder exposes; other durations collapse to a per-second rate
/// before a `Bucket` is built).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Unit {
    Bits,
    Bytes,
}

/// Result of `Limiter::acquire`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Caller should wait this long before retrying the same request.
    Wait(Duration),
}

pub trait Limiter: Send {
    fn acquire(&mut self, n: u64) -> Admission;
}

/// Never throttles; used for channels with no configured rate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLimiter;

impl Limiter for NullLimiter {
    fn acquire(&mut self, _n: u64) -> Admission {
        Admission::Granted
    }
}

/// Token bucket with lazy refill: `acquire` recomputes the available token
/// count from the elapsed time since the last refill rather than ticking on
/// a timer. Burst capacity defaults to one second of `rate`.
#[derive(Debug)]
pub struct Bucket {
    rate_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// `rate` is expressed in `unit`s per second.
    pub fn new(rate: f64, unit: Unit) -> Bucket {
        let rate_per_sec = match unit {
            Unit::Bytes => rate,
            Unit::Bits => rate / 8.0,
        };
        Bucket::with_capacity(rate_per_sec, rate_per_sec)
    }

    /// Same as `new`, but with an explicit burst cap instead of the
    /// one-second-of-rate default.
    pub fn with_capacity(rate_per_sec: f64, capacity: f64) -> Bucket {
        Bucket {
            rate_per_sec,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }
}

impl Limiter for Bucket {
    fn acquire(&mut self, n: u64) -> Admission {
        self.refill();

        let cost = n as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            return Admission::Granted;
        }

        let deficit = cost - self.tokens;
        let wait_secs = deficit / self.rate_per_sec;
        Admission::Wait(Duration::from_secs_f64(wait_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_limiter_always_grants() {
        let mut limiter = NullLimiter;
        assert_eq!(limiter.acquire(u64::MAX), Admission::Granted);
    }

    #[test]
    fn grants_within_burst() {
        let mut bucket = Bucket::new(1000.0, Unit::Bytes);
        assert_eq!(bucket.acquire(500), Admission::Granted);
        assert_eq!(bucket.acquire(500), Admission::Granted);
    }

    #[test]
    fn denies_over_burst_with_wait_hint() {
        let mut bucket = Bucket::new(1000.0, Unit::Bytes);
        assert_eq!(bucket.acquire(1000), Admission::Granted);

        match bucket.acquire(500) {
            Admission::Wait(d) => assert!(d.as_secs_f64() > 0.0),
            Admission::Granted => panic!("expected the bucket to be empty"),
        }
    }

    #[test]
    fn bits_are_converted_to_bytes() {
        let bucket = Bucket::new(8000.0, Unit::Bits);
        assert!((bucket.rate_per_sec - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn refill_recovers_tokens_over_time() {
        let mut bucket = Bucket::new(1_000_000.0, Unit::Bytes);
        bucket.acquire(1_000_000);
        std::thread::sleep(Duration::from_millis(20));
        // At 1MB/s, 20ms should refill roughly 20KB.
        assert_eq!(bucket.acquire(1000), Admission::Granted);
    }
}
