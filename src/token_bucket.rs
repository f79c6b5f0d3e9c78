use std::time::Duration;
use tokio::time::Instant;

/// Continuous-refill token bucket.
///
/// No internal locking: callers serialize access (the registry holds its
/// mutex around every call).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. A zero capacity is raised to 1.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(1);
        let refill_rate = if refill_rate.is_finite() {
            refill_rate.max(0.0)
        } else {
            0.0
        };

        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Time until one token is available, `None` if one is available now.
    pub fn time_until_available(&mut self) -> Option<Duration> {
        self.time_until_available_at(Instant::now())
    }

    pub fn time_until_available_at(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);

        if self.tokens >= 1.0 {
            return None;
        }

        if self.refill_rate <= 0.0 {
            return Some(Duration::MAX);
        }

        // A tiny rate can push the wait past what a `Duration` holds.
        let tokens_needed = 1.0 - self.tokens;
        Some(
            Duration::try_from_secs_f64(tokens_needed / self.refill_rate)
                .unwrap_or(Duration::MAX),
        )
    }

    fn refill(&mut self, now: Instant) {
        // An instant older than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();

        self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_creation() {
        let bucket = TokenBucket::new(10, 2.0);
        assert_eq!(bucket.capacity(), 10);
        assert_eq!(bucket.refill_rate(), 2.0);
    }

    #[test]
    fn test_available_tokens() {
        let mut bucket = TokenBucket::new(10, 0.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert_eq!(bucket.available_tokens(), 8);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut bucket = TokenBucket::new(0, 1.0);
        assert_eq!(bucket.capacity(), 1);
        assert!(bucket.try_acquire());
    }

    #[test]
    fn test_burst_then_refill() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(4, 2.0, start);

        for _ in 0..4 {
            assert!(bucket.try_acquire_at(start));
        }
        assert!(!bucket.try_acquire_at(start));

        let later = start + Duration::from_secs(1);
        assert!(bucket.try_acquire_at(later));
        assert!(bucket.try_acquire_at(later));
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(5, 1000.0, start);
        assert!(bucket.try_acquire_at(start));

        // A long idle period refills to capacity, never above it.
        let later = start + Duration::from_secs(3600);
        for _ in 0..5 {
            assert!(bucket.try_acquire_at(later));
        }
        assert!(!bucket.try_acquire_at(later));
    }

    #[test]
    fn test_denied_call_leaves_partial_tokens() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1, 1.0, start);
        assert!(bucket.try_acquire_at(start));

        // Half a token is not enough, and the denial does not consume it.
        let half = start + Duration::from_millis(500);
        assert!(!bucket.try_acquire_at(half));
        let full = start + Duration::from_millis(1000);
        assert!(bucket.try_acquire_at(full));
    }

    #[test]
    fn test_zero_refill_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(2, 0.0, start);
        assert!(bucket.try_acquire_at(start));
        assert!(bucket.try_acquire_at(start));

        let later = start + Duration::from_secs(60);
        assert!(!bucket.try_acquire_at(later));
        assert_eq!(bucket.time_until_available_at(later), Some(Duration::MAX));
    }

    #[test]
    fn test_time_until_available() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1, 4.0, start);
        assert_eq!(bucket.time_until_available_at(start), None);

        assert!(bucket.try_acquire_at(start));
        let wait = bucket.time_until_available_at(start).unwrap();
        assert_eq!(wait, Duration::from_millis(250));
    }

    #[test]
    fn test_tiny_refill_rate_saturates_wait() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(1, 1e-20, start);
        assert!(bucket.try_acquire_at(start));

        assert_eq!(bucket.time_until_available_at(start), Some(Duration::MAX));
        assert!(!bucket.try_acquire_at(start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_window_bound_holds() {
        // Allowed calls over any window T never exceed C + R*T.
        let capacity = 3u32;
        let rate = 5.0;
        let start = Instant::now();
        let mut bucket = TokenBucket::new_at(capacity, rate, start);

        let step = Duration::from_millis(7);
        let mut allowed_at = Vec::new();
        for i in 0..1000u32 {
            let now = start + step * i;
            if bucket.try_acquire_at(now) {
                allowed_at.push(now);
            }
        }

        let window = Duration::from_secs(1);
        let bound = capacity as f64 + rate * window.as_secs_f64();
        for (i, &begin) in allowed_at.iter().enumerate() {
            let count = allowed_at[i..]
                .iter()
                .take_while(|&&t| t.duration_since(begin) <= window)
                .count();
            assert!(count as f64 <= bound, "{} allowed in one window", count);
        }
    }
}
