//! Leaky-bucket throttle gating how often the dataplane is applied.

/// Each refill adds one token up to `max`; each admitted apply takes one.
#[derive(Debug, Clone)]
pub struct Throttle {
    max: u32,
    tokens: u32,
}

impl Throttle {
    /// A throttle with an empty bucket.
    pub fn new(max: u32) -> Self {
        Self { max, tokens: 0 }
    }

    pub fn refill(&mut self) {
        if self.tokens < self.max {
            self.tokens += 1;
        }
    }

    /// Takes a token if one is available.
    pub fn admit(&mut self) -> bool {
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Whether `admit` would currently succeed, without taking a token.
    pub fn would_admit(&self) -> bool {
        self.tokens > 0
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_starts_empty() {
        let mut t = Throttle::new(10);
        assert!(!t.would_admit());
        assert!(!t.admit());
        t.refill();
        assert!(t.admit());
        assert!(!t.admit());
    }

    #[test]
    fn test_refill_is_capped() {
        let mut t = Throttle::new(3);
        for _ in 0..10 {
            t.refill();
        }
        assert_eq!(t.tokens(), 3);
        assert!(t.admit());
        assert!(t.admit());
        assert!(t.admit());
        assert!(!t.admit());
    }
}
