use std::time::Duration;

/// Reconnect delay table indexed by consecutive failed attempts.
///
/// Attempts past the end of the table reuse its last entry, so the table's
/// last value is the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    /// Build from a table in milliseconds. Entries smaller than their
    /// predecessor are raised so the sequence never decreases.
    pub fn from_millis(table: &[u64]) -> Self {
        let mut floor = 0;
        let delays = table
            .iter()
            .map(|&ms| {
                floor = floor.max(ms);
                Duration::from_millis(floor)
            })
            .collect::<Vec<_>>();

        if delays.is_empty() {
            return Self {
                delays: vec![Duration::ZERO],
            };
        }
        Self { delays }
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let index = (attempts as usize).min(self.delays.len() - 1);
        self.delays[index]
    }

    pub fn max_delay(&self) -> Duration {
        self.delays[self.delays.len() - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tab_relay_common::DEFAULT_BACKOFF_MS;

    #[test]
    fn test_default_table() {
        let backoff = Backoff::from_millis(&DEFAULT_BACKOFF_MS);
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(4), Duration::from_secs(3));
        assert_eq!(backoff.delay(9), Duration::from_secs(5));
        assert_eq!(backoff.delay(500), Duration::from_secs(5));
        assert_eq!(backoff.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_never_decreases() {
        let backoff = Backoff::from_millis(&[100, 50, 400, 200]);
        let delays: Vec<_> = (0..6).map(|i| backoff.delay(i)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[1], Duration::from_millis(100));
    }

    #[test]
    fn test_empty_table_means_no_delay() {
        let backoff = Backoff::from_millis(&[]);
        assert_eq!(backoff.delay(3), Duration::ZERO);
    }
}
