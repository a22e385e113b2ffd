use regex::Regex;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// How many identity keys the timer table retains; the least recently used
/// entry is evicted beyond that.
const TIMER_TABLE_CAP: usize = 8192;

/// A rate limit in "N messages per period" form, e.g. `100 messages/hour`,
/// `10/m` or `1 / 30s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSpec {
    pub messages: u64,
    pub period: Duration,
}

impl ThrottleSpec {
    pub fn parse(input: &str) -> Option<Self> {
        let re = Regex::new(
            r"(?i)^\s*(\d+)\s*(?:messages?)?\s*/\s*(\d*)\s*(s|sec|seconds?|m|min|minutes?|h|hours?)\s*$",
        )
        .unwrap();
        let captures = re.captures(input)?;

        let messages: u64 = captures[1].parse().ok()?;
        if messages == 0 {
            return None;
        }
        let count: u64 = match captures[2].is_empty() {
            true => 1,
            false => captures[2].parse().ok()?,
        };
        let unit = match captures[3].to_ascii_lowercase().chars().next()? {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return None,
        };

        Some(Self {
            messages,
            period: Duration::from_secs(count * unit),
        })
    }

    fn min_interval(&self) -> Duration {
        self.period / self.messages as u32
    }
}

struct TimerEntry {
    last: Instant,
    used: u64,
}

/// Per-identity admission timer. A key is admitted when at least
/// `period / N` has passed since its previous admission, otherwise the
/// caller is told how long to wait. The table is LRU-capped so idle keys
/// do not accumulate.
pub struct Throttle {
    spec: ThrottleSpec,
    timers: Mutex<Timers>,
}

struct Timers {
    entries: HashMap<String, TimerEntry>,
    clock: u64,
}

impl Throttle {
    pub fn new(spec: ThrottleSpec) -> Self {
        Self {
            spec,
            timers: Mutex::new(Timers {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Zero means admitted now (and the admission is recorded); anything
    /// else is how long the caller should wait before asking again.
    pub fn check(&self, key: &str) -> Duration {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Duration {
        let min_interval = self.spec.min_interval();
        let mut timers = self.timers.lock().unwrap();
        timers.clock += 1;
        let clock = timers.clock;

        if let Some(entry) = timers.entries.get_mut(key) {
            entry.used = clock;
            let elapsed = now.duration_since(entry.last);
            if elapsed < min_interval {
                return min_interval - elapsed;
            }
            entry.last = now;
            return Duration::ZERO;
        }

        if timers.entries.len() >= TIMER_TABLE_CAP {
            let oldest = timers
                .entries
                .iter()
                .min_by_key(|(_, e)| e.used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                timers.entries.remove(&oldest);
            }
        }

        timers
            .entries
            .insert(key.to_string(), TimerEntry { last: now, used: clock });
        Duration::ZERO
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_common_forms() {
        assert_eq!(
            ThrottleSpec::parse("100 messages/hour"),
            Some(ThrottleSpec {
                messages: 100,
                period: Duration::from_secs(3600)
            })
        );
        assert_eq!(
            ThrottleSpec::parse("10/m"),
            Some(ThrottleSpec {
                messages: 10,
                period: Duration::from_secs(60)
            })
        );
        assert_eq!(
            ThrottleSpec::parse("1 / 30s"),
            Some(ThrottleSpec {
                messages: 1,
                period: Duration::from_secs(30)
            })
        );
        assert_eq!(ThrottleSpec::parse("garbage"), None);
        assert_eq!(ThrottleSpec::parse("0/m"), None);
    }

    #[test]
    fn admissions_are_spaced_by_min_interval() {
        let throttle = Throttle::new(ThrottleSpec {
            messages: 2,
            period: Duration::from_secs(10),
        });
        let start = Instant::now();

        assert_eq!(throttle.check_at("example.com", start), Duration::ZERO);

        let wait = throttle.check_at("example.com", start + Duration::from_secs(2));
        assert_eq!(wait, Duration::from_secs(3));

        assert_eq!(
            throttle.check_at("example.com", start + Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn keys_are_throttled_independently() {
        let throttle = Throttle::new(ThrottleSpec {
            messages: 1,
            period: Duration::from_secs(60),
        });
        let start = Instant::now();

        assert_eq!(throttle.check_at("one.example", start), Duration::ZERO);
        assert_eq!(throttle.check_at("two.example", start), Duration::ZERO);
        assert_ne!(throttle.check_at("one.example", start), Duration::ZERO);
    }

    #[test]
    fn at_most_n_plus_one_admissions_per_window() {
        let spec = ThrottleSpec {
            messages: 5,
            period: Duration::from_secs(10),
        };
        let throttle = Throttle::new(spec);
        let start = Instant::now();

        let mut admitted = 0;
        // hammer the key every 100ms across one window
        for tick in 0..=100 {
            let now = start + Duration::from_millis(tick * 100);
            if throttle.check_at("example.com", now) == Duration::ZERO {
                admitted += 1;
            }
        }
        assert!(admitted <= spec.messages + 1, "admitted {admitted}");
    }

    #[test]
    fn table_is_capped() {
        let throttle = Throttle::new(ThrottleSpec {
            messages: 1,
            period: Duration::from_secs(60),
        });
        let start = Instant::now();

        for i in 0..(TIMER_TABLE_CAP + 100) {
            throttle.check_at(&format!("key-{i}"), start);
        }
        assert!(throttle.timers.lock().unwrap().entries.len() <= TIMER_TABLE_CAP);
    }
}
