//! In-memory credential lockout: a sliding failure window with a hard
//! lockout once the threshold is hit. Keys are arbitrary strings so the same
//! machinery serves WebAuthn credentials, pairing codes, and SSH users.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const LOCKOUT_THRESHOLD: usize = 5;
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Default)]
struct Entry {
    failures: Vec<Instant>,
    locked_until: Option<Instant>,
}

#[derive(Clone)]
pub struct Lockouts {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    window: Duration,
    threshold: usize,
    duration: Duration,
}

impl Default for Lockouts {
    fn default() -> Self {
        Self::new()
    }
}

impl Lockouts {
    pub fn new() -> Self {
        Self::with_params(LOCKOUT_WINDOW, LOCKOUT_THRESHOLD, LOCKOUT_DURATION)
    }

    pub fn with_params(window: Duration, threshold: usize, duration: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), window, threshold, duration }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remaining lockout time, if any. Expired lockouts are cleared lazily.
    pub fn is_locked(&self, key: &str) -> Option<Duration> {
        let mut map = self.lock();
        let entry = map.get_mut(key)?;
        match entry.locked_until {
            Some(until) => {
                let now = Instant::now();
                if until > now {
                    Some(until - now)
                } else {
                    entry.locked_until = None;
                    entry.failures.clear();
                    None
                }
            }
            None => None,
        }
    }

    /// Record one failure. Returns the lockout duration when this failure
    /// trips (or finds) an active lockout.
    pub fn record_failure(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut map = self.lock();
        let entry = map.entry(key.to_string()).or_default();
        if let Some(until) = entry.locked_until {
            if until > now {
                return Some(until - now);
            }
            entry.locked_until = None;
            entry.failures.clear();
        }
        entry.failures.push(now);
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        entry.failures.retain(|t| *t > cutoff);
        if entry.failures.len() >= self.threshold {
            entry.locked_until = Some(now + self.duration);
            return Some(self.duration);
        }
        None
    }

    /// A successful auth clears both the failure list and any lockout.
    pub fn record_success(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Drop entries whose failures fell out of the window and whose lockout
    /// has expired.
    pub fn sweep(&self) {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or(now);
        self.lock().retain(|_, e| {
            e.failures.retain(|t| *t > cutoff);
            let locked = e.locked_until.map(|u| u > now).unwrap_or(false);
            locked || !e.failures.is_empty()
        });
    }

    /// Periodic garbage collection. The task dies with the runtime, so it
    /// never keeps the process alive.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let period = this.window;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                this.sweep();
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn five_failures_in_window_lock_the_key() {
        let l = Lockouts::with_params(Duration::from_secs(60), 5, Duration::from_secs(60));
        for _ in 0..4 {
            assert!(l.record_failure("cred").is_none());
            assert!(l.is_locked("cred").is_none());
        }
        assert!(l.record_failure("cred").is_some());
        assert!(l.is_locked("cred").is_some());
    }

    #[test]
    fn success_clears_failures_and_lockout() {
        let l = Lockouts::with_params(Duration::from_secs(60), 2, Duration::from_secs(60));
        l.record_failure("cred");
        l.record_failure("cred");
        assert!(l.is_locked("cred").is_some());
        l.record_success("cred");
        assert!(l.is_locked("cred").is_none());
        assert!(l.record_failure("cred").is_none());
    }

    #[test]
    fn lockout_expires_lazily() {
        let l = Lockouts::with_params(Duration::from_millis(20), 1, Duration::from_millis(20));
        assert!(l.record_failure("cred").is_some());
        assert!(l.is_locked("cred").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(l.is_locked("cred").is_none());
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let l = Lockouts::with_params(Duration::from_millis(20), 3, Duration::from_secs(60));
        l.record_failure("cred");
        l.record_failure("cred");
        std::thread::sleep(Duration::from_millis(30));
        assert!(l.record_failure("cred").is_none(), "old failures aged out");
        assert!(l.is_locked("cred").is_none());
    }

    #[test]
    fn sweep_leaves_no_records_after_window_plus_lockout() {
        let l = Lockouts::with_params(Duration::from_millis(10), 1, Duration::from_millis(10));
        l.record_failure("a");
        l.record_failure("b");
        std::thread::sleep(Duration::from_millis(30));
        l.sweep();
        assert!(l.lock().is_empty());
    }

    #[test]
    fn keys_are_independent() {
        let l = Lockouts::with_params(Duration::from_secs(60), 2, Duration::from_secs(60));
        l.record_failure("a");
        l.record_failure("a");
        assert!(l.is_locked("a").is_some());
        assert!(l.is_locked("b").is_none());
    }
}
