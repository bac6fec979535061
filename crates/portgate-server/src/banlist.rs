//! In-process ban lists for auth throttling
//!
//! Two flavors: [`BanList`] bans a visitor for a fixed duration on every
//! `add`, [`MaxBadAttemptsBanList`] bans after N consecutive failures.
//! Visitor keys are IPs or usernames; nothing is persisted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Fixed-duration ban list
pub struct BanList {
    ban_duration: Duration,
    visitors: RwLock<HashMap<String, Instant>>,
}

impl BanList {
    pub fn new(ban_duration: Duration) -> Self {
        Self {
            ban_duration,
            visitors: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, visitor_key: &str) {
        let mut visitors = self.visitors.write().unwrap();
        visitors.insert(visitor_key.to_string(), Instant::now() + self.ban_duration);
    }

    pub fn is_banned(&self, visitor_key: &str) -> bool {
        let visitors = self.visitors.read().unwrap();
        visitors
            .get(visitor_key)
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct Visitor {
    bad_attempts: usize,
    ban_until: Option<Instant>,
}

/// Bans visitors after `max_bad_attempts` consecutive failures for
/// `ban_duration`. A success clears the state.
pub struct MaxBadAttemptsBanList {
    ban_duration: Duration,
    max_bad_attempts: usize,
    visitors: RwLock<HashMap<String, Visitor>>,
}

impl MaxBadAttemptsBanList {
    pub fn new(max_bad_attempts: usize, ban_duration: Duration) -> Self {
        Self {
            ban_duration,
            max_bad_attempts,
            visitors: RwLock::new(HashMap::new()),
        }
    }

    /// Register a failed attempt for the visitor
    pub fn add_bad_attempt(&self, visitor_key: &str) {
        let mut visitors = self.visitors.write().unwrap();
        let visitor = visitors.entry(visitor_key.to_string()).or_default();

        visitor.bad_attempts += 1;

        if visitor.bad_attempts == self.max_bad_attempts {
            let until = Instant::now() + self.ban_duration;
            tracing::info!(
                visitor = %visitor_key,
                ban_duration_secs = self.ban_duration.as_secs(),
                "too many bad attempts, visitor is banned"
            );
            visitor.ban_until = Some(until);
            visitor.bad_attempts = 0;
        }
    }

    /// Register a successful attempt for the visitor
    pub fn add_success_attempt(&self, visitor_key: &str) {
        let mut visitors = self.visitors.write().unwrap();
        if let Some(visitor) = visitors.get_mut(visitor_key) {
            visitor.bad_attempts = 0;
            visitor.ban_until = None;
        }
    }

    pub fn is_banned(&self, visitor_key: &str) -> bool {
        let visitors = self.visitors.read().unwrap();
        visitors
            .get(visitor_key)
            .and_then(|visitor| visitor.ban_until)
            .map(|until| until > Instant::now())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_list_bans_on_add() {
        let list = BanList::new(Duration::from_secs(60));

        assert!(!list.is_banned("10.0.0.1"));
        list.add("10.0.0.1");
        assert!(list.is_banned("10.0.0.1"));
        assert!(!list.is_banned("10.0.0.2"));
    }

    #[test]
    fn test_ban_list_expires() {
        let list = BanList::new(Duration::from_millis(1));
        list.add("10.0.0.1");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.is_banned("10.0.0.1"));
    }

    #[test]
    fn test_below_threshold_is_not_banned() {
        let list = MaxBadAttemptsBanList::new(3, Duration::from_secs(60));

        list.add_bad_attempt("admin");
        list.add_bad_attempt("admin");
        assert!(!list.is_banned("admin"));
    }

    #[test]
    fn test_reaching_threshold_bans() {
        let list = MaxBadAttemptsBanList::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            list.add_bad_attempt("admin");
        }
        assert!(list.is_banned("admin"));
    }

    #[test]
    fn test_success_clears_state() {
        let list = MaxBadAttemptsBanList::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            list.add_bad_attempt("admin");
        }
        assert!(list.is_banned("admin"));

        list.add_success_attempt("admin");
        assert!(!list.is_banned("admin"));

        // counter restarts from zero after a success
        list.add_bad_attempt("admin");
        list.add_bad_attempt("admin");
        assert!(!list.is_banned("admin"));
    }

    #[test]
    fn test_counter_resets_after_ban() {
        let list = MaxBadAttemptsBanList::new(2, Duration::from_millis(1));

        list.add_bad_attempt("admin");
        list.add_bad_attempt("admin");
        std::thread::sleep(Duration::from_millis(5));
        assert!(!list.is_banned("admin"));

        // the ban consumed the counter; one more failure is not enough
        list.add_bad_attempt("admin");
        assert!(!list.is_banned("admin"));
        list.add_bad_attempt("admin");
        assert!(list.is_banned("admin"));
    }

    #[test]
    fn test_keys_are_independent() {
        let list = MaxBadAttemptsBanList::new(1, Duration::from_secs(60));
        list.add_bad_attempt("10.0.0.1");
        assert!(list.is_banned("10.0.0.1"));
        assert!(!list.is_banned("admin"));
    }
}
