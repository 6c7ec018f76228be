use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct SlidingWindowLimiter {
    state: Arc<Mutex<LimiterState>>,
    window: Duration,
    max_requests: usize,
}

#[derive(Debug)]
struct LimiterState {
    hits: HashMap<String, VecDeque<Instant>>,
    last_sweep: Instant,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                hits: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            window,
            max_requests,
        }
    }

    pub fn allow(&self, client: &str) -> bool {
        self.allow_at(client, Instant::now())
    }

    fn allow_at(&self, client: &str, now: Instant) -> bool {
        let mut guard = self.state.lock();

        // Keys come from client headers; drop idle ones once per window.
        if now.saturating_duration_since(guard.last_sweep) >= self.window {
            let window = self.window;
            guard.hits.retain(|_, queue| {
                queue
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
            guard.last_sweep = now;
        }

        let queue = guard.hits.entry(client.to_string()).or_default();
        while queue
            .front()
            .is_some_and(|front| now.saturating_duration_since(*front) >= self.window)
        {
            queue.pop_front();
        }

        if queue.len() >= self.max_requests {
            return false;
        }

        queue.push_back(now);
        true
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.state.lock().hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_max_and_recovers_after_window() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(10), 2);
        let start = Instant::now();

        assert!(limiter.allow_at("1.2.3.4", start));
        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(1)));
        assert!(!limiter.allow_at("1.2.3.4", start + Duration::from_secs(2)));
        assert!(limiter.allow_at("5.6.7.8", start + Duration::from_secs(2)));

        assert!(limiter.allow_at("1.2.3.4", start + Duration::from_secs(10)));
        assert!(!limiter.allow_at("1.2.3.4", start + Duration::from_secs(10)));
    }

    #[test]
    fn idle_clients_are_swept() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(10), 5);
        let start = Instant::now();

        for index in 0..50 {
            assert!(limiter.allow_at(&format!("10.0.0.{index}"), start));
        }
        assert_eq!(limiter.tracked_clients(), 50);

        assert!(limiter.allow_at("10.0.1.1", start + Duration::from_secs(11)));
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
