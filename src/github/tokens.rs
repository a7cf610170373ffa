//! Token rotation with per-token rate-limit accounting.
//!
//! Each personal access token tracks `{remaining, reset}` parsed from the
//! rate-limit headers of its own responses. Requests round-robin across
//! tokens that still have budget; when every token is exhausted the caller
//! is told how long until the earliest reset. With no tokens configured the
//! pool hands out anonymous requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A token chosen for one request.
#[derive(Debug, Clone)]
pub struct PickedToken {
    /// Slot in the pool, for reporting observed headers back.
    pub index: usize,
    /// The token itself; `None` means anonymous.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct TokenState {
    /// Requests left in the current window; `None` until first observed.
    remaining: Option<i64>,
    /// Epoch second the window resets at.
    reset_epoch: i64,
}

impl TokenState {
    fn usable(&self, now_epoch: i64) -> bool {
        match self.remaining {
            Some(0) => now_epoch >= self.reset_epoch,
            _ => true,
        }
    }
}

/// Shared rotation state; cloning shares the pool.
#[derive(Clone)]
pub struct TokenPool {
    tokens: Arc<Vec<String>>,
    states: Arc<Mutex<Vec<TokenState>>>,
    cursor: Arc<AtomicUsize>,
}

impl TokenPool {
    pub fn new(tokens: Vec<String>) -> Self {
        let states = vec![
            TokenState {
                remaining: None,
                reset_epoch: 0,
            };
            tokens.len()
        ];
        Self {
            tokens: Arc::new(tokens),
            states: Arc::new(Mutex::new(states)),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Picks a non-exhausted token round-robin. `Err(wait_secs)` means every
    /// token is exhausted and the earliest reset is that many seconds away.
    pub fn pick(&self, now_epoch: i64) -> Result<PickedToken, i64> {
        if self.tokens.is_empty() {
            return Ok(PickedToken {
                index: 0,
                value: None,
            });
        }
        let states = self.states.lock().expect("token pool poisoned");
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.tokens.len() {
            let index = (start + offset) % self.tokens.len();
            if states[index].usable(now_epoch) {
                return Ok(PickedToken {
                    index,
                    value: Some(self.tokens[index].clone()),
                });
            }
        }
        let earliest = states
            .iter()
            .map(|s| s.reset_epoch)
            .min()
            .unwrap_or(now_epoch);
        Err((earliest - now_epoch).max(1))
    }

    /// Records the rate-limit headers a response carried for `index`.
    pub fn observe(&self, index: usize, response: &reqwest::Response) {
        let remaining = header_i64(response, "x-ratelimit-remaining");
        let reset = header_i64(response, "x-ratelimit-reset");
        if remaining.is_none() && reset.is_none() {
            return;
        }
        self.observe_raw(index, remaining, reset);
    }

    /// Header-free form used by tests and by the client on synthetic waits.
    pub fn observe_raw(&self, index: usize, remaining: Option<i64>, reset_epoch: Option<i64>) {
        if self.tokens.is_empty() {
            return;
        }
        let mut states = self.states.lock().expect("token pool poisoned");
        if let Some(state) = states.get_mut(index) {
            if let Some(remaining) = remaining {
                state.remaining = Some(remaining);
            }
            if let Some(reset) = reset_epoch {
                state.reset_epoch = reset;
            }
        }
    }
}

fn header_i64(response: &reqwest::Response, name: &str) -> Option<i64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_pool_hands_out_bare_requests() {
        let pool = TokenPool::new(vec![]);
        let picked = pool.pick(1000).unwrap();
        assert!(picked.value.is_none());
    }

    #[test]
    fn exhausted_token_is_skipped_until_reset() {
        let pool = TokenPool::new(vec!["token_a".into(), "token_b".into()]);
        let now = 1_000_000;

        // Token A burns out: remaining 0, resets in 60s.
        pool.observe_raw(0, Some(0), Some(now + 60));

        for _ in 0..3 {
            let picked = pool.pick(now).unwrap();
            assert_eq!(picked.value.as_deref(), Some("token_b"));
        }

        // After the reset, A is usable again and rotation can hand it out.
        let mut seen_a = false;
        for _ in 0..4 {
            if pool.pick(now + 61).unwrap().value.as_deref() == Some("token_a") {
                seen_a = true;
            }
        }
        assert!(seen_a);
    }

    #[test]
    fn all_exhausted_reports_earliest_reset() {
        let pool = TokenPool::new(vec!["a".into(), "b".into()]);
        let now = 5_000;
        pool.observe_raw(0, Some(0), Some(now + 120));
        pool.observe_raw(1, Some(0), Some(now + 30));
        match pool.pick(now) {
            Err(wait) => assert_eq!(wait, 30),
            Ok(_) => panic!("expected exhaustion"),
        }
    }

    #[test]
    fn rotation_spreads_load() {
        let pool = TokenPool::new(vec!["a".into(), "b".into()]);
        let first = pool.pick(0).unwrap().value.unwrap();
        let second = pool.pick(0).unwrap().value.unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unobserved_tokens_are_usable() {
        let state = TokenState {
            remaining: None,
            reset_epoch: 0,
        };
        assert!(state.usable(123));
    }
}
