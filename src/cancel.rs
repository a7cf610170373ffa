//! Cooperative cancellation scopes with deadline propagation.
//!
//! Every task unit (an hour of backfill, a queue job) runs under a
//! [`Scope`]. Child scopes take the tighter of the parent deadline and a
//! local budget, so a response-driven wait can never extend past the parent.

use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    tx: watch::Sender<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { rx, tx }
    }

    /// Flips the flag; all clones observe it.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellation token paired with an optional deadline.
#[derive(Debug, Clone)]
pub struct Scope {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl Scope {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Unbounded root scope with a fresh token.
    pub fn root() -> Self {
        Self::new(CancelToken::new())
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Child scope whose deadline is the tighter of the parent's and `budget`.
    pub fn with_budget(&self, budget: Duration) -> Scope {
        let local = Instant::now() + budget;
        let deadline = match self.deadline {
            Some(parent) => Some(parent.min(local)),
            None => Some(local),
        };
        Scope {
            token: self.token.clone(),
            deadline,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.is_expired()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Sleeps for `dur`, truncated to the deadline, waking early on cancel.
    /// Returns false if the scope was cancelled or expired.
    pub async fn sleep(&self, dur: Duration) -> bool {
        let bounded = match self.remaining() {
            Some(left) => dur.min(left),
            None => dur,
        };
        tokio::select! {
            _ = tokio::time::sleep(bounded) => !self.is_cancelled(),
            _ = self.token.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed_by_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn child_takes_tighter_deadline() {
        let root = Scope::root();
        let parent = root.with_budget(Duration::from_millis(50));
        let child = parent.with_budget(Duration::from_secs(60));
        assert!(child.remaining().unwrap() <= Duration::from_millis(50));

        let wide = root.with_budget(Duration::from_secs(60));
        let tight = wide.with_budget(Duration::from_millis(10));
        assert!(tight.remaining().unwrap() <= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn sleep_truncates_to_deadline() {
        let scope = Scope::root().with_budget(Duration::from_millis(20));
        let start = Instant::now();
        let ok = scope.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!ok, "deadline expiry reports cancellation");
    }

    #[tokio::test]
    async fn sleep_wakes_on_cancel() {
        let scope = Scope::root();
        let token = scope.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let start = Instant::now();
        assert!(!scope.sleep(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
