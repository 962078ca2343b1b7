//! Per-key coalescing of concurrent executions
//!
//! The first caller for a key becomes the leader and runs the work; later
//! callers follow and receive the leader's outcome. Unrelated keys never
//! wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

/// What followers observe when the leader is done
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Finished(T),
    /// Leader stopped without a result (cancelled); followers should retry
    Abandoned,
}

type Slot<T> = watch::Receiver<Option<Outcome<T>>>;

pub struct InFlight<T> {
    slots: Mutex<HashMap<String, Slot<T>>>,
}

pub enum Claim<T: Clone> {
    Leader(LeaderGuard<T>),
    Follower(Follower<T>),
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Become leader for `key`, or follow the current leader
    pub fn claim(self: &Arc<Self>, key: &str) -> Claim<T> {
        let Ok(mut slots) = self.slots.lock() else {
            // A poisoned map only loses coalescing, not correctness
            let (tx, _) = watch::channel(None);
            return Claim::Leader(LeaderGuard {
                inflight: None,
                key: key.to_string(),
                tx: Some(tx),
            });
        };
        if let Some(rx) = slots.get(key) {
            debug!(%key, "InFlight::claim: following");
            return Claim::Follower(Follower { rx: rx.clone() });
        }
        debug!(%key, "InFlight::claim: leading");
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), rx);
        Claim::Leader(LeaderGuard {
            inflight: Some(Arc::clone(self)),
            key: key.to_string(),
            tx: Some(tx),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(key);
        }
    }
}

/// Right and duty to publish the outcome for a key
///
/// Dropping it unpublished releases followers with [`Outcome::Abandoned`].
pub struct LeaderGuard<T: Clone> {
    inflight: Option<Arc<InFlight<T>>>,
    key: String,
    tx: Option<watch::Sender<Option<Outcome<T>>>>,
}

impl<T: Clone> LeaderGuard<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn finish(mut self, value: T) {
        self.publish(Outcome::Finished(value));
    }

    fn publish(&mut self, outcome: Outcome<T>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        // Unregister first so callers arriving from now on start fresh
        if let Some(inflight) = &self.inflight {
            inflight.release(&self.key);
        }
        tx.send_replace(Some(outcome));
    }
}

impl<T: Clone> Drop for LeaderGuard<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            debug!(key = %self.key, "LeaderGuard::drop: abandoned");
            self.publish(Outcome::Abandoned);
        }
    }
}

pub struct Follower<T> {
    rx: Slot<T>,
}

impl<T: Clone> Follower<T> {
    /// Wait for the leader's outcome
    pub async fn wait(mut self) -> Outcome<T> {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Outcome::Abandoned),
            Err(_) => Outcome::Abandoned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_followers_receive_leader_outcome() {
        let inflight: Arc<InFlight<u32>> = InFlight::new();
        let Claim::Leader(guard) = inflight.claim("k") else {
            panic!("first claim must lead");
        };
        let Claim::Follower(a) = inflight.claim("k") else {
            panic!("second claim must follow");
        };
        let Claim::Follower(b) = inflight.claim("k") else {
            panic!("third claim must follow");
        };

        let waiters = tokio::spawn(async move { (a.wait().await, b.wait().await) });
        guard.finish(42);

        let (a, b) = tokio::time::timeout(Duration::from_secs(2), waiters).await.unwrap().unwrap();
        assert!(matches!(a, Outcome::Finished(42)));
        assert!(matches!(b, Outcome::Finished(42)));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_abandons() {
        let inflight: Arc<InFlight<u32>> = InFlight::new();
        let guard = inflight.claim("k");
        let Claim::Follower(follower) = inflight.claim("k") else {
            panic!("second claim must follow");
        };
        drop(guard);
        assert!(matches!(follower.wait().await, Outcome::Abandoned));
        assert!(matches!(inflight.claim("k"), Claim::Leader(_)));
    }

    #[test]
    fn test_keys_are_independent() {
        let inflight: Arc<InFlight<u32>> = InFlight::new();
        let _a = inflight.claim("a");
        let b = inflight.claim("b");
        assert!(matches!(b, Claim::Leader(_)));
        assert_eq!(inflight.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_after_finish_leads_again() {
        let inflight: Arc<InFlight<u32>> = InFlight::new();
        if let Claim::Leader(guard) = inflight.claim("k") {
            guard.finish(1);
        }
        assert!(matches!(inflight.claim("k"), Claim::Leader(_)));
    }
}
