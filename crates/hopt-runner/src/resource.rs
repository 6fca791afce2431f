//! Bounded pool of exclusive resource tokens (GPU id sets).

use crossbeam_channel::{bounded, Receiver, Sender};
use hopt_types::ConfigError;
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, error};

/// A fixed set of distinct tokens handed out one holder at a time.
///
/// Tokens live in a bounded channel sized to the pool. The queue owns both
/// ends, so a blocked [`acquire`](Self::acquire) always wakes once some
/// holder drops its lease.
#[derive(Debug)]
pub struct ResourceQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
    tokens: Vec<String>,
}

impl ResourceQueue {
    pub fn new<I, S>(tokens: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() {
            return Err(ConfigError::EmptyTokenPool);
        }
        let mut seen = HashSet::new();
        for token in &tokens {
            if !seen.insert(token.as_str()) {
                return Err(ConfigError::DuplicateToken {
                    token: token.clone(),
                });
            }
        }

        let (tx, rx) = bounded(tokens.len());
        for token in &tokens {
            // capacity equals the token count, so seeding never fills up
            if let Err(e) = tx.try_send(token.clone()) {
                error!(token = %e.into_inner(), "could not seed resource token");
            }
        }
        Ok(Self { tx, rx, tokens })
    }

    /// Block until a token is free and lease it.
    pub fn acquire(&self) -> ResourceLease<'_> {
        // `self.tx` keeps the channel connected for as long as `self` lives
        let token = match self.rx.recv() {
            Ok(token) => token,
            Err(_) => unreachable!("resource queue holds its own sender"),
        };
        debug!(%token, "leased resource token");
        ResourceLease {
            queue: self,
            token: Some(token),
        }
    }

    /// Lease a token only if one is free right now.
    pub fn try_acquire(&self) -> Option<ResourceLease<'_>> {
        self.rx.try_recv().ok().map(|token| ResourceLease {
            queue: self,
            token: Some(token),
        })
    }

    fn release(&self, token: String) {
        debug!(%token, "returned resource token");
        // a full channel means the token was already returned once
        if let Err(e) = self.tx.try_send(token) {
            error!(token = %e.into_inner(), "resource token returned twice, dropping it");
        }
    }

    /// Tokens currently in the pool.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tokens.len()
    }

    /// The tokens the pool was seeded with, in seeding order.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Whether the pool was seeded with exactly these tokens (order ignored).
    pub fn has_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        tokens.len() == self.tokens.len()
            && tokens
                .iter()
                .all(|t| self.tokens.iter().any(|own| own == t.as_ref()))
    }
}

/// Exclusive use of one token; returns it to the pool when dropped.
pub struct ResourceLease<'a> {
    queue: &'a ResourceQueue,
    token: Option<String>,
}

impl ResourceLease<'_> {
    pub fn token(&self) -> &str {
        self.token.as_deref().unwrap_or_default()
    }
}

impl fmt::Debug for ResourceLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLease")
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for ResourceLease<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.queue.release(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn rejects_empty_and_duplicate_pools() {
        assert!(matches!(
            ResourceQueue::new(Vec::<String>::new()),
            Err(ConfigError::EmptyTokenPool)
        ));
        assert!(matches!(
            ResourceQueue::new(["0", "1", "0"]),
            Err(ConfigError::DuplicateToken { .. })
        ));
    }

    #[test]
    fn lease_returns_token_on_drop() {
        let queue = ResourceQueue::new(["0", "1"]).unwrap();
        assert_eq!(queue.available(), 2);
        {
            let a = queue.acquire();
            let b = queue.acquire();
            assert_ne!(a.token(), b.token());
            assert_eq!(queue.available(), 0);
            assert!(queue.try_acquire().is_none());
        }
        assert_eq!(queue.available(), 2);
    }

    #[test]
    fn lease_returns_token_on_panic() {
        let queue = ResourceQueue::new(["gpu0"]).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _lease = queue.acquire();
            panic!("training blew up");
        }));
        assert!(result.is_err());
        assert_eq!(queue.available(), 1);
    }

    #[test]
    fn releasing_into_a_full_pool_keeps_it_intact() {
        let queue = ResourceQueue::new(["0", "1"]).unwrap();
        queue.release("0".to_string());
        assert_eq!(queue.available(), 2);

        let a = queue.acquire();
        let b = queue.acquire();
        assert_ne!(a.token(), b.token());
        assert!(queue.try_acquire().is_none());
    }

    #[test]
    fn concurrent_holders_never_exceed_capacity() {
        let queue = Arc::new(ResourceQueue::new(["0", "1"]).unwrap());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let held: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let lease = queue.acquire();
                        assert!(held.lock().unwrap().insert(lease.token().to_string()));
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                        held.lock().unwrap().remove(lease.token());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.available(), 2);
        let mut remaining: Vec<String> = (0..2).map(|_| queue.rx.recv().unwrap()).collect();
        remaining.sort();
        assert_eq!(remaining, vec!["0".to_string(), "1".to_string()]);
    }
}
