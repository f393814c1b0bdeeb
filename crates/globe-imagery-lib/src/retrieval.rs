//! Asynchronous resource retrieval with request dedup and failure backoff
//!
//! Fetches run on a tokio runtime and report back over a channel. Their results are only
//! applied when the owner calls [`RetrievalCoordinator::process_completions`] from the
//! render thread, so the in-flight and absent sets have a single writer.

use crate::{ImageryError, Result, RetrievalError};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Backoff policy for failed resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RetrievalConfig {
    /// Delay before the first retry; doubles with every further failure
    pub backoff_base: Duration,
    /// Upper bound on the retry delay
    pub backoff_max: Duration,
    /// Failures after which a resource stays absent for the rest of the session
    pub max_strikes: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            max_strikes: 8,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backoff_base.is_zero() {
            return Err(ImageryError::InvalidConfig(
                "retrieval backoff base must be non-zero".to_string(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ImageryError::InvalidConfig(format!(
                "retrieval backoff cap ({:?}) is below its base ({:?})",
                self.backoff_max, self.backoff_base
            )));
        }
        if self.max_strikes == 0 {
            return Err(ImageryError::InvalidConfig(
                "max strikes must be at least one".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry delay after the given number of consecutive failures
    pub fn backoff_delay(&self, strikes: u32) -> Duration {
        let factor = 1u32
            .checked_shl(strikes.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy)]
struct AbsentEntry {
    strikes: u32,
    /// `None` once the resource is permanently absent
    retry_at: Option<Instant>,
}

/// Resources whose last fetch failed, each blocked until its backoff expires.
#[derive(Debug, Clone)]
pub struct AbsentResourceList {
    config: RetrievalConfig,
    entries: HashMap<String, AbsentEntry>,
}

impl AbsentResourceList {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Record a failure. Returns the retry delay, or `None` if the resource is now
    /// permanently absent.
    pub fn mark_failed(&mut self, key: &str, now: Instant) -> Option<Duration> {
        let entry = self.entries.entry(key.to_string()).or_insert(AbsentEntry {
            strikes: 0,
            retry_at: None,
        });
        entry.strikes = entry.strikes.saturating_add(1);

        if entry.strikes >= self.config.max_strikes {
            entry.retry_at = None;
            return None;
        }

        let delay = self.config.backoff_delay(entry.strikes);
        entry.retry_at = Some(now + delay);
        Some(delay)
    }

    /// Forget a resource, typically after a successful fetch
    pub fn unmark(&mut self, key: &str) {
        self.entries.remove(key);
    }

    /// Whether a fetch for `key` must not be attempted at `now`.
    pub fn is_blocked(&self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            None => false,
            Some(AbsentEntry { retry_at: None, .. }) => true,
            Some(AbsentEntry {
                retry_at: Some(at),
                ..
            }) => now < *at,
        }
    }

    pub fn is_permanently_absent(&self, key: &str) -> bool {
        matches!(
            self.entries.get(key),
            Some(AbsentEntry { retry_at: None, .. })
        )
    }

    pub fn strikes(&self, key: &str) -> u32 {
        self.entries.get(key).map_or(0, |e| e.strikes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Result of [`RetrievalCoordinator::request_if_needed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new fetch was spawned
    Started,
    /// A fetch for the key is already outstanding
    InFlight,
    /// The key is in its backoff window or permanently absent
    Absent,
}

/// Completion report handed back to the render thread
#[derive(Debug)]
pub enum RetrievalEvent<T> {
    Ready {
        key: String,
        payload: T,
    },
    Failed {
        key: String,
        error: RetrievalError,
        /// `None` when the resource will not be retried this session
        retry_in: Option<Duration>,
    },
}

impl<T> RetrievalEvent<T> {
    pub fn key(&self) -> &str {
        match self {
            Self::Ready { key, .. } | Self::Failed { key, .. } => key,
        }
    }
}

struct Completion<T> {
    key: String,
    result: std::result::Result<T, RetrievalError>,
}

/// Reports a completion exactly once, even if the fetch task is dropped or panics.
struct CompletionGuard<T> {
    key: Option<String>,
    sender: mpsc::UnboundedSender<Completion<T>>,
}

impl<T> CompletionGuard<T> {
    fn complete(mut self, result: std::result::Result<T, RetrievalError>) {
        if let Some(key) = self.key.take() {
            let _ = self.sender.send(Completion { key, result });
        }
    }
}

impl<T> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.sender.send(Completion {
                key,
                result: Err(RetrievalError::Network("fetch task aborted".to_string())),
            });
        }
    }
}

/// Issues fetches for missing resources, at most one per key at a time.
pub struct RetrievalCoordinator<T> {
    in_flight: HashSet<String>,
    absent: AbsentResourceList,
    sender: mpsc::UnboundedSender<Completion<T>>,
    receiver: mpsc::UnboundedReceiver<Completion<T>>,
    runtime: Handle,
    fetches_started: u64,
    fetches_failed: u64,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl<T: Send + 'static> RetrievalCoordinator<T> {
    /// Create a coordinator that spawns fetches onto `runtime`.
    pub fn new(config: RetrievalConfig, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            in_flight: HashSet::new(),
            absent: AbsentResourceList::new(config),
            sender,
            receiver,
            runtime,
            fetches_started: 0,
            fetches_failed: 0,
        })
    }

    /// Start fetching `key` unless it is already in flight or blocked as absent.
    ///
    /// `fetch` is only invoked when a fetch is actually started.
    pub fn request_if_needed<F, Fut>(&mut self, key: &str, now: Instant, fetch: F) -> RequestOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, RetrievalError>> + Send + 'static,
    {
        if self.absent.is_blocked(key, now) {
            return RequestOutcome::Absent;
        }
        if self.in_flight.contains(key) {
            return RequestOutcome::InFlight;
        }

        self.in_flight.insert(key.to_string());
        self.fetches_started += 1;

        let future = fetch();
        let guard = CompletionGuard {
            key: Some(key.to_string()),
            sender: self.sender.clone(),
        };
        self.runtime.spawn(async move {
            let result = future.await;
            guard.complete(result);
        });

        tracing::trace!(key, "Resource fetch started");
        RequestOutcome::Started
    }

    /// Apply every completion received so far and report them.
    pub fn process_completions(&mut self, now: Instant) -> Vec<RetrievalEvent<T>> {
        let mut events = Vec::new();

        while let Ok(Completion { key, result }) = self.receiver.try_recv() {
            if !self.in_flight.remove(&key) {
                tracing::warn!(key = %key, "Completion for a resource that was not in flight");
            }

            match result {
                Ok(payload) => {
                    self.absent.unmark(&key);
                    events.push(RetrievalEvent::Ready { key, payload });
                }
                Err(error) => {
                    self.fetches_failed += 1;
                    let retry_in = self.absent.mark_failed(&key, now);
                    match retry_in {
                        Some(delay) => tracing::warn!(
                            key = %key,
                            %error,
                            strikes = self.absent.strikes(&key),
                            retry_in_ms = delay.as_millis() as u64,
                            "Resource retrieval failed"
                        ),
                        None => tracing::warn!(
                            key = %key,
                            %error,
                            "Resource retrieval failed too often, giving up for this session"
                        ),
                    }
                    events.push(RetrievalEvent::Failed {
                        key,
                        error,
                        retry_in,
                    });
                }
            }
        }

        events
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn absent(&self) -> &AbsentResourceList {
        &self.absent
    }

    /// Forget all failures so every resource becomes eligible again
    pub fn clear_absent(&mut self) {
        self.absent.clear();
    }

    pub fn fetches_started(&self) -> u64 {
        self.fetches_started
    }

    pub fn fetches_failed(&self) -> u64 {
        self.fetches_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_strikes: 4,
        }
    }

    async fn wait_for_events<T: Send + 'static>(
        coordinator: &mut RetrievalCoordinator<T>,
        now: Instant,
    ) -> Vec<RetrievalEvent<T>> {
        for _ in 0..200 {
            let events = coordinator.process_completions(now);
            if !events.is_empty() {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no completion received");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.backoff_base = Duration::ZERO;
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.backoff_max = Duration::from_millis(10);
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.max_strikes = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_backoff_is_monotonic_and_bounded() {
        let config = RetrievalConfig {
            max_strikes: u32::MAX,
            ..config()
        };
        let mut absent = AbsentResourceList::new(config);
        let now = Instant::now();

        let mut previous = Duration::ZERO;
        for _ in 0..50 {
            let delay = absent.mark_failed("tile", now).unwrap();
            assert!(delay >= previous);
            assert!(delay <= config.backoff_max);
            previous = delay;
        }
        assert_eq!(previous, config.backoff_max);
    }

    #[test]
    fn test_absent_blocks_until_expiry() {
        let mut absent = AbsentResourceList::new(config());
        let now = Instant::now();

        assert!(!absent.is_blocked("tile", now));
        let delay = absent.mark_failed("tile", now).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert!(absent.is_blocked("tile", now));
        assert!(absent.is_blocked("tile", now + Duration::from_millis(999)));
        assert!(!absent.is_blocked("tile", now + delay));

        absent.unmark("tile");
        assert!(!absent.is_blocked("tile", now));
        assert_eq!(absent.strikes("tile"), 0);
    }

    #[test]
    fn test_permanently_absent_after_max_strikes() {
        let mut absent = AbsentResourceList::new(config());
        let now = Instant::now();

        for _ in 0..3 {
            assert!(absent.mark_failed("tile", now).is_some());
        }
        assert_eq!(absent.mark_failed("tile", now), None);
        assert!(absent.is_permanently_absent("tile"));
        assert!(absent.is_blocked("tile", now + Duration::from_secs(86_400)));
    }

    #[tokio::test]
    async fn test_duplicate_requests_fetch_once() {
        let mut coordinator = RetrievalCoordinator::<u32>::new(config(), Handle::current()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();
        let now = Instant::now();

        let counter = calls.clone();
        let outcome = coordinator.request_if_needed("tile", now, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { rx.await.map_err(|e| RetrievalError::Network(e.to_string())) }
        });
        assert_eq!(outcome, RequestOutcome::Started);

        let counter = calls.clone();
        let outcome = coordinator.request_if_needed("tile", now, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(0) }
        });
        assert_eq!(outcome, RequestOutcome::InFlight);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_in_flight("tile"));

        tx.send(7).unwrap();
        let events = wait_for_events(&mut coordinator, now).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RetrievalEvent::Ready { key, payload: 7 } if key == "tile"));
        assert_eq!(coordinator.in_flight_count(), 0);
        assert_eq!(coordinator.fetches_started(), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_then_retries() {
        let mut coordinator = RetrievalCoordinator::<u32>::new(config(), Handle::current()).unwrap();
        let now = Instant::now();

        let outcome = coordinator.request_if_needed("tile", now, || async {
            Err(RetrievalError::Status(404))
        });
        assert_eq!(outcome, RequestOutcome::Started);

        let events = wait_for_events(&mut coordinator, now).await;
        assert!(matches!(
            &events[0],
            RetrievalEvent::Failed { error: RetrievalError::Status(404), retry_in: Some(_), .. }
        ));
        assert!(!coordinator.is_in_flight("tile"));
        assert_eq!(coordinator.fetches_failed(), 1);

        let outcome = coordinator.request_if_needed("tile", now, || async { Ok(1) });
        assert_eq!(outcome, RequestOutcome::Absent);

        let later = now + Duration::from_secs(2);
        let outcome = coordinator.request_if_needed("tile", later, || async { Ok(1) });
        assert_eq!(outcome, RequestOutcome::Started);

        let events = wait_for_events(&mut coordinator, later).await;
        assert!(matches!(&events[0], RetrievalEvent::Ready { payload: 1, .. }));
        assert!(coordinator.absent().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_fetch_is_reported_as_failure() {
        let mut coordinator = RetrievalCoordinator::<u32>::new(config(), Handle::current()).unwrap();
        let now = Instant::now();

        coordinator.request_if_needed("tile", now, || async {
            let decoded: Option<u32> = None;
            Ok(decoded.expect("decoder crashed"))
        });

        let events = wait_for_events(&mut coordinator, now).await;
        assert_eq!(events[0].key(), "tile");
        assert!(matches!(&events[0], RetrievalEvent::Failed { .. }));
        assert_eq!(coordinator.in_flight_count(), 0);
    }
}
