use crate::domain::models::Activity;
use crate::infrastructure::error::EngineError;
use crate::infrastructure::itinerary_repository::ItineraryRepository;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

pub const DEFAULT_AUTOSAVE_DELAY_MS: u64 = 2000;

#[async_trait]
pub trait AutosaveSink: Send + Sync + 'static {
    type Payload: Clone + Send + Sync + 'static;

    async fn persist(&self, key: &str, payload: Self::Payload) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutosaveOutcome {
    Saved { key: String },
    Failed { key: String, message: String },
}

struct PendingSave<P> {
    payload: P,
    generation: u64,
    handle: JoinHandle<()>,
}

type PendingMap<P> = Arc<Mutex<HashMap<String, PendingSave<P>>>>;

/// Per-key debounced persistence. A new edit for a key restarts that key's timer.
pub struct AutosaveScheduler<S: AutosaveSink> {
    sink: Arc<S>,
    delay: Duration,
    pending: PendingMap<S::Payload>,
    generation: AtomicU64,
    outcomes: broadcast::Sender<AutosaveOutcome>,
}

fn lock_pending<P>(pending: &Mutex<HashMap<String, PendingSave<P>>>) -> Result<MutexGuard<'_, HashMap<String, PendingSave<P>>>, EngineError> {
    pending
        .lock()
        .map_err(|error| EngineError::lock_poisoned("autosave queue", error))
}

async fn persist_and_report<S: AutosaveSink>(
    sink: &S,
    outcomes: &broadcast::Sender<AutosaveOutcome>,
    key: String,
    payload: S::Payload,
) -> Result<(), EngineError> {
    match sink.persist(&key, payload).await {
        Ok(()) => {
            tracing::info!(key = %key, "autosave flushed");
            let _ = outcomes.send(AutosaveOutcome::Saved { key });
            Ok(())
        }
        Err(error) => {
            tracing::error!(key = %key, %error, "autosave failed");
            let _ = outcomes.send(AutosaveOutcome::Failed {
                key,
                message: error.to_string(),
            });
            Err(error)
        }
    }
}

impl<S: AutosaveSink> AutosaveScheduler<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self::with_delay(sink, Duration::from_millis(DEFAULT_AUTOSAVE_DELAY_MS))
    }

    pub fn with_delay(sink: Arc<S>, delay: Duration) -> Self {
        let (outcomes, _) = broadcast::channel(64);
        Self {
            sink,
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            outcomes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutosaveOutcome> {
        self.outcomes.subscribe()
    }

    pub fn pending_keys(&self) -> Result<Vec<String>, EngineError> {
        let pending = lock_pending(&self.pending)?;
        let mut keys = pending.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }

    /// Must be called from inside a tokio runtime.
    pub fn schedule(&self, key: &str, payload: S::Payload) -> Result<(), EngineError> {
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(EngineError::InvalidInput("autosave key must not be empty".to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let mut pending = lock_pending(&self.pending)?;
        if let Some(previous) = pending.remove(&key) {
            previous.handle.abort();
        }

        let task_key = key.clone();
        let task_pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let outcomes = self.outcomes.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            let payload = {
                let Ok(mut pending) = lock_pending(&task_pending) else {
                    return;
                };
                match pending.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&task_key).map(|entry| entry.payload)
                    }
                    _ => None,
                }
            };
            if let Some(payload) = payload {
                let _ = persist_and_report(sink.as_ref(), &outcomes, task_key, payload).await;
            }
        });

        pending.insert(
            key.clone(),
            PendingSave {
                payload,
                generation,
                handle,
            },
        );
        tracing::debug!(key = %key, delay_ms = self.delay.as_millis() as u64, "autosave scheduled");
        Ok(())
    }

    /// Drops the pending save for `key`, if any, and returns its payload.
    pub fn cancel(&self, key: &str) -> Result<Option<S::Payload>, EngineError> {
        let removed = lock_pending(&self.pending)?.remove(key.trim());
        Ok(removed.map(|entry| {
            entry.handle.abort();
            tracing::debug!(key = %key, "autosave cancelled");
            entry.payload
        }))
    }

    /// Persists every pending key right away. All keys are attempted; the first
    /// failure is returned.
    pub async fn save_now(&self) -> Result<usize, EngineError> {
        let drained = {
            let mut pending = lock_pending(&self.pending)?;
            pending.drain().collect::<Vec<_>>()
        };

        let mut first_error = None;
        let mut saved = 0;
        for (key, entry) in drained {
            entry.handle.abort();
            match persist_and_report(self.sink.as_ref(), &self.outcomes, key, entry.payload).await {
                Ok(()) => saved += 1,
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(saved),
        }
    }

    /// Cancels every pending timer without saving; returns how many were dropped.
    pub fn shutdown(&self) -> Result<usize, EngineError> {
        let mut pending = lock_pending(&self.pending)?;
        let cancelled = pending.len();
        for (_, entry) in pending.drain() {
            entry.handle.abort();
        }
        if cancelled > 0 {
            tracing::info!(cancelled, "autosave timers cancelled");
        }
        Ok(cancelled)
    }
}

impl<S: AutosaveSink> Drop for AutosaveScheduler<S> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, entry) in pending.drain() {
                entry.handle.abort();
            }
        }
    }
}

/// Writes staged activity drafts straight to the itinerary store.
pub struct RepositoryAutosaveSink<R: ItineraryRepository> {
    repository: Arc<R>,
}

impl<R: ItineraryRepository> RepositoryAutosaveSink<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl<R: ItineraryRepository + 'static> AutosaveSink for RepositoryAutosaveSink<R> {
    type Payload = Activity;

    async fn persist(&self, _key: &str, payload: Activity) -> Result<(), EngineError> {
        self.repository.upsert_activity(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{activity, date, time};
    use crate::domain::models::{ItineraryDay, Trip};
    use crate::infrastructure::itinerary_repository::InMemoryItineraryRepository;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct RecordingSink {
        saved: Mutex<Vec<(String, String)>>,
        calls: AtomicUsize,
        fail_key: Option<String>,
    }

    #[async_trait]
    impl AutosaveSink for RecordingSink {
        type Payload = String;

        async fn persist(&self, key: &str, payload: String) -> Result<(), EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_key.as_deref() == Some(key) {
                return Err(EngineError::Persistence("disk full".to_string()));
            }
            self.saved
                .lock()
                .expect("saved lock poisoned")
                .push((key.to_string(), payload));
            Ok(())
        }
    }

    fn saved(sink: &RecordingSink) -> Vec<(String, String)> {
        sink.saved.lock().expect("saved lock poisoned").clone()
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_save() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::new(Arc::clone(&sink));
        let mut outcomes = scheduler.subscribe();

        scheduler.schedule("act-1", "first".to_string()).expect("schedule");
        sleep(Duration::from_millis(1500)).await;
        scheduler.schedule("act-1", "second".to_string()).expect("reschedule");
        sleep(Duration::from_millis(1500)).await;
        assert!(saved(&sink).is_empty());

        let outcome = outcomes.recv().await.expect("outcome");
        assert_eq!(outcome, AutosaveOutcome::Saved { key: "act-1".to_string() });
        assert_eq!(saved(&sink), vec![("act-1".to_string(), "second".to_string())]);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_debounced_independently() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::with_delay(Arc::clone(&sink), Duration::from_millis(100));

        scheduler.schedule("a", "one".to_string()).expect("schedule a");
        scheduler.schedule("b", "two".to_string()).expect("schedule b");
        assert_eq!(scheduler.pending_keys().expect("keys"), vec!["a".to_string(), "b".to_string()]);

        sleep(Duration::from_millis(150)).await;
        let mut keys = saved(&sink).into_iter().map(|(key, _)| key).collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(scheduler.pending_keys().expect("keys").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn save_now_flushes_without_waiting() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::new(Arc::clone(&sink));
        scheduler.schedule("a", "draft".to_string()).expect("schedule");

        assert_eq!(scheduler.save_now().await.expect("flush"), 1);
        assert_eq!(saved(&sink).len(), 1);

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn save_now_reports_failure_after_attempting_all_keys() {
        let sink = Arc::new(RecordingSink {
            fail_key: Some("bad".to_string()),
            ..RecordingSink::default()
        });
        let scheduler = AutosaveScheduler::new(Arc::clone(&sink));
        let mut outcomes = scheduler.subscribe();
        scheduler.schedule("bad", "x".to_string()).expect("schedule");
        scheduler.schedule("good", "y".to_string()).expect("schedule");

        assert!(matches!(scheduler.save_now().await, Err(EngineError::Persistence(_))));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);

        let mut failed = 0;
        for _ in 0..2 {
            if let AutosaveOutcome::Failed { key, .. } = outcomes.recv().await.expect("outcome") {
                assert_eq!(key, "bad");
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_timers() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::new(Arc::clone(&sink));
        scheduler.schedule("a", "draft".to_string()).expect("schedule");

        assert_eq!(scheduler.shutdown().expect("shutdown"), 1);
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_one_key_and_returns_its_payload() {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = AutosaveScheduler::with_delay(Arc::clone(&sink), Duration::from_millis(50));
        scheduler.schedule("a", "stale".to_string()).expect("schedule a");
        scheduler.schedule("b", "kept".to_string()).expect("schedule b");

        assert_eq!(scheduler.cancel("a").expect("cancel"), Some("stale".to_string()));
        assert_eq!(scheduler.cancel("a").expect("cancel again"), None);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(saved(&sink), vec![("b".to_string(), "kept".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_scheduler_cancels_timers() {
        let sink = Arc::new(RecordingSink::default());
        {
            let scheduler = AutosaveScheduler::new(Arc::clone(&sink));
            scheduler.schedule("a", "draft".to_string()).expect("schedule");
        }
        sleep(Duration::from_millis(5000)).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repository_sink_upserts_activity_rows() {
        let repository = Arc::new(InMemoryItineraryRepository::default());
        repository
            .save_trip(&Trip {
                id: "trip-1".to_string(),
                title: "Visit".to_string(),
                start_date: date("2024-09-16"),
                end_date: date("2024-09-16"),
                time_zone: "UTC".to_string(),
                days: vec![ItineraryDay::new("day-1", "trip-1", date("2024-09-16"), 1)],
            })
            .expect("seed trip");
        let scheduler = AutosaveScheduler::new(Arc::new(RepositoryAutosaveSink::new(Arc::clone(&repository))));

        let mut draft = activity("a", "09:00", 45, "Santos");
        draft.start_time = time("09:30");
        scheduler.schedule(&draft.id, draft.clone()).expect("schedule");
        scheduler.save_now().await.expect("flush");

        let day = repository.load_day("day-1").expect("load").expect("day");
        assert_eq!(day.activity("a").expect("saved").start_time, time("09:30"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let scheduler = AutosaveScheduler::new(Arc::new(RecordingSink::default()));
        assert!(matches!(
            scheduler.schedule("  ", "x".to_string()),
            Err(EngineError::InvalidInput(_))
        ));
    }
}
