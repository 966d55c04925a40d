//! Per-model admission control: bounded queueing plus bounded parallelism.
//!
//! Each model gets a two-level gate. A request that cannot start immediately
//! must claim a waiting slot within a short put window or be rejected; once
//! queued it waits FIFO for an execution permit, bounded by the caller's
//! overall deadline. Requests for different models never block each other.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use guardpost_core::config::ProxyConfig;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// How long a request may wait for a waiting-queue slot before rejection.
/// Overridable via `GUARDPOST_QUEUE_PUT_TIMEOUT_MS`.
const DEFAULT_QUEUE_PUT_TIMEOUT: Duration = Duration::from_millis(100);

fn queue_put_timeout() -> Duration {
    std::env::var("GUARDPOST_QUEUE_PUT_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_QUEUE_PUT_TIMEOUT)
}

/// Memory threshold for the auto-sized parallel limit.
const AUTO_PARALLEL_MEMORY_GIB: f64 = 16.0;

/// Admission failure surfaced to the orchestrators.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("request queue full for model '{model}' (max: {queue_limit})")]
    QueueFull { model: String, queue_limit: usize },

    #[error("request for model '{model}' timed out after {elapsed_ms} ms")]
    Timeout { model: String, elapsed_ms: u64 },
}

#[derive(Default)]
struct Counters {
    active: usize,
    waiting: usize,
    processed: u64,
    rejected: u64,
    total_wait: Duration,
    total_processing: Duration,
}

/// Queue state for a single model.
pub struct ModelQueue {
    model: String,
    parallel_limit: usize,
    queue_limit: usize,
    parallel: Arc<Semaphore>,
    waiting: Arc<Semaphore>,
    put_timeout: Duration,
    counters: Mutex<Counters>,
    created_at: Instant,
}

/// Decrements the `waiting` gauge even when the caller is cancelled at an
/// await point.
struct WaitingGuard<'a>(&'a ModelQueue);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.counters.lock().waiting -= 1;
    }
}

/// Decrements the `active` gauge on every exit path.
struct ActiveGuard<'a>(&'a ModelQueue);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.counters.lock().active -= 1;
    }
}

impl ModelQueue {
    fn new(model: String, parallel_limit: usize, queue_limit: usize) -> Self {
        let parallel_limit = parallel_limit.max(1);
        tracing::info!(
            model = %model,
            parallel = parallel_limit,
            queue = queue_limit,
            "request queue initialized"
        );
        Self {
            parallel: Arc::new(Semaphore::new(parallel_limit)),
            waiting: Arc::new(Semaphore::new(queue_limit)),
            put_timeout: queue_put_timeout(),
            counters: Mutex::new(Counters::default()),
            parallel_limit,
            queue_limit,
            model,
            created_at: Instant::now(),
        }
    }

    /// Run `operation` under this queue's limits.
    ///
    /// The wait for an execution permit and the operation itself share one
    /// deadline. Permits are RAII, so cancellation at any await point
    /// releases them; `rejected` counts only queue-full rejections.
    pub async fn execute<F, T>(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        let enqueued_at = Instant::now();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        // Fast path: a free execution slot means we never occupy the queue.
        let permit = match self.parallel.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => self.wait_for_permit(request_id, deadline, enqueued_at).await?,
        };

        let wait_time = enqueued_at.elapsed();
        let _active = {
            let mut counters = self.counters.lock();
            counters.active += 1;
            counters.total_wait += wait_time;
            ActiveGuard(self)
        };
        tracing::debug!(
            request_id,
            model = %self.model,
            wait_ms = wait_time.as_millis() as u64,
            "request admitted"
        );

        let processing_start = Instant::now();
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, operation).await,
            None => Ok(operation.await),
        };
        drop(_active);
        drop(permit);

        match outcome {
            Ok(value) => {
                let processing = processing_start.elapsed();
                let mut counters = self.counters.lock();
                counters.processed += 1;
                counters.total_processing += processing;
                drop(counters);
                tracing::debug!(
                    request_id,
                    model = %self.model,
                    processing_ms = processing.as_millis() as u64,
                    "request completed"
                );
                Ok(value)
            }
            Err(_) => Err(AdmissionError::Timeout {
                model: self.model.clone(),
                elapsed_ms: enqueued_at.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn wait_for_permit(
        &self,
        request_id: &str,
        deadline: Option<tokio::time::Instant>,
        enqueued_at: Instant,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, AdmissionError> {
        // Claim a waiting slot within the put window.
        let queue_slot = match tokio::time::timeout(
            self.put_timeout,
            self.waiting.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => slot,
            _ => {
                self.counters.lock().rejected += 1;
                tracing::warn!(request_id, model = %self.model, "queue full, rejecting");
                return Err(AdmissionError::QueueFull {
                    model: self.model.clone(),
                    queue_limit: self.queue_limit,
                });
            }
        };

        let _waiting = {
            self.counters.lock().waiting += 1;
            WaitingGuard(self)
        };

        let acquire = self.parallel.clone().acquire_owned();
        let acquired = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(AdmissionError::Timeout {
                        model: self.model.clone(),
                        elapsed_ms: enqueued_at.elapsed().as_millis() as u64,
                    });
                }
            },
            None => acquire.await,
        };
        drop(_waiting);
        drop(queue_slot);

        // The semaphore is never closed while the queue is alive.
        acquired.map_err(|_| AdmissionError::Timeout {
            model: self.model.clone(),
            elapsed_ms: enqueued_at.elapsed().as_millis() as u64,
        })
    }

    /// Point-in-time metrics for this queue.
    pub fn snapshot(&self) -> serde_json::Value {
        let counters = self.counters.lock();
        let avg_wait_ms = if counters.processed > 0 {
            counters.total_wait.as_secs_f64() * 1000.0 / counters.processed as f64
        } else {
            0.0
        };
        let avg_processing_ms = if counters.processed > 0 {
            counters.total_processing.as_secs_f64() * 1000.0 / counters.processed as f64
        } else {
            0.0
        };
        serde_json::json!({
            "model": self.model,
            "parallel_limit": self.parallel_limit,
            "queue_limit": self.queue_limit,
            "active_requests": counters.active,
            "queued_requests": counters.waiting,
            "available_slots": self.parallel_limit.saturating_sub(counters.active),
            "queue_available": self.queue_limit.saturating_sub(counters.waiting),
            "total_processed": counters.processed,
            "total_rejected": counters.rejected,
            "avg_wait_time_ms": (avg_wait_ms * 100.0).round() / 100.0,
            "avg_processing_time_ms": (avg_processing_ms * 100.0).round() / 100.0,
            "uptime_seconds": self.created_at.elapsed().as_secs_f64(),
        })
    }

    pub fn parallel_limit(&self) -> usize {
        self.parallel_limit
    }

    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.counters.lock().active
    }
}

/// Global admission controller: one [`ModelQueue`] per model name.
pub struct AdmissionController {
    queues: DashMap<String, Arc<ModelQueue>>,
    default_parallel: usize,
    default_queue_limit: usize,
}

impl AdmissionController {
    /// `default_parallel = None` auto-sizes from available host memory.
    pub fn new(default_parallel: Option<usize>, default_queue_limit: usize) -> Self {
        let default_parallel = default_parallel.unwrap_or_else(detect_parallel_limit);
        tracing::info!(
            default_parallel,
            default_queue_limit,
            "admission controller initialized"
        );
        Self {
            queues: DashMap::new(),
            default_parallel,
            default_queue_limit,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.ollama_num_parallel.fixed(), config.ollama_max_queue)
    }

    /// Resolve or create the queue for `model` with default limits.
    pub fn queue_for(&self, model: &str) -> Arc<ModelQueue> {
        self.queues
            .entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(ModelQueue::new(
                    model.to_string(),
                    self.default_parallel,
                    self.default_queue_limit,
                ))
            })
            .value()
            .clone()
    }

    /// Run `operation` under the limits for `model`.
    pub async fn execute<F, T>(
        &self,
        model: &str,
        request_id: &str,
        timeout: Option<Duration>,
        operation: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        // The map lock is held only for lookup/insert; execution happens on
        // the cloned Arc.
        let queue = self.queue_for(model);
        queue.execute(request_id, timeout, operation).await
    }

    /// Replace a model's queue with one using the new limits.
    ///
    /// In-flight requests drain on the old queue; counters start over.
    /// Returns `None` when the model has no queue yet.
    pub fn update_limits(
        &self,
        model: &str,
        parallel_limit: Option<usize>,
        queue_limit: Option<usize>,
    ) -> Option<serde_json::Value> {
        let current = self.queues.get(model)?.value().clone();
        let new_parallel = parallel_limit.unwrap_or_else(|| current.parallel_limit());
        let new_queue = queue_limit.unwrap_or_else(|| current.queue_limit());
        self.queues.insert(
            model.to_string(),
            Arc::new(ModelQueue::new(model.to_string(), new_parallel, new_queue)),
        );
        tracing::info!(model, parallel = new_parallel, queue = new_queue, "limits updated");
        Some(serde_json::json!({
            "model": model,
            "parallel_limit": new_parallel,
            "queue_limit": new_queue,
            "status": "updated",
        }))
    }

    /// Reset statistics by recreating queues with their current limits.
    pub fn reset_stats(&self, model: Option<&str>) {
        let targets: Vec<String> = match model {
            Some(m) => vec![m.to_string()],
            None => self.queues.iter().map(|e| e.key().clone()).collect(),
        };
        for name in targets {
            if let Some(existing) = self.queues.get(&name).map(|e| e.value().clone()) {
                self.queues.insert(
                    name.clone(),
                    Arc::new(ModelQueue::new(
                        name.clone(),
                        existing.parallel_limit(),
                        existing.queue_limit(),
                    )),
                );
            }
        }
        tracing::info!(model = ?model, "admission statistics reset");
    }

    /// Metrics snapshot for every model plus controller-level defaults.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut models = serde_json::Map::new();
        for entry in self.queues.iter() {
            models.insert(entry.key().clone(), entry.value().snapshot());
        }
        serde_json::json!({
            "default_parallel": self.default_parallel,
            "default_queue_limit": self.default_queue_limit,
            "total_models": models.len(),
            "models": models,
            "memory": memory_info(),
        })
    }

    pub fn model_snapshot(&self, model: &str) -> Option<serde_json::Value> {
        self.queues.get(model).map(|queue| queue.snapshot())
    }

    pub fn default_parallel(&self) -> usize {
        self.default_parallel
    }
}

/// Auto-size the per-model parallel limit from available memory:
/// >= 16 GiB available selects 4, anything less selects 1, and a failed
/// probe selects 4.
pub fn detect_parallel_limit() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available == 0 {
        tracing::warn!("could not probe available memory, using parallel limit 4");
        return 4;
    }
    let available_gib = available as f64 / (1024.0 * 1024.0 * 1024.0);
    let parallel = if available_gib >= AUTO_PARALLEL_MEMORY_GIB { 4 } else { 1 };
    tracing::info!(
        available_gib = (available_gib * 100.0).round() / 100.0,
        parallel,
        "auto-detected parallel limit"
    );
    parallel
}

/// Host memory report surfaced under `/stats`.
pub fn memory_info() -> serde_json::Value {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory();
    let available = system.available_memory();
    if total == 0 {
        return serde_json::json!({
            "error": "memory info not available",
            "recommended_parallel": 4,
        });
    }
    let gib = 1024.0 * 1024.0 * 1024.0;
    let total_gb = total as f64 / gib;
    let available_gb = available as f64 / gib;
    let used_gb = total_gb - available_gb;
    serde_json::json!({
        "total_gb": (total_gb * 100.0).round() / 100.0,
        "available_gb": (available_gb * 100.0).round() / 100.0,
        "used_gb": (used_gb * 100.0).round() / 100.0,
        "percent": ((used_gb / total_gb * 100.0) * 100.0).round() / 100.0,
        "recommended_parallel": detect_parallel_limit(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_operation_and_counts_processed() {
        let controller = AdmissionController::new(Some(2), 8);
        let result = controller
            .execute("m", "r1", None, async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(result, 42);

        let snapshot = controller.model_snapshot("m").unwrap();
        assert_eq!(snapshot["total_processed"], 1);
        assert_eq!(snapshot["active_requests"], 0);
    }

    #[tokio::test]
    async fn rejects_when_queue_full() {
        let controller = Arc::new(AdmissionController::new(Some(1), 0));

        let blocker = controller.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute("m", "r1", None, async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                })
                .await
        });
        // Let the first request take the permit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = controller
            .execute("m", "r2", None, async {})
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { .. }));

        let snapshot = controller.model_snapshot("m").unwrap();
        assert_eq!(snapshot["total_rejected"], 1);
        hold.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn times_out_waiting_for_permit_without_leaking() {
        let controller = Arc::new(AdmissionController::new(Some(1), 8));

        let blocker = controller.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute("m", "r1", None, async {
                    tokio::time::sleep(Duration::from_millis(400)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = controller
            .execute("m", "r2", Some(Duration::from_millis(100)), async {})
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout { .. }));

        hold.await.unwrap().unwrap();

        // The permit released by r1 must be available again.
        let result = controller
            .execute("m", "r3", Some(Duration::from_millis(100)), async { 7 })
            .await
            .unwrap();
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn parallel_limit_is_never_exceeded() {
        let controller = Arc::new(AdmissionController::new(Some(3), 64));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..24 {
            let controller = controller.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                controller
                    .execute("m", &format!("r{i}"), None, async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let snapshot = controller.model_snapshot("m").unwrap();
        assert_eq!(snapshot["total_processed"], 24);
        assert_eq!(snapshot["active_requests"], 0);
        assert_eq!(snapshot["queued_requests"], 0);
    }

    #[tokio::test]
    async fn models_are_isolated() {
        let controller = Arc::new(AdmissionController::new(Some(1), 0));

        let blocker = controller.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute("busy-model", "r1", None, async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // A different model must admit immediately.
        let value = controller
            .execute("idle-model", "r2", Some(Duration::from_millis(100)), async { 1 })
            .await
            .unwrap();
        assert_eq!(value, 1);
        hold.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn operation_timeout_produces_timeout_error() {
        let controller = AdmissionController::new(Some(1), 8);
        let err = controller
            .execute("m", "r1", Some(Duration::from_millis(50)), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout { .. }));

        // Permit must have been released.
        let queue = controller.queue_for("m");
        assert_eq!(queue.active(), 0);
        let ok = controller
            .execute("m", "r2", Some(Duration::from_millis(100)), async { 5 })
            .await
            .unwrap();
        assert_eq!(ok, 5);
    }

    #[tokio::test]
    async fn update_limits_resets_counters() {
        let controller = AdmissionController::new(Some(2), 8);
        controller.execute("m", "r1", None, async {}).await.unwrap();
        assert_eq!(controller.model_snapshot("m").unwrap()["total_processed"], 1);

        let updated = controller.update_limits("m", Some(4), None).unwrap();
        assert_eq!(updated["parallel_limit"], 4);
        assert_eq!(updated["queue_limit"], 8);

        let snapshot = controller.model_snapshot("m").unwrap();
        assert_eq!(snapshot["total_processed"], 0);
        assert_eq!(snapshot["parallel_limit"], 4);
    }

    #[tokio::test]
    async fn unknown_model_update_is_none() {
        let controller = AdmissionController::new(Some(1), 1);
        assert!(controller.update_limits("ghost", Some(2), None).is_none());
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_queue_slot() {
        let controller = Arc::new(AdmissionController::new(Some(1), 1));

        let blocker = controller.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute("m", "r1", None, async {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        // r2 occupies the single queue slot, then is cancelled.
        let waiter = controller.clone();
        let cancelled = tokio::spawn(async move {
            waiter.execute("m", "r2", None, async {}).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancelled.abort();
        let _ = cancelled.await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The slot must be free for r3; rejected must not have moved.
        let snapshot = controller.model_snapshot("m").unwrap();
        assert_eq!(snapshot["queued_requests"], 0);
        assert_eq!(snapshot["total_rejected"], 0);

        hold.await.unwrap().unwrap();
        controller.execute("m", "r3", None, async {}).await.unwrap();
    }

    #[test]
    fn detect_parallel_limit_is_1_or_4() {
        let limit = detect_parallel_limit();
        assert!(limit == 1 || limit == 4);
    }

    #[test]
    fn memory_info_has_recommendation() {
        let info = memory_info();
        assert!(info.get("recommended_parallel").is_some());
    }
}
