//! Bounded, non-blocking log sink for request and health events.
//!
//! `emit` pushes onto an in-memory queue and returns immediately. A single
//! writer task drains the queue in batches into a [`LogBackend`]. When the
//! queue is full the oldest event is discarded, so a slow backend costs
//! history, never memory or request latency.

use crate::core::metrics::get_metrics;
use crate::core::models::{ApiKeyId, GroupId, ProviderId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

const BATCH_SIZE: usize = 50;

/// One completed gateway request, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub group_slug: String,
    pub group_id: Option<GroupId>,
    pub provider_id: Option<ProviderId>,
    pub provider_name: Option<String>,
    pub api_key_id: Option<ApiKeyId>,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub upstream_latency_ms: Option<u64>,
    pub total_duration_ms: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub client_addr: String,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthTransition {
    BecameUnhealthy,
    Recovered,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthTransitionRecord {
    pub provider_id: ProviderId,
    pub transition: HealthTransition,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEvent {
    Request(RequestLogRecord),
    HealthTransition(HealthTransitionRecord),
}

/// Destination for drained log events.
#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn write(&self, events: Vec<LogEvent>) -> anyhow::Result<()>;
}

/// Writes every event as a structured `tracing` record.
pub struct TracingLogBackend;

#[async_trait]
impl LogBackend for TracingLogBackend {
    async fn write(&self, events: Vec<LogEvent>) -> anyhow::Result<()> {
        for event in events {
            match event {
                LogEvent::Request(r) => tracing::info!(
                    target: "request_log",
                    request_id = %r.request_id,
                    group = %r.group_slug,
                    group_id = ?r.group_id,
                    provider_id = ?r.provider_id,
                    provider = r.provider_name.as_deref().unwrap_or("-"),
                    api_key_id = ?r.api_key_id,
                    method = %r.method,
                    path = %r.path,
                    status = r.status_code,
                    upstream_ms = ?r.upstream_latency_ms,
                    total_ms = r.total_duration_ms,
                    success = r.success,
                    error = r.error_message.as_deref().unwrap_or(""),
                    client = %r.client_addr,
                    user_agent = r.user_agent.as_deref().unwrap_or(""),
                    "request completed"
                ),
                LogEvent::HealthTransition(h) => tracing::info!(
                    target: "health_log",
                    provider_id = h.provider_id,
                    transition = ?h.transition,
                    consecutive_failures = h.consecutive_failures,
                    "provider health changed"
                ),
            }
        }
        Ok(())
    }
}

struct SinkQueue {
    events: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SinkQueue {
    fn take_batch(&self) -> Vec<LogEvent> {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        let n = events.len().min(BATCH_SIZE);
        events.drain(..n).collect()
    }
}

/// Cloneable handle to the log queue.
#[derive(Clone)]
pub struct LogSink {
    queue: Arc<SinkQueue>,
    done_rx: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl LogSink {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn LogBackend>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let queue = Arc::new(SinkQueue {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(Self::writer_task(queue.clone(), backend, done_tx));

        Self {
            queue,
            done_rx: Arc::new(Mutex::new(Some(done_rx))),
        }
    }

    /// Queue an event. Never blocks and never fails.
    pub fn emit(&self, event: LogEvent) {
        if self.queue.closed.load(Ordering::Acquire) {
            tracing::debug!("Log sink closed, discarding event");
            return;
        }

        let evicted = {
            let mut events = self.queue.events.lock().unwrap_or_else(|p| p.into_inner());
            let evicted = if events.len() >= self.queue.capacity {
                events.pop_front().is_some()
            } else {
                false
            };
            events.push_back(event);
            evicted
        };

        if evicted {
            let total = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            get_metrics().log_events_dropped.inc();
            if total == 1 || total % 1000 == 0 {
                tracing::warn!(
                    dropped_total = total,
                    capacity = self.queue.capacity,
                    "Log sink queue full, dropping oldest events"
                );
            }
        }

        self.queue.notify.notify_one();
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue
            .events
            .lock()
            .map(|events| events.len())
            .unwrap_or(0)
    }

    /// Stop accepting events and wait up to `deadline` for the queue to drain.
    pub async fn shutdown(&self, deadline: Duration) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();

        let rx = self.done_rx.lock().ok().and_then(|mut guard| guard.take());
        if let Some(rx) = rx {
            match tokio::time::timeout(deadline, rx).await {
                Ok(_) => tracing::info!("Log sink drained"),
                Err(_) => tracing::warn!(
                    pending = self.pending(),
                    "Log sink did not drain before shutdown deadline"
                ),
            }
        }
    }

    async fn writer_task(
        queue: Arc<SinkQueue>,
        backend: Arc<dyn LogBackend>,
        done_tx: oneshot::Sender<()>,
    ) {
        loop {
            let batch = queue.take_batch();
            if batch.is_empty() {
                if queue.closed.load(Ordering::Acquire) {
                    break;
                }
                queue.notify.notified().await;
                continue;
            }

            let count = batch.len();
            if let Err(e) = backend.write(batch).await {
                tracing::error!(events = count, error = %e, "Failed to write log events");
            }
        }

        tracing::info!("Log sink writer task stopped");
        let _ = done_tx.send(());
    }
}
