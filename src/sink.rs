//! Asynchronous log shipping.
//!
//! [`LogShipper`] decouples the request path from a slow collector. Events
//! go into a bounded queue; a background task flushes them in batches when
//! the queue reaches the flush threshold or the flush interval elapses.
//! Delivery failures are buffered and reported by a *later* call into the
//! shipper:
//!
//! - [`LogShipper::fire`] enqueues an event, then returns one buffered
//!   delivery error if there is one. That error describes an earlier flush,
//!   not the event just fired.
//! - [`LogShipper::take_error`] pops a buffered error without firing.
//! - [`LogShipper::shutdown`] flushes what is queued and returns every error
//!   not yet reported.
//!
//! The request that fired an event is never blocked or failed by the
//! collector.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::StatusCode;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::snippet;
use crate::secret::Secret;
use crate::settings::ShippingConfig;

/// Content type of HEC event batches.
pub const HEC_CONTENT_TYPE: &str = "application/json; profile=urn:splunk:event:1.0; charset=utf-8";

const EVENT_SEPARATOR: &str = "\r\n\r\n";
const ERROR_BUFFER: usize = 16;

/// Error reported by the log shipper.
///
/// ```
/// use service_core::{SinkError, SinkErrorKind};
///
/// let error = SinkError::new(SinkErrorKind::Full);
/// assert_eq!(error.kind(), SinkErrorKind::Full);
/// assert_eq!(error.to_string(), "log sink error (queue full)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkError {
    kind: SinkErrorKind,
    message: Option<String>,
}

impl SinkError {
    /// An error of `kind` without details.
    pub fn new(kind: SinkErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// An error of `kind` with a message.
    pub fn with_message(kind: SinkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> SinkErrorKind {
        self.kind
    }

    /// The message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "log sink error ({}): {}", self.kind, msg),
            None => write!(f, "log sink error ({})", self.kind),
        }
    }
}

impl std::error::Error for SinkError {}

/// Why shipping failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// The event queue is at capacity; the event was dropped.
    Full,
    /// The background task has stopped.
    Closed,
    /// The collector could not be reached.
    Transport,
    /// The collector answered with a non-200 status.
    Remote,
    /// An event could not be encoded.
    Encode,
}

impl fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "queue full"),
            Self::Closed => write!(f, "closed"),
            Self::Transport => write!(f, "transport"),
            Self::Remote => write!(f, "remote"),
            Self::Encode => write!(f, "encode"),
        }
    }
}

/// Destination of flushed batches.
#[async_trait]
pub trait Collector: Send + Sync + fmt::Debug {
    /// Delivers one batch, in fire order.
    async fn deliver(&self, events: Vec<Value>) -> Result<(), SinkError>;
}

// ============================================================================
// LogShipper
// ============================================================================

/// Batching parameters of a [`LogShipper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShipperOptions {
    /// Events buffered before a flush is forced.
    pub flush_threshold: usize,
    /// Longest time an event waits before a flush.
    pub flush_interval: Duration,
    /// Capacity of the event queue.
    pub queue_capacity: usize,
}

impl Default for ShipperOptions {
    fn default() -> Self {
        Self {
            flush_threshold: 10,
            flush_interval: Duration::from_secs(5),
            queue_capacity: 1024,
        }
    }
}

impl From<&ShippingConfig> for ShipperOptions {
    fn from(config: &ShippingConfig) -> Self {
        Self {
            flush_threshold: config.flush_threshold,
            flush_interval: config.flush_interval,
            queue_capacity: config.queue_capacity,
        }
    }
}

/// A bounded queue in front of a [`Collector`], drained by a background task.
#[derive(Debug)]
pub struct LogShipper {
    events: mpsc::Sender<Value>,
    errors: Mutex<mpsc::Receiver<SinkError>>,
    worker: JoinHandle<()>,
}

impl LogShipper {
    /// Starts the background flush task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// When called outside a tokio runtime.
    pub fn spawn(collector: Arc<dyn Collector>, options: ShipperOptions) -> Self {
        let (events, queue) = mpsc::channel(options.queue_capacity.max(1));
        let (failures, errors) = mpsc::channel(ERROR_BUFFER);
        let worker = tokio::spawn(flush_loop(collector, queue, failures, options));
        tracing::debug!(
            threshold = options.flush_threshold,
            interval_ms = options.flush_interval.as_millis() as u64,
            "log shipper started"
        );
        Self {
            events,
            errors: Mutex::new(errors),
            worker,
        }
    }

    /// Ships to the HEC collector described by `config`.
    ///
    /// # Errors
    ///
    /// [`SinkErrorKind::Transport`] when the HTTP client cannot be built.
    pub fn from_config(config: &ShippingConfig) -> Result<Self, SinkError> {
        let collector = HttpCollector::new(config)?;
        Ok(Self::spawn(Arc::new(collector), config.into()))
    }

    /// Enqueues `event` without waiting, then pops one buffered delivery
    /// error.
    ///
    /// # Errors
    ///
    /// [`SinkErrorKind::Full`] or [`SinkErrorKind::Closed`] when the event
    /// was not queued. Otherwise, an error left by an earlier flush.
    pub fn fire(&self, event: Value) -> Result<(), SinkError> {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(SinkError::new(SinkErrorKind::Full)),
            Err(TrySendError::Closed(_)) => return Err(SinkError::new(SinkErrorKind::Closed)),
        }
        match self.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Pops one buffered delivery error.
    pub fn take_error(&self) -> Option<SinkError> {
        self.errors.lock().try_recv().ok()
    }

    /// Flushes queued events, stops the task and returns every unreported
    /// delivery error.
    pub async fn shutdown(self) -> Vec<SinkError> {
        let Self {
            events,
            errors,
            worker,
        } = self;
        drop(events);
        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "log shipper task ended abnormally");
        }
        let mut errors = errors.into_inner();
        let mut pending = Vec::new();
        while let Ok(err) = errors.try_recv() {
            pending.push(err);
        }
        pending
    }
}

async fn flush_loop(
    collector: Arc<dyn Collector>,
    mut queue: mpsc::Receiver<Value>,
    failures: mpsc::Sender<SinkError>,
    options: ShipperOptions,
) {
    let threshold = options.flush_threshold.max(1);
    let mut batch = Vec::with_capacity(threshold);
    let mut ticker = tokio::time::interval(options.flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = queue.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= threshold {
                        flush(collector.as_ref(), &mut batch, &failures).await;
                    }
                }
                None => {
                    flush(collector.as_ref(), &mut batch, &failures).await;
                    tracing::debug!("log shipper stopped");
                    return;
                }
            },
            _ = ticker.tick() => flush(collector.as_ref(), &mut batch, &failures).await,
        }
    }
}

async fn flush(collector: &dyn Collector, batch: &mut Vec<Value>, failures: &mpsc::Sender<SinkError>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    match collector.deliver(events).await {
        Ok(()) => tracing::trace!(count, "log batch delivered"),
        Err(err) => {
            tracing::warn!(count, error = %err, "log batch not delivered");
            if failures.try_send(err).is_err() {
                tracing::warn!("log shipper error buffer full; dropping error");
            }
        }
    }
}

// ============================================================================
// HttpCollector
// ============================================================================

/// Posts batches to a Splunk HTTP Event Collector endpoint.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    url: String,
    token: Secret<String>,
    host: String,
    index: String,
    source: String,
    source_type: String,
}

#[derive(Serialize)]
struct HecEvent<'a> {
    time: f64,
    #[serde(skip_serializing_if = "str::is_empty")]
    host: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    sourcetype: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    index: &'a str,
    event: &'a Value,
}

impl HttpCollector {
    /// A collector for `config.target`. The event host defaults to the
    /// `HOSTNAME` environment variable.
    ///
    /// # Errors
    ///
    /// [`SinkErrorKind::Transport`] when the HTTP client cannot be built.
    pub fn new(config: &ShippingConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("service-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| SinkError::with_message(SinkErrorKind::Transport, err.to_string()))?;
        Ok(Self {
            client,
            url: config.target.clone(),
            token: config.token.clone(),
            host: std::env::var("HOSTNAME").unwrap_or_default(),
            index: config.index.clone(),
            source: config.source.clone(),
            source_type: config.source_type.clone(),
        })
    }

    /// Overrides the host stamped on events.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    fn encode(&self, events: &[Value]) -> Result<String, SinkError> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        let encoded = events
            .iter()
            .map(|event| {
                serde_json::to_string(&HecEvent {
                    time,
                    host: &self.host,
                    source: &self.source,
                    sourcetype: &self.source_type,
                    index: &self.index,
                    event,
                })
                .map_err(|err| SinkError::with_message(SinkErrorKind::Encode, err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(encoded.join(EVENT_SEPARATOR))
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn deliver(&self, events: Vec<Value>) -> Result<(), SinkError> {
        let body = self.encode(&events)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, HEC_CONTENT_TYPE)
            .header(AUTHORIZATION, format!("Splunk {}", self.token.expose_secret()))
            .body(body)
            .send()
            .await
            .map_err(|err| SinkError::with_message(SinkErrorKind::Transport, err.to_string()))?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.unwrap_or_default();
        Err(SinkError::with_message(
            SinkErrorKind::Remote,
            format!(
                "{} answered {} ({}): {}",
                self.url,
                status.as_u16(),
                content_type,
                snippet(&body)
            ),
        ))
    }
}
