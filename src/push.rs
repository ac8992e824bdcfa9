use crate::engine::{SampleSource, SyncContext};
use crate::events::SyncEvent;
use crate::model::{Sample, SampleError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
    Closed { degraded: bool },
}

impl ConnectionState {
    pub fn is_degraded(self) -> bool {
        matches!(self, ConnectionState::Closed { degraded: true })
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            ConnectionState::Closed { degraded: true } => f.write_str("degraded"),
            ConnectionState::Closed { degraded: false } => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    Fixed {
        interval: Duration,
        max_attempts: u32,
    },
    Exponential {
        initial: Duration,
        max_delay: Duration,
        multiplier: f64,
        max_attempts: u32,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            interval: Duration::from_millis(3000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            ReconnectPolicy::Fixed { max_attempts, .. }
            | ReconnectPolicy::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }

    /// Wait before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            ReconnectPolicy::Fixed { interval, .. } => *interval,
            ReconnectPolicy::Exponential {
                initial,
                max_delay,
                multiplier,
                ..
            } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let ms = initial.as_millis() as f64 * multiplier.powi(exp);
                if !ms.is_finite() || ms >= max_delay.as_millis() as f64 {
                    *max_delay
                } else {
                    Duration::from_millis(ms as u64)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Retry(Duration),
    GiveUp,
}

#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts: u32,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Closed { degraded: false },
            policy,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn start(&mut self) -> ConnectionState {
        if let ConnectionState::Closed { .. } = self.state {
            self.attempts = 0;
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    pub fn opened(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Connecting {
            self.attempts = 0;
            self.state = ConnectionState::Open;
        }
        self.state
    }

    pub fn failed(&mut self) -> Step {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open => {
                if self.attempts < self.policy.max_attempts() {
                    self.attempts += 1;
                    self.state = ConnectionState::Reconnecting {
                        attempt: self.attempts,
                    };
                    Step::Retry(self.policy.delay(self.attempts))
                } else {
                    self.state = ConnectionState::Closed { degraded: true };
                    Step::GiveUp
                }
            }
            ConnectionState::Reconnecting { attempt } => Step::Retry(self.policy.delay(attempt)),
            ConnectionState::Closed { .. } => Step::GiveUp,
        }
    }

    pub fn retry(&mut self) -> ConnectionState {
        if let ConnectionState::Reconnecting { .. } = self.state {
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    pub fn stop(&mut self) -> ConnectionState {
        self.state = ConnectionState::Closed { degraded: false };
        self.state
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not a JSON envelope: {0}")]
    Json(#[source] serde_json::Error),
    #[error("metric payload does not decode: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("metric payload is invalid: {0}")]
    Sample(#[from] SampleError),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

pub fn decode_frame(text: &str) -> Result<Option<Sample>, FrameError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(FrameError::Json)?;
    if envelope.event != "metric" {
        return Ok(None);
    }
    let sample: Sample = serde_json::from_value(envelope.data).map_err(FrameError::Payload)?;
    sample.validate()?;
    Ok(Some(sample))
}

pub type PushStream = BoxStream<'static, Result<String, ChannelError>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushStream, ChannelError>;
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> Result<PushStream, ChannelError> {
        let handshake = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()));
        let (ws, _response) = match handshake.await {
            Ok(result) => result.map_err(|e| ChannelError::Connect(format!("{}: {e}", self.url)))?,
            Err(_elapsed) => {
                return Err(ChannelError::Connect(format!(
                    "{}: handshake timed out after {}",
                    self.url,
                    humantime::format_duration(self.connect_timeout)
                )))
            }
        };

        let frames = futures::stream::unfold(Some(ws), |state| async move {
            let mut ws = state?;
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), Some(ws))),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "push channel closed by server");
                        return None;
                    }
                    // Binary payloads are not part of the protocol; pings are
                    // answered by tungstenite.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Some((Err(ChannelError::Receive(e.to_string())), None)),
                    None => return None,
                }
            }
        });
        Ok(frames.boxed())
    }
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PushSource {
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    ctx: SyncContext,
    state_tx: watch::Sender<ConnectionState>,
    running: Mutex<Option<Running>>,
}

impl PushSource {
    pub fn new(connector: Arc<dyn PushConnector>, policy: ReconnectPolicy, ctx: SyncContext) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed { degraded: false });
        Self {
            connector,
            policy,
            ctx,
            state_tx,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn start(&self) {
        let mut running = self.running.lock();
        if let Some(r) = running.as_ref() {
            if !r.handle.is_finished() {
                return;
            }
        }

        let cancel = CancellationToken::new();
        let publisher = StatePublisher {
            tx: self.state_tx.clone(),
            ctx: self.ctx.clone(),
            cancel: cancel.clone(),
        };
        let connector = Arc::clone(&self.connector);
        let policy = self.policy.clone();
        let ctx = self.ctx.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_connection_loop(connector, policy, ctx, publisher, task_cancel).await;
        });
        *running = Some(Running { cancel, handle });
    }

    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        let closed = ConnectionState::Closed { degraded: false };
        let changed = self.state_tx.send_if_modified(|state| {
            running.cancel.cancel();
            if *state == closed {
                return false;
            }
            *state = closed;
            true
        });
        running.handle.abort();
        if changed {
            self.ctx.metrics.set_connection_state(closed);
            let _ = self.ctx.events.send(SyncEvent::ConnectionChanged(closed));
        }
    }
}

struct StatePublisher {
    tx: watch::Sender<ConnectionState>,
    ctx: SyncContext,
    cancel: CancellationToken,
}

impl StatePublisher {
    fn publish(&self, next: ConnectionState) {
        // Checked under the watch lock so a concurrent stop() always wins.
        let changed = self.tx.send_if_modified(|state| {
            if self.cancel.is_cancelled() || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!(state = %next, "push channel state");
            self.ctx.metrics.set_connection_state(next);
            let _ = self.ctx.events.send(SyncEvent::ConnectionChanged(next));
        }
    }
}

async fn run_connection_loop(
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    ctx: SyncContext,
    publisher: StatePublisher,
    cancel: CancellationToken,
) {
    let mut machine = ConnectionMachine::new(policy);
    publisher.publish(machine.start());

    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = connector.connect() => result,
        };

        match connected {
            Ok(stream) => {
                publisher.publish(machine.opened());
                info!("push channel open");
                match pump_frames(stream, &ctx, &cancel).await {
                    Some(err) => warn!(error = %err, "push channel lost"),
                    None => break,
                }
            }
            Err(err) => {
                warn!(attempt = machine.attempts(), error = %err, "push channel connect failed");
            }
        }

        match machine.failed() {
            Step::Retry(delay) => {
                publisher.publish(machine.state());
                info!(
                    attempt = machine.attempts(),
                    delay = %humantime::format_duration(delay),
                    "reconnecting push channel"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                publisher.publish(machine.retry());
            }
            Step::GiveUp => {
                publisher.publish(machine.state());
                error!(
                    attempts = machine.attempts(),
                    "push channel degraded, continuing with polling only"
                );
                return;
            }
        }
    }

    let state = machine.stop();
    debug!(state = %state, "push connection task cancelled");
}

async fn pump_frames(
    mut stream: PushStream,
    ctx: &SyncContext,
    cancel: &CancellationToken,
) -> Option<ChannelError> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(text)) => handle_frame(ctx, &text),
            Some(Err(err)) => return Some(err),
            None => return Some(ChannelError::Closed),
        }
    }
}

fn handle_frame(ctx: &SyncContext, text: &str) {
    match decode_frame(text) {
        Ok(Some(sample)) => {
            let id = sample.entity_id.clone();
            ctx.ingest(SampleSource::Push, &id, sample);
        }
        Ok(None) => debug!("ignoring non-metric push event"),
        Err(err) => {
            warn!(error = %err, "dropping malformed push frame");
            ctx.metrics.inc_malformed_event();
            let _ = ctx.events.send(SyncEvent::MalformedEvent {
                reason: err.to_string(),
            });
        }
    }
}
