//! WebSocket stream runner
//!
//! Every exchange stream (orders, prices, klines) runs as one task driven by
//! [`run_stream`]:
//!
//! ```text
//! ┌───────────────┐   Ping every N secs   ┌──────────────┐
//! │ Heartbeat     │ ────────────────────> │              │
//! │ task          │   unbounded channel   │  select loop │ ──> session.on_text()
//! └───────────────┘                       │              │ ──> typed event channel
//!      shutdown / disconnect ───────────> │              │
//!                                         └──────────────┘
//! ```
//!
//! On disconnect the runner asks its [`ReconnectionStrategy`] how long to
//! wait, asks the session for a fresh URL and re-sends its subscriptions. A
//! ping left unanswered for `pong_timeout` counts as a dead connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::infrastructure::exchange::Result as ExchangeResult;
use crate::infrastructure::shutdown::ShutdownManager;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the runner behaves between connections
pub trait ReconnectionStrategy: Send + Sync + Debug {
    /// Delay before reconnect attempt `attempt` (0-indexed since the last
    /// successful connection). `None` stops the stream.
    fn next_delay(&self, attempt: usize) -> Option<Duration>;
}

/// `initial_delay * 2^attempt`, capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: Option<usize>,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        let factor = 2u64.saturating_pow(attempt.min(32) as u32);
        let millis = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        Some(Duration::from_millis(millis.min(self.max_delay.as_millis() as u64)))
    }
}

/// Same wait before every attempt
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    max_attempts: Option<usize>,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: Option<usize>) -> Self {
        Self { delay, max_attempts }
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&self, attempt: usize) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt >= max => None,
            _ => Some(self.delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub reconnect: Arc<dyn ReconnectionStrategy>,
    /// Interval between client pings
    pub heartbeat_interval: Duration,
    /// Longest a ping may stay unanswered before the connection is dropped
    pub pong_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: Arc::new(ExponentialBackoff::new(
                Duration::from_secs(5),
                Duration::from_secs(60),
                None,
            )),
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
        }
    }
}

/// Tracks the oldest unanswered ping of one connection
#[derive(Debug)]
pub struct PongTracker {
    timeout: Duration,
    awaiting_since: Option<Instant>,
}

impl PongTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            awaiting_since: None,
        }
    }

    pub fn record_ping_sent(&mut self) {
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(Instant::now());
        }
    }

    pub fn record_pong_received(&mut self) {
        self.awaiting_since = None;
    }

    /// False once a ping has waited longer than the timeout
    pub fn is_healthy(&self) -> bool {
        self.awaiting_since
            .map_or(true, |since| since.elapsed() < self.timeout)
    }
}

/// What the runner should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    /// Drop the connection and reconnect (e.g. an expired listen key)
    Reconnect,
    /// Stop the stream for good
    Stop,
}

/// Exchange-specific half of a stream
#[async_trait]
pub trait StreamSession: Send {
    /// Name used in logs
    fn name(&self) -> String;

    /// URL for the next connection. Called before every (re)connect.
    async fn url(&mut self) -> ExchangeResult<String>;

    /// Text frames sent right after connecting
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_text(&mut self, text: &str) -> StreamControl;

    /// Period of [`StreamSession::on_maintenance`], if the session needs one
    fn maintenance_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic upkeep while connected (listen-key keepalive and the like)
    async fn on_maintenance(&mut self) -> StreamControl {
        StreamControl::Continue
    }
}

/// Spawn a task that emits a ping into the returned channel every `interval`.
///
/// The first ping is sent after one full interval. The task ends when the
/// receiver is dropped.
pub fn spawn_heartbeat(interval: Duration) -> (JoinHandle<()>, UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if tx.send(Message::Ping(Vec::new())).is_err() {
                debug!("[Stream] Heartbeat channel closed");
                break;
            }
        }
    });

    (handle, rx)
}

enum SessionEnd {
    Shutdown,
    Stopped,
    Disconnected(String),
}

/// Run `session` until shutdown or until it asks to stop
pub async fn run_stream<S: StreamSession>(
    mut session: S,
    config: StreamConfig,
    shutdown: Arc<ShutdownManager>,
) {
    let name = session.name();
    let mut first = true;
    let mut attempt: usize = 0;

    loop {
        if !shutdown.is_running() {
            break;
        }

        if !first {
            let Some(delay) = config.reconnect.next_delay(attempt) else {
                warn!("[Stream] {} giving up after {} reconnect attempts", name, attempt);
                break;
            };
            info!(
                "[Stream] {} reconnecting in {:?} (attempt {})",
                name,
                delay,
                attempt + 1
            );
            shutdown.interruptible_sleep(delay).await;
            if !shutdown.is_running() {
                break;
            }
            attempt += 1;
        }
        first = false;

        let url = match session.url().await {
            Ok(url) => url,
            Err(e) => {
                warn!("[Stream] {} failed to prepare connection: {}", name, e);
                continue;
            }
        };

        let ws = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => {
                warn!("[Stream] {} failed to connect: {}", name, e);
                continue;
            }
            Err(_) => {
                warn!("[Stream] {} connect timed out", name);
                continue;
            }
        };

        info!("[Stream] {} connected", name);
        attempt = 0;

        match drive(&mut session, ws, &config, &shutdown).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Stopped => {
                info!("[Stream] {} stopped by session", name);
                break;
            }
            SessionEnd::Disconnected(reason) => {
                warn!("[Stream] {} disconnected: {}", name, reason);
            }
        }
    }

    info!("[Stream] {} stopped", name);
}

async fn drive<S: StreamSession>(
    session: &mut S,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &StreamConfig,
    shutdown: &ShutdownManager,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();

    for sub in session.subscriptions() {
        if let Err(e) = write.send(Message::Text(sub)).await {
            return SessionEnd::Disconnected(format!("subscription failed: {}", e));
        }
    }

    let (heartbeat, mut heartbeat_rx) = spawn_heartbeat(config.heartbeat_interval);
    let mut pongs = PongTracker::new(config.pong_timeout);

    let maintenance_period = session.maintenance_interval();
    let period = maintenance_period.unwrap_or(Duration::from_secs(3600));
    let mut maintenance =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let end = loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break SessionEnd::Shutdown;
            }

            Some(ping) = heartbeat_rx.recv() => {
                if !pongs.is_healthy() {
                    break SessionEnd::Disconnected(format!(
                        "no pong within {:?}",
                        config.pong_timeout
                    ));
                }
                if let Err(e) = write.send(ping).await {
                    break SessionEnd::Disconnected(format!("heartbeat failed: {}", e));
                }
                pongs.record_ping_sent();
            }

            _ = maintenance.tick(), if maintenance_period.is_some() => {
                match session.on_maintenance().await {
                    StreamControl::Continue => {}
                    StreamControl::Reconnect => break SessionEnd::Disconnected("maintenance requested reconnect".to_string()),
                    StreamControl::Stop => break SessionEnd::Stopped,
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match session.on_text(&text) {
                        StreamControl::Continue => {}
                        StreamControl::Reconnect => break SessionEnd::Disconnected("session requested reconnect".to_string()),
                        StreamControl::Stop => break SessionEnd::Stopped,
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            break SessionEnd::Disconnected(format!("pong failed: {}", e));
                        }
                    }
                    Some(Ok(Message::Pong(_))) => pongs.record_pong_received(),
                    Some(Ok(Message::Close(frame))) => {
                        break SessionEnd::Disconnected(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break SessionEnd::Disconnected(e.to_string()),
                    None => break SessionEnd::Disconnected("stream ended".to_string()),
                }
            }
        }
    };

    heartbeat.abort();
    end
}
