use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::errors::{LauncherError, Result};
use crate::models::PushMessage;
use crate::services::JobRegistry;

const BASE_RECONNECT_DELAY_MS: u64 = 1_000;
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Delay before reconnect attempt number `attempt` (zero based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(
        BASE_RECONNECT_DELAY_MS
            .saturating_mul(factor)
            .min(MAX_RECONNECT_DELAY_MS),
    )
}

/// Push endpoint for an API base url: same host, ws(s) scheme, `/ws` path.
pub fn push_url(base_url: &str) -> Result<String> {
    let mut url = Url::parse(base_url.trim())
        .map_err(|err| LauncherError::Config(format!("invalid api url {}: {}", base_url, err)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(LauncherError::Config(format!(
                "cannot derive a push url from scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| LauncherError::Config(format!("cannot switch {} to {}", base_url, scheme)))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

/// Owned push connection feeding progress frames into the registry. At most
/// one connection is live; closes are followed by backoff reconnects unless
/// the disconnect was requested.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    url: String,
    registry: JobRegistry,
    state: Mutex<ChannelState>,
    phase: watch::Sender<ChannelPhase>,
}

#[derive(Default)]
struct ChannelState {
    attempt: u32,
    manual_disconnect: bool,
    // Bumped whenever running tasks must detach from the channel.
    generation: u64,
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ChannelState {
    fn abort_tasks(&mut self) {
        if let Some(task) = self.connection.take() {
            task.abort();
        }
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

impl ProgressChannel {
    pub fn new(url: String, registry: JobRegistry) -> Self {
        let (phase, _) = watch::channel(ChannelPhase::Idle);
        Self {
            inner: Arc::new(ChannelInner {
                url,
                registry,
                state: Mutex::new(ChannelState::default()),
                phase,
            }),
        }
    }

    pub fn for_api(base_url: &str, registry: JobRegistry) -> Result<Self> {
        Ok(Self::new(push_url(base_url)?, registry))
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn phase(&self) -> ChannelPhase {
        *self.inner.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelPhase> {
        self.inner.phase.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ChannelPhase::Open
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.inner.lock().attempt
    }

    /// Opens the connection unless one is already open or being opened. A
    /// previous `disconnect` keeps automatic reconnects off.
    pub fn connect(&self) {
        let mut state = self.inner.lock();
        if matches!(self.phase(), ChannelPhase::Open | ChannelPhase::Connecting) {
            tracing::debug!("push channel already {:?}", self.phase());
            return;
        }
        state.generation += 1;
        state.abort_tasks();
        self.inner.start_connection(&mut state);
    }

    /// Drops whatever connection exists and opens a fresh one.
    pub fn force_reconnect(&self) {
        let mut state = self.inner.lock();
        tracing::info!("forcing push channel reconnect");
        state.generation += 1;
        state.abort_tasks();
        state.manual_disconnect = false;
        self.inner.start_connection(&mut state);
    }

    /// Closes the connection and suppresses automatic reconnects until the
    /// next `force_reconnect`.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.manual_disconnect = true;
        state.generation += 1;
        state.abort_tasks();
        self.inner.phase.send_replace(ChannelPhase::Closed);
        tracing::info!("push channel disconnected");
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start_connection(self: &Arc<Self>, state: &mut ChannelState) {
        let generation = state.generation;
        self.phase.send_replace(ChannelPhase::Connecting);
        let inner = self.clone();
        state.connection = Some(tokio::spawn(async move {
            inner.run_connection(generation).await;
        }));
    }

    async fn run_connection(self: Arc<Self>, generation: u64) {
        tracing::info!("connecting push channel {}", self.url);
        if let Err(err) = self.stream_frames(generation).await {
            tracing::warn!("push channel dropped: {}", err);
        }
        self.connection_closed(generation);
    }

    async fn stream_frames(&self, generation: u64) -> Result<()> {
        let (stream, _) = connect_async(self.url.as_str()).await?;
        if !self.mark_open(generation) {
            return Ok(());
        }
        let (mut write, mut read) = stream.split();
        while let Some(message) = read.next().await {
            match message? {
                Message::Text(text) => self.handle_frame(&text),
                Message::Ping(data) => write.send(Message::Pong(data)).await?,
                Message::Close(_) => {
                    tracing::info!("push channel closed by server");
                    break;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn mark_open(&self, generation: u64) -> bool {
        let mut state = self.lock();
        if state.generation != generation {
            return false;
        }
        state.attempt = 0;
        self.phase.send_replace(ChannelPhase::Open);
        tracing::info!("push channel open");
        true
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<PushMessage>(text) {
            Ok(PushMessage::Progress { jobs }) => {
                let applied = self.registry.apply_progress(&jobs);
                tracing::trace!("applied {} of {} progress updates", applied, jobs.len());
            }
            Ok(PushMessage::Other) => {
                tracing::debug!("ignoring push frame: {}", text);
            }
            Err(err) => {
                tracing::warn!("malformed push frame: {} - {}", err, text);
            }
        }
    }

    fn connection_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.connection = None;
        self.phase.send_replace(ChannelPhase::Closed);
        if state.manual_disconnect {
            return;
        }

        let delay = reconnect_delay(state.attempt);
        state.attempt += 1;
        tracing::info!(
            "push channel reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            state.attempt
        );
        let inner = self.clone();
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.reconnect(generation);
        }));
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation || state.manual_disconnect {
            return;
        }
        state.reconnect = None;
        self.start_connection(&mut state);
    }
}
