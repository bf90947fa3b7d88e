//! Long-lived realtime connection with bounded reconnect.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{decode_event, RealtimeEvent, SseDecoder};
use crate::api::CLIENT_ID_HEADER;
use crate::sync::RetryPolicy;
use crate::util::compact_text;
use crate::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// Raw message payloads read from an open connection.
pub type EventStream = BoxStream<'static, Result<String>>;

/// Opens the transport underneath a [`RealtimeChannel`].
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self, client_id: &str) -> Result<EventStream>;
}

/// Server-sent events over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    url: String,
    client: reqwest::Client,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            client: reqwest::Client::builder().build()?,
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn open(&self, client_id: &str) -> Result<EventStream> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("clientId", client_id)])
            .header(CLIENT_ID_HEADER, client_id)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|error| Error::Network(format!("realtime connect failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Network(format!(
                "realtime endpoint returned {}: {}",
                status.as_u16(),
                compact_text(&body)
            )));
        }

        let mut decoder = SseDecoder::new();
        let frames = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => decoder
                    .push(&bytes)
                    .into_iter()
                    .map(|frame| Ok(frame.data))
                    .collect::<Vec<_>>(),
                Err(error) => vec![Err(Error::Network(format!("realtime stream broke: {error}")))],
            })
            .flat_map(stream::iter);
        Ok(frames.boxed())
    }
}

/// Connection state exposed to the network monitor and status UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// Reconnect budget exhausted; needs an explicit `connect()`
    Failed { attempts: u32, last_error: String },
}

impl ChannelState {
    pub const fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

struct ChannelInner {
    source: Arc<dyn EventSource>,
    client_id: String,
    confirmed_client_id: Mutex<Option<String>>,
    events: broadcast::Sender<RealtimeEvent>,
    state: watch::Sender<ChannelState>,
    backoff: RetryPolicy,
    max_attempts: u32,
}

pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(
        source: Arc<dyn EventSource>,
        client_id: impl Into<String>,
        backoff: RetryPolicy,
        max_attempts: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                source,
                client_id: client_id.into(),
                confirmed_client_id: Mutex::new(None),
                events,
                state,
                backoff,
                max_attempts,
            }),
            task: Mutex::new(None),
        }
    }

    /// Start the connection loop; a no-op while one is already running.
    pub fn connect(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.run().await }));
    }

    pub fn disconnect(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.inner.state.send_replace(ChannelState::Disconnected);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Client id confirmed by the server handshake, if received.
    pub fn confirmed_client_id(&self) -> Option<String> {
        self.inner
            .confirmed_client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl ChannelInner {
    async fn run(&self) {
        let mut failures: u32 = 0;
        loop {
            self.state
                .send_replace(ChannelState::Connecting { attempt: failures });
            let error = match self.source.open(&self.client_id).await {
                Ok(stream) => {
                    failures = 0;
                    self.state.send_replace(ChannelState::Connected);
                    tracing::info!(client_id = %self.client_id, "Realtime channel connected");
                    self.pump(stream).await
                }
                Err(error) => error,
            };

            failures += 1;
            if failures > self.max_attempts {
                tracing::error!(attempts = failures, error = %error, "Realtime reconnect budget exhausted");
                self.state.send_replace(ChannelState::Failed {
                    attempts: failures,
                    last_error: error.to_string(),
                });
                return;
            }

            let delay: Duration = self.backoff.delay_for(failures - 1);
            tracing::warn!(
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Realtime channel lost, reconnecting"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Forward events until the stream ends; returns why it ended.
    async fn pump(&self, mut stream: EventStream) -> Error {
        while let Some(payload) = stream.next().await {
            let payload = match payload {
                Ok(payload) => payload,
                Err(error) => return error,
            };
            match decode_event(&payload) {
                Ok(Some(message)) => {
                    if let RealtimeEvent::Connected { client_id } = &message.event {
                        *self
                            .confirmed_client_id
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(client_id.clone());
                        continue;
                    }
                    if self.is_echo(message.origin_client_id.as_deref()) {
                        tracing::trace!(kind = message.event.kind(), "Skipping own echo");
                        continue;
                    }
                    // No subscribers is fine
                    let _ = self.events.send(message.event);
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "Dropping malformed realtime message");
                }
            }
        }
        Error::Network("realtime stream closed by server".to_string())
    }

    fn is_echo(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return false;
        };
        if origin == self.client_id {
            return true;
        }
        self.confirmed_client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            == Some(origin)
    }
}
