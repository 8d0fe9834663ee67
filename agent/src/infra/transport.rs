//! Coordinator channel transport: implements `MessageSink` and
//! `MessageSource` over reconnecting Noise connections.
//!
//! Each channel owns one background connection task. The task reconnects on
//! a fixed interval, reports every transition as a [`LinkEvent`], and only
//! ends when its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use hive_common::channel::{CONNECT_TIMEOUT_MS, RECONNECT_INTERVAL_MS, SUBSCRIBE};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{LinkEvent, MessageSink, MessageSource};
use crate::infra::keys::ChannelKeys;
use crate::infra::noise::{MAX_LINE_LEN, NoiseStream};

/// Lines accepted by `send` while the link is down.
pub const SEND_QUEUE_CAPACITY: usize = 1024;

/// Filtered inbound lines not yet taken by the processor.
pub const RECEIVE_QUEUE_CAPACITY: usize = 256;

const LINK_EVENT_CAPACITY: usize = 16;

/// How long `close` waits for the connection task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect and connect-attempt timing.
#[derive(Debug, Clone, Copy)]
pub struct LinkTiming {
    pub reconnect_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(RECONNECT_INTERVAL_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
        }
    }
}

/// Turn a `tcp://host:port` endpoint into a connectable address.
///
/// # Errors
///
/// Returns an error for other schemes or a missing port.
pub fn socket_address(endpoint: &str) -> Result<String> {
    let address = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => bail!("unsupported endpoint scheme '{scheme}' in {endpoint}"),
        None => endpoint,
    };
    let address = address.trim_end_matches('/');
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(address.to_string())
        }
        _ => bail!("endpoint {endpoint} must be host:port"),
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Agent → coordinator channel.
pub struct OutboundChannel {
    queue: mpsc::Sender<String>,
    endpoint: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl OutboundChannel {
    /// Start connecting to `endpoint` in the background.
    ///
    /// # Errors
    ///
    /// Returns an error only for a malformed endpoint; connection failures
    /// are retried forever.
    pub fn connect(
        endpoint: &str,
        keys: Arc<ChannelKeys>,
        shutdown: CancellationToken,
    ) -> Result<(Self, broadcast::Receiver<LinkEvent>)> {
        Self::connect_with(endpoint, keys, shutdown, LinkTiming::default())
    }

    /// [`OutboundChannel::connect`] with explicit timing.
    ///
    /// # Errors
    ///
    /// See [`OutboundChannel::connect`].
    pub fn connect_with(
        endpoint: &str,
        keys: Arc<ChannelKeys>,
        shutdown: CancellationToken,
        timing: LinkTiming,
    ) -> Result<(Self, broadcast::Receiver<LinkEvent>)> {
        let address = socket_address(endpoint)?;
        let (queue, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (events, link_rx) = broadcast::channel(LINK_EVENT_CAPACITY);
        let link = Connector {
            address,
            keys,
            events,
            timing,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(run_outbound(link, rx));
        Ok((
            Self {
                queue,
                endpoint: endpoint.to_string(),
                shutdown,
                task,
            },
            link_rx,
        ))
    }

    /// Stop the connection task and wait for it.
    pub async fn close(self) {
        close_task(&self.endpoint, &self.shutdown, self.task).await;
    }
}

#[async_trait]
impl MessageSink for OutboundChannel {
    async fn send(&self, line: String) -> Result<()> {
        if line.len() > MAX_LINE_LEN {
            bail!(
                "message of {} bytes exceeds the {MAX_LINE_LEN}-byte frame limit",
                line.len()
            );
        }
        self.queue
            .send(line)
            .await
            .map_err(|_| anyhow!("channel to {} is closed", self.endpoint))
    }
}

async fn run_outbound(link: Connector, mut queue: mpsc::Receiver<String>) {
    // A line whose write failed gets exactly one more attempt.
    let mut pending: Option<String> = None;
    while let Some(mut stream) = link.establish().await {
        link.report(LinkEvent::Connected);
        let lost = pump_outbound(&mut stream, &mut queue, &mut pending, &link.shutdown).await;
        let Some(reason) = lost else { break };
        link.report(LinkEvent::Disconnected);
        debug!(address = %link.address, error = %format!("{reason:#}"), "outbound link lost");
        if !link.pause().await {
            break;
        }
    }
    debug!(address = %link.address, "outbound connection task exiting");
}

/// Drain the send queue into one connection. Returns the failure when the
/// connection is lost, `None` on shutdown or when every sender is gone.
async fn pump_outbound(
    stream: &mut NoiseStream,
    queue: &mut mpsc::Receiver<String>,
    pending: &mut Option<String>,
    shutdown: &CancellationToken,
) -> Option<anyhow::Error> {
    if let Some(line) = pending.take() {
        if let Err(e) = stream.send(&line).await {
            warn!(error = %format!("{e:#}"), "dropping message after failed retry");
            return Some(e);
        }
    }
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return None,
            e = stream.closed() => return Some(anyhow!(e).context("peer closed the link")),
            line = queue.recv() => {
                let line = line?;
                if let Err(e) = stream.send(&line).await {
                    *pending = Some(line);
                    return Some(e);
                }
            }
        }
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Coordinator → agent channel, subscribed to one topic prefix.
pub struct InboundChannel {
    queue: mpsc::Receiver<String>,
    endpoint: String,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl InboundChannel {
    /// Start connecting to `endpoint` and subscribe to `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error only for a malformed endpoint.
    pub fn connect(
        endpoint: &str,
        keys: Arc<ChannelKeys>,
        filter: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, broadcast::Receiver<LinkEvent>)> {
        Self::connect_with(endpoint, keys, filter, shutdown, LinkTiming::default())
    }

    /// [`InboundChannel::connect`] with explicit timing.
    ///
    /// # Errors
    ///
    /// See [`InboundChannel::connect`].
    pub fn connect_with(
        endpoint: &str,
        keys: Arc<ChannelKeys>,
        filter: &str,
        shutdown: CancellationToken,
        timing: LinkTiming,
    ) -> Result<(Self, broadcast::Receiver<LinkEvent>)> {
        let address = socket_address(endpoint)?;
        let (tx, queue) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (events, link_rx) = broadcast::channel(LINK_EVENT_CAPACITY);
        let link = Connector {
            address,
            keys,
            events,
            timing,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(run_inbound(link, filter.to_string(), tx));
        Ok((
            Self {
                queue,
                endpoint: endpoint.to_string(),
                shutdown,
                task,
            },
            link_rx,
        ))
    }

    /// Next line, or `Err` if none arrived within `poll`. `Ok(None)` once
    /// the channel is closed.
    ///
    /// # Errors
    ///
    /// Returns [`Elapsed`] when the poll interval passes without a line.
    pub async fn receive_timeout(&mut self, poll: Duration) -> Result<Option<String>, Elapsed> {
        tokio::time::timeout(poll, self.queue.recv()).await
    }

    /// Stop the connection task and wait for it.
    pub async fn close(self) {
        close_task(&self.endpoint, &self.shutdown, self.task).await;
    }
}

#[async_trait]
impl MessageSource for InboundChannel {
    async fn recv(&mut self) -> Option<String> {
        self.queue.recv().await
    }
}

async fn run_inbound(link: Connector, filter: String, tx: mpsc::Sender<String>) {
    while let Some(mut stream) = link.establish().await {
        let subscribed = stream
            .send(&format!("{SUBSCRIBE} {filter}"))
            .await
            .context("subscribing");
        let lost = match subscribed {
            Ok(()) => {
                link.report(LinkEvent::Connected);
                let lost = pump_inbound(&mut stream, &filter, &tx, &link.shutdown).await;
                let Some(reason) = lost else { break };
                link.report(LinkEvent::Disconnected);
                reason
            }
            Err(e) => e,
        };
        debug!(address = %link.address, error = %format!("{lost:#}"), "inbound link lost");
        if !link.pause().await {
            break;
        }
    }
    debug!(address = %link.address, "inbound connection task exiting");
}

/// Forward matching lines until the connection is lost (returns the cause)
/// or shutdown / receiver drop (returns `None`).
async fn pump_inbound(
    stream: &mut NoiseStream,
    filter: &str,
    tx: &mpsc::Sender<String>,
    shutdown: &CancellationToken,
) -> Option<anyhow::Error> {
    loop {
        let received = tokio::select! {
            biased;
            () = shutdown.cancelled() => return None,
            received = stream.recv() => received,
        };
        match received {
            Ok(Some(line)) if line.starts_with(filter) => {
                if tx.send(line).await.is_err() {
                    return None;
                }
            }
            Ok(Some(line)) => {
                debug!(len = line.len(), "dropping line outside subscription");
            }
            Ok(None) => return Some(anyhow!("peer closed the link")),
            Err(e) => return Some(e),
        }
    }
}

// ── Connection management ─────────────────────────────────────────────────────

struct Connector {
    address: String,
    keys: Arc<ChannelKeys>,
    events: broadcast::Sender<LinkEvent>,
    timing: LinkTiming,
    shutdown: CancellationToken,
}

impl Connector {
    /// Connect and handshake, retrying until it works. `None` on shutdown.
    async fn establish(&self) -> Option<NoiseStream> {
        loop {
            let attempt = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                attempt = tokio::time::timeout(self.timing.connect_timeout, self.attempt()) => attempt,
            };
            match attempt {
                Ok(Ok(stream)) => {
                    info!(address = %self.address, "link established");
                    return Some(stream);
                }
                Ok(Err(e)) => {
                    debug!(address = %self.address, error = %format!("{e:#}"), "connect failed");
                }
                Err(_) => debug!(address = %self.address, "connect timed out"),
            }
            if !self.pause().await {
                return None;
            }
        }
    }

    async fn attempt(&self) -> Result<NoiseStream> {
        let stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to {}", self.address))?;
        stream.set_nodelay(true).ok();
        NoiseStream::initiate(stream, &self.keys).await
    }

    /// Wait out the reconnect interval. `false` if shutdown came first.
    async fn pause(&self) -> bool {
        debug!(
            address = %self.address,
            "reconnecting in {}ms",
            self.timing.reconnect_interval.as_millis()
        );
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(self.timing.reconnect_interval) => true,
        }
    }

    fn report(&self, event: LinkEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

async fn close_task(endpoint: &str, shutdown: &CancellationToken, task: JoinHandle<()>) {
    shutdown.cancel();
    let abort = task.abort_handle();
    if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
        warn!(%endpoint, "connection task did not stop, aborting");
        abort.abort();
    }
}
