use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use bytes::Bytes;
use ffmpeg_bus::{
    fmp4::{FragmentedOutput, SegmentSink},
    output::Muxer,
    packet::CodedPacket,
    params::StreamParameters,
};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const SEGMENT_BACKLOG: usize = 256;

/// First message a viewer gets after joining.
#[derive(Debug, Clone, PartialEq)]
pub enum Greeting {
    Init(Bytes),
    Capability(String),
}

#[derive(Default)]
struct Cached {
    init: Option<Bytes>,
    capability: Option<String>,
}

/// Broadcasts fMP4 segments to every connected viewer and replays the latest
/// initialization segment to late joiners.
pub struct FanoutHub {
    name: String,
    cached: RwLock<Cached>,
    tx: broadcast::Sender<Bytes>,
}

impl FanoutHub {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(SEGMENT_BACKLOG);
        Self {
            name: name.into(),
            cached: RwLock::new(Cached::default()),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn viewers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stores the capability record sent to viewers that join before any init segment.
    pub fn set_parameters(&self, params: &StreamParameters) {
        let record = serde_json::json!({
            "mime": "video/mp4",
            "codecs": params.codec_string(),
            "width": params.width,
            "height": params.height,
        })
        .to_string();
        match self.cached.write() {
            Ok(mut cached) => cached.capability = Some(record),
            Err(e) => log::error!(target: "fanout", "{}: cache poisoned: {}", self.name, e),
        }
    }

    /// Subscribes a viewer. The greeting and the subscription are taken under the
    /// same lock as init publication, so a viewer never misses an init segment.
    pub fn join(&self) -> (broadcast::Receiver<Bytes>, Option<Greeting>) {
        let cached = match self.cached.read() {
            Ok(cached) => cached,
            Err(poisoned) => poisoned.into_inner(),
        };
        let greeting = match (&cached.init, &cached.capability) {
            (Some(init), _) => Some(Greeting::Init(init.clone())),
            (None, Some(capability)) => Some(Greeting::Capability(capability.clone())),
            (None, None) => None,
        };
        (self.tx.subscribe(), greeting)
    }
}

impl SegmentSink for FanoutHub {
    fn init_segment(&self, segment: Bytes) {
        let mut cached = match self.cached.write() {
            Ok(cached) => cached,
            Err(poisoned) => poisoned.into_inner(),
        };
        log::info!(
            target: "fanout",
            "{}: init segment of {} bytes, {} viewers",
            self.name,
            segment.len(),
            self.tx.receiver_count()
        );
        cached.init = Some(segment.clone());
        // no receivers is not an error
        let _ = self.tx.send(segment);
    }

    fn media_segment(&self, segment: Bytes) {
        let _ = self.tx.send(segment);
    }
}

/// Fragmented MP4 muxer that publishes into a [`FanoutHub`].
pub struct FanoutMuxer {
    hub: Arc<FanoutHub>,
    inner: FragmentedOutput,
}

impl FanoutMuxer {
    pub fn new(hub: Arc<FanoutHub>) -> Self {
        let inner = FragmentedOutput::new(hub.clone());
        Self { hub, inner }
    }
}

impl Muxer for FanoutMuxer {
    fn open(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        self.hub.set_parameters(params);
        self.inner.open(params)
    }

    fn write_header(&mut self, params: &StreamParameters) -> anyhow::Result<()> {
        // headers may have been recovered since open
        self.hub.set_parameters(params);
        self.inner.write_header(params)
    }

    fn write_packet(&mut self, packet: &CodedPacket) -> anyhow::Result<()> {
        self.inner.write_packet(packet)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.inner.close()
    }
}

#[derive(Clone)]
struct FanoutState {
    hub: Arc<FanoutHub>,
    cancel: CancellationToken,
}

/// WebSocket endpoint of one fan-out output. Every path upgrades to the same stream.
pub struct FanoutServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FanoutServer {
    pub async fn bind(
        port: u16,
        hub: Arc<FanoutHub>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| anyhow::anyhow!("fan-out bind port {}: {}", port, e))?;
        let local_addr = listener.local_addr()?;
        let name = hub.name().to_string();
        let app = Router::new().fallback(ws_handler).with_state(FanoutState {
            hub,
            cancel: cancel.clone(),
        });

        let shutdown = cancel.clone().cancelled_owned();
        let handle = tokio::spawn(async move {
            log::info!(target: "fanout", "{}: listening on {}", name, local_addr);
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                log::error!(target: "fanout", "{}: server error: {}", name, e);
            }
            log::info!(target: "fanout", "{}: server stopped", name);
        });

        Ok(Self {
            local_addr,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                log::warn!(target: "fanout", "{}: server did not stop in time", self.local_addr);
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<FanoutState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, state))
}

async fn serve_viewer(socket: WebSocket, state: FanoutState) {
    let FanoutState { hub, cancel } = state;
    let (mut rx, greeting) = hub.join();
    log::info!(target: "fanout", "{}: viewer joined, {} connected", hub.name(), hub.viewers());

    let (mut sender, mut receiver) = socket.split();
    let first = match greeting {
        Some(Greeting::Init(init)) => Some(Message::Binary(init)),
        Some(Greeting::Capability(record)) => Some(Message::Text(record.into())),
        None => None,
    };
    let mut open = match first {
        Some(message) => sender.send(message).await.is_ok(),
        None => true,
    };

    while open {
        tokio::select! {
            _ = cancel.cancelled() => break,
            segment = rx.recv() => match segment {
                Ok(segment) => open = sender.send(Message::Binary(segment)).await.is_ok(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(target: "fanout", "{}: viewer lagging, skipped {} segments", hub.name(), skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sender.close().await;
    drop(rx);
    log::info!(target: "fanout", "{}: viewer left, {} connected", hub.name(), hub.viewers());
}
