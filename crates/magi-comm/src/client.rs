//! Engine-side controller channel: a reconnecting WebSocket client with
//! queued delivery.
//!
//! Outbound events are queued while disconnected and flushed in order on
//! reconnect, before any new live event.  The handshake `connect` message
//! carries the controller port; a changed port triggers reconnection to the
//! new one.  In test mode no socket is opened and events go to stdout.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    console::ConsolePrinter,
    persist::MessageLog,
    protocol::{ControllerMessage, EngineEvent, EngineFrame},
};

type WsStream = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CommClientConfig {
    pub process_id: String,
    pub controller_host: String,
    pub controller_port: u16,
    /// Pause between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Disable the socket entirely; pretty-print events to stdout instead.
    pub test_mode: bool,
}

impl CommClientConfig {
    pub fn new(process_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            process_id: process_id.into(),
            controller_host: host.into(),
            controller_port: port,
            reconnect_delay: RECONNECT_DELAY,
            test_mode: false,
        }
    }
}

/// Handle for emitting events toward the controller.  Cheap to clone.
#[derive(Clone)]
pub struct CommClient {
    outbound: mpsc::UnboundedSender<EngineEvent>,
    connected: watch::Receiver<bool>,
}

impl CommClient {
    /// Spawn the connection task.  Returns the client handle and the stream
    /// of inbound controller messages.
    pub fn start(
        config: CommClientConfig,
        log: Option<Arc<MessageLog>>,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        // Test mode never opens a socket; report it as nominally connected
        // so disconnect watchdogs stay quiet.
        let (connected_tx, connected_rx) = watch::channel(config.test_mode);
        tokio::spawn(run(config, log, outbound_rx, inbound_tx, connected_tx));
        (
            Self {
                outbound: outbound_tx,
                connected: connected_rx,
            },
            inbound_rx,
        )
    }

    /// Queue an event for delivery.  Never blocks; delivery order is
    /// preserved across disconnects.
    pub fn send(&self, event: impl Into<EngineEvent>) {
        let _ = self.outbound.send(event.into());
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connection state changes (true = connected).
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }
}

async fn run(
    config: CommClientConfig,
    log: Option<Arc<MessageLog>>,
    mut outbound_rx: mpsc::UnboundedReceiver<EngineEvent>,
    inbound_tx: mpsc::UnboundedSender<ControllerMessage>,
    connected_tx: watch::Sender<bool>,
) {
    let persist = |event: &EngineEvent| {
        if let Some(log) = &log {
            log.append(event);
        }
    };

    if config.test_mode {
        let mut printer = ConsolePrinter::new();
        while let Some(event) = outbound_rx.recv().await {
            persist(&event);
            printer.print(&event);
        }
        return;
    }

    let mut queue: VecDeque<EngineFrame> = VecDeque::new();
    let mut port = config.controller_port;

    loop {
        let url = format!(
            "ws://{}:{}/ws/engine/{}",
            config.controller_host, port, config.process_id
        );
        let mut ws = match connect_async(&url).await {
            Ok((ws, _)) => {
                let _ = connected_tx.send(true);
                ws
            }
            Err(e) => {
                debug!(url = %url, "controller connect failed: {e}");
                let _ = connected_tx.send(false);
                // Keep accepting outbound events during the backoff so the
                // queue preserves emission order.
                if !buffer_during(
                    config.reconnect_delay,
                    &config.process_id,
                    &mut outbound_rx,
                    &mut queue,
                    &persist,
                )
                .await
                {
                    return;
                }
                continue;
            }
        };
        info!(url = %url, queued = queue.len(), "connected to controller");

        // Announce the (re)connection, then flush the backlog in order
        // before any new live message.
        let hello = EngineFrame {
            process_id: config.process_id.clone(),
            event: magi_model::StreamEvent::metadata(
                Some("connected".into()),
                serde_json::json!({ "queued": queue.len() }),
            )
            .into(),
        };
        match serde_json::to_string(&hello) {
            Ok(json) => {
                if ws.send(WsMessage::Text(json)).await.is_err() {
                    continue;
                }
            }
            Err(e) => warn!("unserializable hello frame: {e}"),
        }

        let mut flush_ok = true;
        while let Some(frame) = queue.front() {
            let json = match serde_json::to_string(frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!("dropping unserializable frame: {e}");
                    queue.pop_front();
                    continue;
                }
            };
            if ws.send(WsMessage::Text(json)).await.is_err() {
                flush_ok = false;
                break;
            }
            queue.pop_front();
        }
        if !flush_ok {
            continue;
        }

        let exit = bridge(
            &mut ws,
            &config.process_id,
            &mut outbound_rx,
            &inbound_tx,
            &mut queue,
            &persist,
            port,
        )
        .await;
        let _ = connected_tx.send(false);
        match exit {
            BridgeExit::Reconnect => {}
            BridgeExit::PortChange(new_port) => {
                info!(old = port, new = new_port, "controller port changed, reconnecting");
                port = new_port;
            }
            BridgeExit::Shutdown => return,
        }
    }
}

enum BridgeExit {
    Reconnect,
    PortChange(u16),
    Shutdown,
}

/// Accept outbound events for `delay`, queuing them.  Returns false when the
/// outbound channel closed (engine shutting down).
async fn buffer_during(
    delay: Duration,
    process_id: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    queue: &mut VecDeque<EngineFrame>,
    persist: &impl Fn(&EngineEvent),
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            event = outbound_rx.recv() => match event {
                Some(event) => {
                    persist(&event);
                    queue.push_back(EngineFrame {
                        process_id: process_id.to_string(),
                        event,
                    });
                }
                None => return false,
            },
        }
    }
}

async fn bridge(
    ws: &mut WsStream,
    process_id: &str,
    outbound_rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    inbound_tx: &mpsc::UnboundedSender<ControllerMessage>,
    queue: &mut VecDeque<EngineFrame>,
    persist: &impl Fn(&EngineEvent),
    current_port: u16,
) -> BridgeExit {
    loop {
        tokio::select! {
            event = outbound_rx.recv() => {
                let Some(event) = event else {
                    let _ = ws.close(None).await;
                    return BridgeExit::Shutdown;
                };
                persist(&event);
                let frame = EngineFrame {
                    process_id: process_id.to_string(),
                    event,
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unserializable frame: {e}");
                        continue;
                    }
                };
                if ws.send(WsMessage::Text(json)).await.is_err() {
                    // The frame did not go out; keep it for the flush.
                    queue.push_back(frame);
                    return BridgeExit::Reconnect;
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ControllerMessage>(&text) {
                            Ok(msg) => {
                                let port_change = match &msg {
                                    ControllerMessage::Connect { controller_port, .. }
                                        if *controller_port != current_port =>
                                    {
                                        Some(*controller_port)
                                    }
                                    _ => None,
                                };
                                let _ = inbound_tx.send(msg);
                                if let Some(new_port) = port_change {
                                    return BridgeExit::PortChange(new_port);
                                }
                            }
                            Err(e) => warn!("unknown controller frame ignored: {e}"),
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = ws.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return BridgeExit::Reconnect,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("controller socket error: {e}");
                        return BridgeExit::Reconnect;
                    }
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
