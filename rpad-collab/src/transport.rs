//! WebSocket transport with reconnect-and-backoff.
//!
//! ```text
//!            spawn (after backoff delay)
//! Transport ───────────────────────────► connection task
//!     ▲  signals (tagged with generation)     │  connect_async
//!     └───────────────────────────────────────┤  reader/writer loop
//!                                             ▼
//!                                          server
//! ```
//!
//! Socket I/O runs in a spawned task; the transport itself is only touched by
//! its owner. Each attempt carries a generation number so signals from a
//! superseded or disposed attempt are dropped.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ReconnectPolicy;
use crate::protocol::{ClientMsg, ProtocolError, ServerMsg};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("transport disposed")]
    Disposed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events surfaced to the transport owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(ServerMsg),
    /// An open connection ended. A reconnect is already scheduled.
    Close(String),
}

#[derive(Debug)]
enum Signal {
    Open(mpsc::UnboundedSender<Message>),
    Message(ServerMsg),
    Close(String),
    /// The attempt never opened.
    Failed(String),
}

/// One logical channel to the session endpoint.
pub struct Transport {
    uri: String,
    policy: ReconnectPolicy,
    /// Consecutive attempts since the last successful open
    attempt: u32,
    generation: u64,
    signal_tx: mpsc::UnboundedSender<(u64, Signal)>,
    signal_rx: mpsc::UnboundedReceiver<(u64, Signal)>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
    disposed: bool,
}

impl Transport {
    pub fn new(uri: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            uri: uri.into(),
            policy,
            attempt: 0,
            generation: 0,
            signal_tx,
            signal_rx,
            outgoing: None,
            task: None,
            disposed: false,
        }
    }

    /// Start connecting now. Must be called inside a tokio runtime.
    pub fn connect(&mut self) {
        if self.disposed {
            return;
        }
        self.spawn_attempt(Duration::ZERO);
    }

    pub fn is_open(&self) -> bool {
        self.outgoing.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Queue a message on the open connection.
    pub fn send(&self, msg: &ClientMsg) -> Result<(), TransportError> {
        if self.disposed {
            return Err(TransportError::Disposed);
        }
        let outgoing = self.outgoing.as_ref().ok_or(TransportError::NotConnected)?;
        let frame = msg.encode()?;
        outgoing
            .send(Message::Text(frame.into()))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Wait for the next event. Returns `None` once disposed.
    ///
    /// Cancel-safe: dropping the future loses no event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            if self.disposed {
                return None;
            }
            let (generation, signal) = self.signal_rx.recv().await?;
            if generation != self.generation || self.disposed {
                continue;
            }
            match signal {
                Signal::Open(outgoing) => {
                    log::info!("Connected to {}", self.uri);
                    self.outgoing = Some(outgoing);
                    self.attempt = 0;
                    return Some(TransportEvent::Open);
                }
                Signal::Message(msg) => return Some(TransportEvent::Message(msg)),
                Signal::Close(reason) => {
                    log::warn!("Connection to {} closed: {reason}", self.uri);
                    self.outgoing = None;
                    self.schedule_reconnect();
                    return Some(TransportEvent::Close(reason));
                }
                Signal::Failed(reason) => {
                    log::debug!("Connection attempt to {} failed: {reason}", self.uri);
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// Close immediately; no further events or reconnects.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.generation += 1;
        // Dropping the sender lets an open connection send its close frame.
        if self.outgoing.take().is_none() {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
        log::debug!("Transport for {} disposed", self.uri);
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        log::info!("Reconnecting to {} in {delay:?}", self.uri);
        self.spawn_attempt(delay);
    }

    fn spawn_attempt(&mut self, delay: Duration) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.outgoing = None;
        self.generation += 1;
        let task = tokio::spawn(run_connection(
            self.uri.clone(),
            delay,
            self.generation,
            self.signal_tx.clone(),
        ));
        self.task = Some(task);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Reports how a connection task ended when it is dropped, including when
/// the task panics.
struct EndReport {
    generation: u64,
    signals: mpsc::UnboundedSender<(u64, Signal)>,
    ending: Option<Signal>,
}

impl EndReport {
    fn new(generation: u64, signals: mpsc::UnboundedSender<(u64, Signal)>) -> Self {
        Self {
            generation,
            signals,
            ending: Some(Signal::Failed("connection task ended".to_string())),
        }
    }

    fn send(&self, signal: Signal) -> bool {
        self.signals.send((self.generation, signal)).is_ok()
    }

    fn set(&mut self, signal: Signal) {
        self.ending = Some(signal);
    }
}

impl Drop for EndReport {
    fn drop(&mut self) {
        if let Some(signal) = self.ending.take() {
            let _ = self.send(signal);
        }
    }
}

async fn run_connection(
    uri: String,
    delay: Duration,
    generation: u64,
    signals: mpsc::UnboundedSender<(u64, Signal)>,
) {
    let mut report = EndReport::new(generation, signals);

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let ws_stream = match tokio_tungstenite::connect_async(&uri).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            report.set(Signal::Failed(e.to_string()));
            return;
        }
    };
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    if !report.send(Signal::Open(out_tx)) {
        return;
    }
    report.set(Signal::Close("connection task ended".to_string()));

    let reason = loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = ws_writer.send(msg).await {
                        break e.to_string();
                    }
                }
                None => {
                    let _ = ws_writer.close().await;
                    break "closed locally".to_string();
                }
            },
            incoming = ws_reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerMsg::decode(text.as_str()) {
                    Ok(msg) => {
                        if !report.send(Signal::Message(msg)) {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed message: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.as_str().to_owned())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                }
                Some(Ok(Message::Binary(_))) => log::warn!("Ignoring unexpected binary frame"),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "connection reset".to_string(),
            },
        }
    };

    report.set(Signal::Close(reason));
}
