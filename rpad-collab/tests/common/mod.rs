//! In-process sequencing server used by the integration tests.
//!
//! Keeps a single document in memory: every accepted edit is transformed
//! against the history it missed, appended, and broadcast to all peers
//! (the author included) with its history index as revision.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use rpad_collab::config::ReconnectPolicy;
use rpad_collab::editor::{local_changes, BufferEditor, EditorAdapter};
use rpad_collab::protocol::{ClientMsg, ServerMsg, UserInfo, UserOperation};
use rpad_collab::session::{Session, SessionEvent};
use rpad_collab::{SessionConfig, SyncState};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct DocumentState {
    text: String,
    history: Vec<UserOperation>,
    language: Option<String>,
    users: BTreeMap<u64, UserInfo>,
    peers: HashMap<u64, mpsc::UnboundedSender<Message>>,
    next_id: u64,
}

impl DocumentState {
    fn send_to(&self, id: u64, msg: &ServerMsg) {
        if let (Some(peer), Ok(frame)) = (self.peers.get(&id), msg.encode()) {
            let _ = peer.send(Message::Text(frame.into()));
        }
    }

    fn broadcast(&self, msg: &ServerMsg) {
        for id in self.peers.keys() {
            self.send_to(*id, msg);
        }
    }

    fn broadcast_except(&self, except: u64, msg: &ServerMsg) {
        for id in self.peers.keys().filter(|id| **id != except) {
            self.send_to(*id, msg);
        }
    }
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<Mutex<DocumentState>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(DocumentState::default()));

        let shared = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_connection(stream, shared.clone()));
            }
        });

        Self { addr, state, task }
    }

    pub fn origin(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.text.clone()
    }

    pub async fn revision(&self) -> u64 {
        self.state.lock().await.history.len() as u64
    }

    pub async fn language(&self) -> Option<String> {
        self.state.lock().await.language.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Drop every connection; clients are expected to reconnect.
    pub async fn disconnect_all(&self) {
        self.state.lock().await.peers.clear();
    }

    /// Send an arbitrary message to every connected peer.
    pub async fn inject(&self, msg: ServerMsg) {
        self.state.lock().await.broadcast(&msg);
    }

    /// Send a raw text frame to every connected peer.
    pub async fn inject_raw(&self, frame: &str) {
        let s = self.state.lock().await;
        for peer in s.peers.values() {
            let _ = peer.send(Message::Text(frame.to_owned().into()));
        }
    }

    /// Wait until `count` peers are connected.
    pub async fn wait_for_peers(&self, count: usize) {
        timeout(TIMEOUT, async {
            while self.peer_count().await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer count not reached in time");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<Mutex<DocumentState>>) {
    let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let id = {
        let mut s = state.lock().await;
        let id = s.next_id;
        s.next_id += 1;
        s.peers.insert(id, out_tx);

        s.send_to(id, &ServerMsg::Identity { id });
        s.send_to(
            id,
            &ServerMsg::History {
                start_revision: 0,
                operations: s.history.clone(),
            },
        );
        if let Some(language) = &s.language {
            s.send_to(
                id,
                &ServerMsg::LanguageChanged {
                    language: language.clone(),
                },
            );
        }
        for (user_id, info) in &s.users {
            s.send_to(
                id,
                &ServerMsg::UserInfo {
                    id: *user_id,
                    name: info.name.clone(),
                    hue: info.hue,
                },
            );
        }
        id
    };

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => match outgoing {
                Some(msg) => {
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(msg) = ClientMsg::decode(text.as_str()) else {
                        break;
                    };
                    if !handle_message(id, msg, &state).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let mut s = state.lock().await;
    s.peers.remove(&id);
    s.users.remove(&id);
    s.broadcast(&ServerMsg::UserLeft { id });
}

async fn handle_message(id: u64, msg: ClientMsg, state: &Mutex<DocumentState>) -> bool {
    let mut s = state.lock().await;
    match msg {
        ClientMsg::Edit {
            revision,
            operation,
        } => {
            let revision = revision as usize;
            if revision > s.history.len() {
                return false;
            }
            let mut operation = operation;
            for entry in &s.history[revision..] {
                operation = match operation.transform(&entry.operation) {
                    Ok((rebased, _)) => rebased,
                    Err(_) => return false,
                };
            }
            s.text = match operation.apply(&s.text) {
                Ok(text) => text,
                Err(_) => return false,
            };
            let index = s.history.len() as u64;
            s.history.push(UserOperation {
                id,
                operation: operation.clone(),
            });
            s.broadcast(&ServerMsg::Edit {
                id,
                revision: index,
                operation,
            });
        }
        ClientMsg::ClientInfo(info) => {
            s.broadcast(&ServerMsg::UserInfo {
                id,
                name: info.name.clone(),
                hue: info.hue,
            });
            s.users.insert(id, info);
        }
        ClientMsg::ChangeLanguage { language } => {
            s.language = Some(language.clone());
            s.broadcast(&ServerMsg::LanguageChanged { language });
        }
        ClientMsg::CursorData(data) => {
            s.broadcast_except(id, &ServerMsg::UserCursor { id, data });
        }
    }
    true
}

pub fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        multiplier: 2,
    }
}

pub type TestSession = Session<BufferEditor>;

pub fn open_session(
    origin: &str,
) -> (TestSession, mpsc::UnboundedReceiver<SessionEvent>) {
    let (reporter, changes) = local_changes();
    let config = SessionConfig::for_document(origin, "test").with_reconnect(fast_policy());
    Session::new(config, BufferEditor::new(reporter), changes)
}

/// Step `session` until `done` holds.
pub async fn drive_until<E, F>(session: &mut Session<E>, mut done: F)
where
    E: EditorAdapter,
    F: FnMut(&Session<E>) -> bool,
{
    timeout(TIMEOUT, async {
        while !done(session) {
            if !session.step().await {
                break;
            }
        }
    })
    .await
    .expect("session did not reach the expected state in time");
    assert!(done(session), "session stopped before reaching the expected state");
}

/// Step `session` until it publishes an event matching `pred`.
pub async fn wait_for_event<E, F>(
    session: &mut Session<E>,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut pred: F,
) -> SessionEvent
where
    E: EditorAdapter,
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(TIMEOUT, async {
        loop {
            while let Ok(event) = events.try_recv() {
                if pred(&event) {
                    return event;
                }
            }
            if !session.step().await {
                // Events emitted by the final step are still queued.
                while let Ok(event) = events.try_recv() {
                    if pred(&event) {
                        return event;
                    }
                }
                panic!("session stopped before publishing the expected event");
            }
        }
    })
    .await
    .expect("event not published in time")
}

/// Step `session` until it is synchronized, every local edit is
/// acknowledged and the editor shows the confirmed document.
pub async fn settle<E: EditorAdapter>(session: &mut Session<E>) {
    drive_until(session, |s| {
        s.engine().state() == SyncState::Synchronized
            && s.engine().outstanding().is_none()
            && s.engine().document() == s.editor().text()
    })
    .await;
}
