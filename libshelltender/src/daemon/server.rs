// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The client hub. Accepts duplex connections, parses and dispatches
//! control messages, and fans processed output to every client
//! attached to a session. Each client gets a reader thread (parse +
//! dispatch) and a writer thread draining a frame queue, so one slow
//! client can never stall a session producer; a client whose queue
//! blows past the high-water mark gets a lagged notice and is
//! disconnected instead.
//!
//! Admin (supervisor) attachments live in their own map so admin
//! activity never perturbs primary-client bookkeeping, and so a
//! future auth layer can gate the whole admin message family in one
//! place.

use std::{
    collections::{HashMap, HashSet},
    net,
    os::unix::net::{UnixListener, UnixStream},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
};

use anyhow::Context as _;
use crossbeam_channel::{unbounded, Sender};
use shelltender_protocol::{
    AdminMode, ClientMessage, CreateOptions, PatternKind, PatternSpec, ServerMessage,
    SessionDescriptor,
};
use tracing::{debug, error, info, instrument, span, warn, Level};

use super::{
    buffer::BufferStore,
    manager::SessionManager,
    pattern::{AnsiSequenceEvent, PatternEngine, PatternMatchEvent},
    store::SessionStore,
};
use crate::{config, consts, protocol};

const ERR_SESSION_NOT_FOUND: &str = "Session not found";
const ERR_PATTERN_NOT_FOUND: &str = "Pattern not found";
const ERR_SESSION_NOT_RUNNING: &str = "Session not running";
const ERR_NOT_INTERACTIVE: &str = "Session not in interactive mode";
const ERR_NOT_ADMIN_ATTACHED: &str = "Not attached as admin";
const ERR_MESSAGE_TOO_LARGE: &str = "Message too large";
const ERR_READ_ONLY: &str = "Attachment is read-only";

enum OutMsg {
    Frame(Arc<Vec<u8>>),
    Close,
}

/// One connected client. The stream handle is only used for
/// shutdown; all writes go through the frame queue.
struct ClientHandle {
    id: u64,
    stream: UnixStream,
    frames: Sender<OutMsg>,
    queued_bytes: Arc<AtomicUsize>,
}

pub struct Server {
    config: config::Manager,
    manager: Arc<SessionManager>,
    buffers: Arc<BufferStore>,
    patterns: Arc<PatternEngine>,
    store: Arc<SessionStore>,
    clients: Mutex<HashMap<u64, Arc<ClientHandle>>>,
    /// sessionId -> primary clients attached via connect/create.
    attachments: Mutex<HashMap<String, HashSet<u64>>>,
    /// sessionId -> admin clients and their modes.
    admin_attachments: Mutex<HashMap<String, HashMap<u64, AdminMode>>>,
    /// patternId -> (sessionId, owning client). Match events route
    /// only to the client that registered the pattern.
    pattern_owners: Mutex<HashMap<String, (String, u64)>>,
    /// sessionId -> clients that registered an ansi-class pattern and
    /// therefore receive the raw ansi-sequence event stream.
    ansi_subscribers: Mutex<HashMap<String, HashSet<u64>>>,
}

impl Server {
    pub fn new(
        config: config::Manager,
        manager: Arc<SessionManager>,
        buffers: Arc<BufferStore>,
        patterns: Arc<PatternEngine>,
        store: Arc<SessionStore>,
    ) -> Arc<Self> {
        Arc::new(Server {
            config,
            manager,
            buffers,
            patterns,
            store,
            clients: Mutex::new(HashMap::new()),
            attachments: Mutex::new(HashMap::new()),
            admin_attachments: Mutex::new(HashMap::new()),
            pattern_owners: Mutex::new(HashMap::new()),
            ansi_subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// Accept clients forever. Client registration happens here,
    /// synchronously with accept, so the first inbound message always
    /// finds a routing slot.
    #[instrument(skip_all)]
    pub fn serve(server: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    info!("socket got a new connection, cid={}", conn_id);

                    let client = match server.register_client(conn_id, stream) {
                        Ok(c) => c,
                        Err(e) => {
                            error!("registering client {}: {:?}", conn_id, e);
                            continue;
                        }
                    };

                    let server = Arc::clone(&server);
                    thread::Builder::new()
                        .name(format!("client-reader({conn_id})"))
                        .spawn(move || {
                            if let Err(err) = server.handle_conn(&client) {
                                error!("handling client {}: {:?}", conn_id, err);
                            }
                            server.cleanup_client(client.id);
                        })
                        .context("spawning client reader thread")?;
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    fn register_client(&self, conn_id: u64, stream: UnixStream) -> anyhow::Result<Arc<ClientHandle>> {
        let (frames_tx, frames_rx) = unbounded();
        let queued_bytes = Arc::new(AtomicUsize::new(0));

        let client = Arc::new(ClientHandle {
            id: conn_id,
            stream: stream.try_clone().context("cloning client stream")?,
            frames: frames_tx,
            queued_bytes: Arc::clone(&queued_bytes),
        });

        // the writer owns its own clone of the stream; a single
        // writer per client keeps frames whole under concurrent
        // broadcasts
        let mut writer_stream = stream;
        thread::Builder::new()
            .name(format!("client-writer({conn_id})"))
            .spawn(move || {
                let _s = span!(Level::INFO, "client_writer", cid = conn_id).entered();
                use std::io::Write as _;
                for msg in frames_rx.iter() {
                    match msg {
                        OutMsg::Frame(frame) => {
                            let res = writer_stream
                                .write_all(&frame)
                                .and_then(|_| writer_stream.flush());
                            queued_bytes.fetch_sub(frame.len(), Ordering::AcqRel);
                            if let Err(e) = res {
                                if protocol::is_hangup(&e) {
                                    info!("client hangup: {:?}", e);
                                } else {
                                    warn!("writing to client: {:?}", e);
                                }
                                break;
                            }
                        }
                        OutMsg::Close => {
                            let _ = writer_stream.shutdown(net::Shutdown::Both);
                            break;
                        }
                    }
                }
            })
            .context("spawning client writer thread")?;

        self.clients.lock().unwrap().insert(conn_id, Arc::clone(&client));
        Ok(client)
    }

    #[instrument(skip_all, fields(cid = client.id))]
    fn handle_conn(&self, client: &Arc<ClientHandle>) -> anyhow::Result<()> {
        let mut stream = client.stream.try_clone().context("cloning read stream")?;
        loop {
            let frame = match protocol::read_frame(&mut stream) {
                Ok(f) => f,
                Err(err) => {
                    // EOF and peer resets are routine disconnects
                    let is_hangup = err
                        .root_cause()
                        .downcast_ref::<std::io::Error>()
                        .map(protocol::is_hangup)
                        .unwrap_or(false);
                    if !is_hangup {
                        debug!("closing client on read error: {:?}", err);
                    }
                    return Ok(());
                }
            };

            let msg: ClientMessage = match serde_json::from_slice(&frame) {
                Ok(m) => m,
                Err(e) => {
                    // malformed message: reply and keep the
                    // connection open
                    self.send_to(client, &ServerMessage::Error {
                        message: format!("malformed message: {e}"),
                    });
                    continue;
                }
            };

            self.dispatch(client, msg);
        }
    }

    fn dispatch(&self, client: &Arc<ClientHandle>, msg: ClientMessage) {
        match msg {
            ClientMessage::Create { cols, rows, options } => {
                self.handle_create(client, cols, rows, options)
            }
            ClientMessage::Connect { session_id, from_seq } => {
                self.handle_connect(client, &session_id, from_seq)
            }
            ClientMessage::Disconnect { session_id } => {
                self.handle_disconnect(client, &session_id)
            }
            ClientMessage::Input { session_id, data } => {
                self.handle_input(client, &session_id, &data)
            }
            ClientMessage::Resize { session_id, cols, rows } => {
                self.handle_resize(client, &session_id, cols, rows)
            }
            ClientMessage::Kill { session_id } => self.handle_kill(client, &session_id),
            ClientMessage::PatternRegister { session_id, spec } => {
                self.handle_pattern_register(client, &session_id, spec)
            }
            ClientMessage::PatternUnregister { session_id, pattern_id } => {
                self.handle_pattern_unregister(client, &session_id, &pattern_id)
            }
            ClientMessage::AdminListSessions => self.handle_admin_list(client),
            ClientMessage::AdminAttach { session_id, mode } => {
                self.handle_admin_attach(client, &session_id, mode)
            }
            ClientMessage::AdminDetach { session_id } => {
                self.handle_admin_detach(client, &session_id)
            }
            ClientMessage::AdminInput { session_id, data } => {
                self.handle_admin_input(client, &session_id, &data)
            }
        }
    }

    #[instrument(skip_all, fields(cid = client.id))]
    fn handle_create(
        &self,
        client: &Arc<ClientHandle>,
        cols: Option<u16>,
        rows: Option<u16>,
        options: Option<CreateOptions>,
    ) {
        let options = options.unwrap_or_default();
        let cols = cols.unwrap_or(consts::DEFAULT_COLS);
        let rows = rows.unwrap_or(consts::DEFAULT_ROWS);

        match self.manager.create_session(cols, rows, &options) {
            Ok(session) => {
                // the creator is implicitly attached
                self.attach_primary(client.id, &session.id);
                self.send_to(client, &ServerMessage::Created {
                    session_id: session.id.clone(),
                    session,
                });
            }
            Err(e) => {
                self.send_to(client, &ServerMessage::Error { message: e.to_string() });
            }
        }
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_connect(&self, client: &Arc<ClientHandle>, session_id: &str, from_seq: Option<u64>) {
        let session = match self.manager.get_session(session_id) {
            Some(s) => s,
            None => {
                self.send_to(client, &ServerMessage::Error {
                    message: String::from(ERR_SESSION_NOT_FOUND),
                });
                return;
            }
        };

        let (scrollback, last_sequence, truncated) =
            self.attach_scrollback(&session, session_id, from_seq);

        self.attach_primary(client.id, session_id);
        self.manager.touch(session_id);

        self.send_to(client, &ServerMessage::Connect {
            session_id: String::from(session_id),
            session,
            scrollback,
            last_sequence,
            truncated,
        });
    }

    fn handle_disconnect(&self, client: &Arc<ClientHandle>, session_id: &str) {
        // detaching is idempotent: detaching a non-attached client is
        // a no-op, not an error
        let mut attachments = self.attachments.lock().unwrap();
        if let Some(set) = attachments.get_mut(session_id) {
            set.remove(&client.id);
            if set.is_empty() {
                attachments.remove(session_id);
            }
        }
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_input(&self, client: &Arc<ClientHandle>, session_id: &str, data: &str) {
        if data.len() > self.config.get().max_inbound_chunk_bytes() {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_MESSAGE_TOO_LARGE),
            });
            return;
        }

        // a client holding only a read-only admin attachment cannot
        // smuggle input through the primary path
        let read_only_admin = {
            let admins = self.admin_attachments.lock().unwrap();
            admins
                .get(session_id)
                .and_then(|m| m.get(&client.id))
                .map(|mode| *mode == AdminMode::ReadOnly)
                .unwrap_or(false)
        };
        if read_only_admin && !self.is_primary_attached(client.id, session_id) {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_READ_ONLY),
            });
            return;
        }

        self.write_checked(client, session_id, data);
    }

    fn write_checked(&self, client: &Arc<ClientHandle>, session_id: &str, data: &str) {
        if self.manager.get_session(session_id).is_none() {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_FOUND),
            });
            return;
        }
        if !self.manager.write_to_session(session_id, data.as_bytes()) {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_RUNNING),
            });
        }
    }

    fn handle_resize(&self, client: &Arc<ClientHandle>, session_id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            self.send_to(client, &ServerMessage::Error {
                message: String::from("Invalid terminal size"),
            });
            return;
        }
        if self.manager.get_session(session_id).is_none() {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_FOUND),
            });
            return;
        }
        if !self.manager.resize(session_id, cols, rows) {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_RUNNING),
            });
        }
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_kill(&self, client: &Arc<ClientHandle>, session_id: &str) {
        if self.manager.get_session(session_id).is_none() {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_FOUND),
            });
            return;
        }
        if !self.manager.kill_session(session_id) {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_RUNNING),
            });
        }
        // no ack on success; the session-end broadcast is the answer
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_pattern_register(
        &self,
        client: &Arc<ClientHandle>,
        session_id: &str,
        spec: PatternSpec,
    ) {
        if self.manager.get_session(session_id).is_none() {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_SESSION_NOT_FOUND),
            });
            return;
        }

        match self.patterns.register(session_id, &spec) {
            Ok(pattern_id) => {
                self.pattern_owners
                    .lock()
                    .unwrap()
                    .insert(pattern_id.clone(), (String::from(session_id), client.id));
                if let PatternKind::AnsiClass { .. } = spec.kind {
                    self.ansi_subscribers
                        .lock()
                        .unwrap()
                        .entry(String::from(session_id))
                        .or_default()
                        .insert(client.id);
                }
                self.send_to(client, &ServerMessage::PatternRegistered { pattern_id });
            }
            Err(e) => {
                self.send_to(client, &ServerMessage::Error { message: format!("{e:#}") });
            }
        }
    }

    fn handle_pattern_unregister(
        &self,
        client: &Arc<ClientHandle>,
        session_id: &str,
        pattern_id: &str,
    ) {
        if !self.patterns.unregister(session_id, pattern_id) {
            self.send_to(client, &ServerMessage::Error {
                message: String::from(ERR_PATTERN_NOT_FOUND),
            });
            return;
        }
        self.pattern_owners.lock().unwrap().remove(pattern_id);
    }

    fn handle_admin_list(&self, client: &Arc<ClientHandle>) {
        let sessions = self.manager.get_all_sessions();
        self.send_to(client, &ServerMessage::AdminSessionsList { sessions });
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_admin_attach(&self, client: &Arc<ClientHandle>, session_id: &str, mode: AdminMode) {
        let session = match self.manager.get_session(session_id) {
            Some(s) => s,
            None => {
                self.send_to(client, &ServerMessage::Error {
                    message: String::from(ERR_SESSION_NOT_FOUND),
                });
                return;
            }
        };

        {
            // a client holds at most one admin attachment at a time
            let mut admins = self.admin_attachments.lock().unwrap();
            admins.retain(|_, map| {
                map.remove(&client.id);
                !map.is_empty()
            });
            admins.entry(String::from(session_id)).or_default().insert(client.id, mode);
        }

        // admin viewers get the same scrollback a primary would,
        // including the persisted transcript of an exited session
        let (scrollback, last_sequence, truncated) =
            self.attach_scrollback(&session, session_id, None);
        self.send_to(client, &ServerMessage::Connect {
            session_id: String::from(session_id),
            session,
            scrollback,
            last_sequence,
            truncated,
        });
    }

    fn handle_admin_detach(&self, client: &Arc<ClientHandle>, session_id: &str) {
        let mut admins = self.admin_attachments.lock().unwrap();
        if let Some(map) = admins.get_mut(session_id) {
            map.remove(&client.id);
            if map.is_empty() {
                admins.remove(session_id);
            }
        }
    }

    #[instrument(skip_all, fields(cid = client.id, s = session_id))]
    fn handle_admin_input(&self, client: &Arc<ClientHandle>, session_id: &str, data: &str) {
        let mode = {
            let admins = self.admin_attachments.lock().unwrap();
            admins.get(session_id).and_then(|m| m.get(&client.id)).copied()
        };
        match mode {
            None => {
                self.send_to(client, &ServerMessage::Error {
                    message: String::from(ERR_NOT_ADMIN_ATTACHED),
                });
            }
            Some(AdminMode::ReadOnly) => {
                self.send_to(client, &ServerMessage::Error {
                    message: String::from(ERR_NOT_INTERACTIVE),
                });
            }
            Some(AdminMode::Interactive) => {
                if data.len() > self.config.get().max_inbound_chunk_bytes() {
                    self.send_to(client, &ServerMessage::Error {
                        message: String::from(ERR_MESSAGE_TOO_LARGE),
                    });
                    return;
                }
                self.write_checked(client, session_id, data);
            }
        }
    }

    /// Fan one processed chunk out to every attached client, primary
    /// and admin. The frame is serialized exactly once.
    pub fn broadcast_output(&self, session_id: &str, data: &[u8], sequence: u64) {
        let msg = ServerMessage::Output {
            session_id: String::from(session_id),
            data: String::from_utf8_lossy(data).into_owned(),
            sequence,
        };
        let frame = match protocol::to_frame(&msg) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                error!("serializing output frame: {:?}", e);
                return;
            }
        };

        for client in self.recipients(session_id) {
            self.send_frame(&client, Arc::clone(&frame), Some(session_id));
        }
    }

    /// Tell every attached client the session is over, then drop all
    /// of its attachment state.
    pub fn notify_session_end(&self, session_id: &str, code: Option<i32>) {
        let msg =
            ServerMessage::SessionEnd { session_id: String::from(session_id), code };
        let frame = match protocol::to_frame(&msg) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                error!("serializing session-end frame: {:?}", e);
                return;
            }
        };

        for client in self.recipients(session_id) {
            self.send_frame(&client, Arc::clone(&frame), Some(session_id));
        }

        self.attachments.lock().unwrap().remove(session_id);
        self.admin_attachments.lock().unwrap().remove(session_id);
        self.ansi_subscribers.lock().unwrap().remove(session_id);
        self.pattern_owners.lock().unwrap().retain(|_, owner| owner.0 != session_id);
    }

    /// Route a match event to the client that registered the pattern.
    pub fn deliver_pattern_match(&self, ev: &PatternMatchEvent) {
        let client_id = {
            let owners = self.pattern_owners.lock().unwrap();
            match owners.get(&ev.pattern_id) {
                Some((_, client_id)) => *client_id,
                None => return,
            }
        };
        let client = match self.clients.lock().unwrap().get(&client_id).map(Arc::clone) {
            Some(c) => c,
            None => return,
        };

        self.send_to(&client, &ServerMessage::PatternMatch {
            session_id: ev.session_id.clone(),
            pattern_id: ev.pattern_id.clone(),
            name: ev.name.clone(),
            r#match: ev.matched.clone(),
            position: ev.position,
            groups: ev.groups.clone(),
            timestamp: ev.timestamp,
        });
    }

    /// Route an ansi-sequence event to the clients that asked for the
    /// session's ansi stream (by registering an ansi-class pattern).
    pub fn deliver_ansi(&self, ev: &AnsiSequenceEvent) {
        let ids: Vec<u64> = {
            let subs = self.ansi_subscribers.lock().unwrap();
            match subs.get(&ev.session_id) {
                Some(set) => set.iter().copied().collect(),
                None => return,
            }
        };
        let msg = ServerMessage::AnsiSequence {
            session_id: ev.session_id.clone(),
            category: ev.category,
            raw: ev.raw.clone(),
            timestamp: ev.timestamp,
        };
        let frame = match protocol::to_frame(&msg) {
            Ok(f) => Arc::new(f),
            Err(e) => {
                error!("serializing ansi frame: {:?}", e);
                return;
            }
        };

        let handles: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.lock().unwrap();
            ids.iter().filter_map(|id| clients.get(id).map(Arc::clone)).collect()
        };
        for client in handles {
            self.send_frame(&client, Arc::clone(&frame), Some(&ev.session_id));
        }
    }

    /// Ask every connected client's writer to wind down. Called on
    /// daemon shutdown after sessions are dead and flushed.
    pub fn shutdown(&self) {
        let clients: Vec<Arc<ClientHandle>> =
            self.clients.lock().unwrap().values().map(Arc::clone).collect();
        for client in clients {
            let _ = client.frames.send(OutMsg::Close);
        }
    }

    /// Primary plus admin attachment sets for a session, resolved to
    /// live handles. Snapshot under the lock, deliver outside it, so
    /// membership churn never stalls a broadcast.
    fn recipients(&self, session_id: &str) -> Vec<Arc<ClientHandle>> {
        let mut ids: Vec<u64> = vec![];
        {
            let attachments = self.attachments.lock().unwrap();
            if let Some(set) = attachments.get(session_id) {
                ids.extend(set.iter().copied());
            }
        }
        {
            let admins = self.admin_attachments.lock().unwrap();
            if let Some(map) = admins.get(session_id) {
                ids.extend(map.keys().copied());
            }
        }
        ids.sort_unstable();
        ids.dedup();

        let clients = self.clients.lock().unwrap();
        ids.iter().filter_map(|id| clients.get(id).map(Arc::clone)).collect()
    }

    fn is_primary_attached(&self, client_id: u64, session_id: &str) -> bool {
        let attachments = self.attachments.lock().unwrap();
        attachments.get(session_id).map(|set| set.contains(&client_id)).unwrap_or(false)
    }

    /// Scrollback for an attach reply, primary or admin. Live
    /// sessions read the in-memory spool (incrementally when the
    /// caller supplies its last seen sequence); exited sessions fall
    /// back to the persisted transcript, flagged truncated since the
    /// live sequence range is gone.
    fn attach_scrollback(
        &self,
        session: &SessionDescriptor,
        session_id: &str,
        from_seq: Option<u64>,
    ) -> (String, u64, bool) {
        if session.status.is_terminal() {
            return match self.store.get(session_id) {
                Some(record) => (record.buffer, record.last_sequence, true),
                None => (String::new(), 0, true),
            };
        }

        let slice = match from_seq {
            Some(seq) => self.buffers.incremental(session_id, seq),
            None => self.buffers.snapshot(session_id),
        };
        (String::from_utf8_lossy(&slice.data).into_owned(), slice.last_sequence, slice.truncated)
    }

    /// Join the session's primary attachment set. A client is
    /// attached to at most one session at a time, so any previous
    /// attachment is dropped first (attach-as-switch).
    fn attach_primary(&self, client_id: u64, session_id: &str) {
        let mut attachments = self.attachments.lock().unwrap();
        attachments.retain(|_, set| {
            set.remove(&client_id);
            !set.is_empty()
        });
        attachments.entry(String::from(session_id)).or_default().insert(client_id);
    }

    /// Serialize and enqueue a direct reply.
    fn send_to(&self, client: &Arc<ClientHandle>, msg: &ServerMessage) {
        match protocol::to_frame(msg) {
            Ok(frame) => self.send_frame(client, Arc::new(frame), None),
            Err(e) => error!("serializing reply: {:?}", e),
        }
    }

    /// Enqueue a frame onto the client's writer, enforcing the
    /// send-queue high-water mark. Overflowing clients get a lagged
    /// notice and are closed; the producer never blocks.
    fn send_frame(&self, client: &Arc<ClientHandle>, frame: Arc<Vec<u8>>, session_id: Option<&str>) {
        let len = frame.len();
        let queued = client.queued_bytes.load(Ordering::Acquire);
        if queued + len > self.config.get().send_queue_cap_bytes() {
            warn!("client {} lagged ({} bytes queued), disconnecting", client.id, queued);
            let lagged = ServerMessage::Lagged {
                session_id: String::from(session_id.unwrap_or("")),
                dropped_bytes: len as u64,
            };
            if let Ok(lag_frame) = protocol::to_frame(&lagged) {
                let _ = client.frames.send(OutMsg::Frame(Arc::new(lag_frame)));
            }
            let _ = client.frames.send(OutMsg::Close);
            self.cleanup_client(client.id);
            return;
        }

        client.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if client.frames.send(OutMsg::Frame(frame)).is_err() {
            // writer already gone
            self.cleanup_client(client.id);
        }
    }

    /// Remove a client from every routing structure. Sessions are
    /// unaffected; that is the whole point of the daemon.
    fn cleanup_client(&self, client_id: u64) {
        let removed = self.clients.lock().unwrap().remove(&client_id);
        if let Some(client) = &removed {
            let _ = client.frames.send(OutMsg::Close);
            // Only shut the read half here: it unblocks the reader
            // thread immediately, while the writer still drains
            // queued frames (a lagged notice, say) before its Close
            // closes the rest.
            let _ = client.stream.shutdown(net::Shutdown::Read);
        }

        {
            let mut attachments = self.attachments.lock().unwrap();
            attachments.retain(|_, set| {
                set.remove(&client_id);
                !set.is_empty()
            });
        }
        {
            let mut admins = self.admin_attachments.lock().unwrap();
            admins.retain(|_, map| {
                map.remove(&client_id);
                !map.is_empty()
            });
        }
        {
            let mut subs = self.ansi_subscribers.lock().unwrap();
            subs.retain(|_, set| {
                set.remove(&client_id);
                !set.is_empty()
            });
        }
        // orphaned patterns stay registered on the session; they just
        // lose their event consumer
        self.pattern_owners.lock().unwrap().retain(|_, (_, owner)| *owner != client_id);

        if removed.is_some() {
            info!("client {} cleaned up", client_id);
        }
    }
}
