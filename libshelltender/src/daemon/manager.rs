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

//! The session manager: the central coordinator that owns every live
//! session. It launches pty children, routes input to them, tracks
//! lifecycle state, and fans raw output and exit notifications out to
//! whoever subscribed (in practice: the pipeline wiring and the hub).

use std::{
    collections::HashMap,
    ffi::OsString,
    fmt, fs,
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Instant,
};

use anyhow::Context as _;
use shelltender_protocol::{
    CreateOptions, PersistedSession, SessionDescriptor, SessionStatus,
};
use tracing::{info, instrument, span, warn, Level};

use super::{pty, store::SessionStore, unix_ms};
use crate::{
    config, consts,
    events::{Notifier, Subscription},
    user,
};

const DEFAULT_INITIAL_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
const DEFAULT_TERM: &str = "xterm-256color";

/// A chunk of raw pty output, pre-pipeline.
#[derive(Debug, Clone)]
pub struct PtyChunk {
    pub session_id: String,
    pub data: Vec<u8>,
    /// Milliseconds since the session started.
    pub timestamp_ms: u64,
}

/// A session's child process is gone.
#[derive(Debug, Clone)]
pub struct SessionEnd {
    pub session_id: String,
    pub code: Option<i32>,
}

/// Why a create call was refused. The hub maps these onto wire error
/// replies; embedders can match on them directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    /// The caller-supplied id names an existing session (live or
    /// retained). Never reattach, never overwrite.
    IdCollision(String),
    /// The id is unusable (empty or not filesystem safe).
    InvalidId(String),
    /// The pty child could not be launched. No session record comes
    /// into existence.
    SpawnFailed(String),
}

impl fmt::Display for CreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateError::IdCollision(id) => write!(f, "Session {id} already exists"),
            CreateError::InvalidId(id) => write!(f, "Invalid session id '{id}'"),
            CreateError::SpawnFailed(msg) => write!(f, "Failed to spawn session: {msg}"),
        }
    }
}

impl std::error::Error for CreateError {}

/// One live session. Owns its pty exclusively.
pub struct Session {
    pub id: String,
    pty: pty::Pty,
    started: Instant,
    descriptor: Mutex<SessionDescriptor>,
    kill_requested: AtomicBool,
    /// Only wrapped in an option so the thread can be spawned after
    /// constructing the session; the end watcher takes it to join.
    reader: Mutex<Option<thread::JoinHandle<anyhow::Result<()>>>>,
}

impl Session {
    pub fn descriptor(&self) -> SessionDescriptor {
        self.descriptor.lock().unwrap().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.descriptor.lock().unwrap().status
    }

    /// Milliseconds since this session's pty was launched.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.descriptor.lock().unwrap().last_accessed_at = unix_ms();
    }
}

pub struct SessionManager {
    config: config::Manager,
    store: Arc<SessionStore>,
    user_info: user::Info,
    /// A map from session ids to live session handles. Lookups clone
    /// the Arc and drop the table lock before touching the session,
    /// so slow pty operations never block unrelated sessions.
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    data: Notifier<PtyChunk>,
    ended: Notifier<SessionEnd>,
}

impl SessionManager {
    pub fn new(config: config::Manager, store: Arc<SessionStore>) -> anyhow::Result<Self> {
        let user_info = user::info().context("resolving user info")?;
        Ok(SessionManager {
            config,
            store,
            user_info,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            data: Notifier::new(),
            ended: Notifier::new(),
        })
    }

    pub fn on_data(&self, cb: impl Fn(&PtyChunk) + Send + Sync + 'static) -> Subscription {
        self.data.subscribe(cb)
    }

    pub fn on_session_end(
        &self,
        cb: impl Fn(&SessionEnd) + Send + Sync + 'static,
    ) -> Subscription {
        self.ended.subscribe(cb)
    }

    /// Create and start a session. On success the session is
    /// `running` and its output is already flowing to subscribers.
    #[instrument(skip_all)]
    pub fn create_session(
        &self,
        cols: u16,
        rows: u16,
        options: &CreateOptions,
    ) -> Result<SessionDescriptor, CreateError> {
        let id = match &options.id {
            Some(id) => {
                if !id_is_valid(id) {
                    return Err(CreateError::InvalidId(id.clone()));
                }
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        // Check both the live table and retained records: an exited
        // session keeps its transcript until deleted, and a new
        // session must not clobber it.
        {
            let sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(&id) || self.store.get(&id).is_some() {
                return Err(CreateError::IdCollision(id));
            }
        }

        let (command, args, login_shell) = self.resolve_command(options)?;
        let cols = cols.max(1);
        let rows = rows.max(1);

        let spec = pty::LaunchSpec {
            command: command.clone(),
            args: args.clone(),
            cwd: options.cwd.clone(),
            env: self.build_session_env(&id, options),
            cols,
            rows,
            login_shell,
            noecho: self.config.get().noecho.unwrap_or(false),
        };

        info!("launching session {} running {}", id, command);
        let pty = pty::spawn(&spec).map_err(|e| CreateError::SpawnFailed(format!("{e:#}")))?;

        let now = unix_ms();
        let descriptor = SessionDescriptor {
            id: id.clone(),
            command,
            args,
            cwd: options.cwd.clone(),
            env: options.env.clone(),
            cols,
            rows,
            created_at: now,
            last_accessed_at: now,
            title: options.title.clone(),
            restrictions: options.restrictions.clone(),
            status: SessionStatus::Running,
        };

        let session = Arc::new(Session {
            id: id.clone(),
            pty,
            started: Instant::now(),
            descriptor: Mutex::new(descriptor.clone()),
            kill_requested: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            let mut sessions = self.sessions.lock().unwrap();
            // the collision check above raced against nothing only if
            // we re-check under the same lock we insert under
            if sessions.contains_key(&id) {
                return Err(CreateError::IdCollision(id));
            }
            sessions.insert(id.clone(), Arc::clone(&session));
        }

        self.store.put(PersistedSession {
            session: descriptor.clone(),
            buffer: String::new(),
            last_sequence: 0,
        });

        self.spawn_reader(&session);
        self.spawn_end_watcher(&session);

        Ok(descriptor)
    }

    fn spawn_reader(&self, session: &Arc<Session>) {
        let data = self.data.clone();
        let reader_session = Arc::clone(session);
        let spawned = session.pty.spawn_reader(&session.id, move |chunk| {
            data.emit(&PtyChunk {
                session_id: reader_session.id.clone(),
                data: chunk.to_vec(),
                timestamp_ms: reader_session.elapsed_ms(),
            });
        });
        match spawned {
            Ok(handle) => {
                *session.reader.lock().unwrap() = Some(handle);
            }
            Err(e) => warn!("could not spawn reader for {}: {:?}", session.id, e),
        }
    }

    fn spawn_end_watcher(&self, session: &Arc<Session>) {
        let exit_notifier = session.pty.exit_notifier();
        let watched = Arc::clone(session);
        let store = Arc::clone(&self.store);
        let ended = self.ended.clone();
        let spawned = thread::Builder::new()
            .name(format!("end-watcher({})", session.id))
            .spawn(move || {
                let code = exit_notifier.wait(None).unwrap_or(1);

                let status = if watched.kill_requested.load(Ordering::Acquire) {
                    SessionStatus::Killed
                } else {
                    SessionStatus::Exited(code)
                };
                watched.descriptor.lock().unwrap().status = status;
                store.update_status(&watched.id, status);
                info!("session {} ended: {}", watched.id, status);

                // The reader drains whatever output is left and exits
                // on its own once the child is gone. Joining it before
                // emitting keeps the guarantee that clients see every
                // final output chunk before the end notification.
                let reader = watched.reader.lock().unwrap().take();
                if let Some(handle) = reader {
                    if let Err(e) = handle.join() {
                        warn!("joining reader for {}: {:?}", watched.id, e);
                    }
                }
                ended.emit(&SessionEnd { session_id: watched.id.clone(), code: Some(code) });
            });
        if let Err(e) = spawned {
            warn!("could not spawn end watcher for {}: {:?}", session.id, e);
        }
    }

    /// Forward input to the session's pty. Returns false if the
    /// session is missing, not running, or the write fails; a failed
    /// write does not change session state (the pty may recover).
    pub fn write_to_session(&self, id: &str, data: &[u8]) -> bool {
        let session = match self.get_live(id) {
            Some(s) => s,
            None => return false,
        };
        if session.status() != SessionStatus::Running {
            return false;
        }
        session.touch();
        match session.pty.write_all(data) {
            Ok(()) => true,
            Err(e) => {
                warn!("write to session {} failed: {:?}", id, e);
                false
            }
        }
    }

    /// Resize the session's terminal. Idempotent; repeated calls with
    /// the same size are harmless.
    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let session = match self.get_live(id) {
            Some(s) => s,
            None => return false,
        };
        if session.status() != SessionStatus::Running {
            return false;
        }

        let cols = cols.max(1);
        let rows = rows.max(1);
        {
            let mut descriptor = session.descriptor.lock().unwrap();
            descriptor.cols = cols;
            descriptor.rows = rows;
            descriptor.last_accessed_at = unix_ms();
        }
        match session.pty.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                warn!("resize of session {} failed: {:?}", id, e);
                false
            }
        }
    }

    /// Kill the session's child: SIGHUP, a grace period, then
    /// SIGKILL. The session transitions to `killed` only once the
    /// child actually exits, reported through the session-end event.
    #[instrument(skip_all, fields(s = id))]
    pub fn kill_session(&self, id: &str) -> bool {
        let session = match self.get_live(id) {
            Some(s) => s,
            None => return false,
        };
        if session.status().is_terminal() {
            return false;
        }

        session.kill_requested.store(true, Ordering::Release);
        let grace = self.config.get().kill_grace();
        match session.pty.kill(grace) {
            Ok(()) => true,
            Err(e) => {
                warn!("kill of session {} failed: {:?}", id, e);
                false
            }
        }
    }

    /// Metadata for one session, live or retained.
    pub fn get_session(&self, id: &str) -> Option<SessionDescriptor> {
        if let Some(session) = self.get_live(id) {
            return Some(session.descriptor());
        }
        self.store.get(id).map(|record| record.session)
    }

    /// Every session the daemon knows about: live ones first, then
    /// retained records of exited sessions.
    pub fn get_all_sessions(&self) -> Vec<SessionDescriptor> {
        let mut out = vec![];
        let live_ids: Vec<String> = {
            let sessions = self.sessions.lock().unwrap();
            for session in sessions.values() {
                out.push(session.descriptor());
            }
            sessions.keys().cloned().collect()
        };

        for record in self.store.list_all() {
            if !live_ids.contains(&record.session.id) {
                out.push(record.session);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn get_active_session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|s| s.status() == SessionStatus::Running)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Bump the session's last-accessed stamp (client attach and the
    /// like).
    pub fn touch(&self, id: &str) {
        if let Some(session) = self.get_live(id) {
            session.touch();
        }
    }

    /// Drop an exited session's record and transcript for good.
    /// Refused while the session is still running.
    pub fn delete_session(&self, id: &str) -> bool {
        {
            let mut sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get(id) {
                if !session.status().is_terminal() {
                    return false;
                }
                sessions.remove(id);
            }
        }
        let existed = self.store.get(id).is_some();
        self.store.delete(id);
        existed
    }

    /// Kill everything. Used on daemon shutdown; session-end events
    /// still fire for each session as its child exits.
    #[instrument(skip_all)]
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.kill_session(&id);
        }
    }

    fn get_live(&self, id: &str) -> Option<Arc<Session>> {
        let _s = span!(Level::INFO, "lock(sessions)").entered();
        let sessions = self.sessions.lock().unwrap();
        sessions.get(id).map(Arc::clone)
    }

    /// Decide what to exec. With no explicit command we launch the
    /// configured (or passwd) shell as a login shell.
    fn resolve_command(
        &self,
        options: &CreateOptions,
    ) -> Result<(String, Vec<String>, bool), CreateError> {
        let (raw_command, args, login_shell) = match &options.command {
            Some(command) if options.args.is_empty() => {
                // allow a whole command line in the command field
                let mut parts = shell_words::split(command)
                    .map_err(|e| CreateError::SpawnFailed(format!("parsing command: {e}")))?;
                if parts.is_empty() {
                    return Err(CreateError::SpawnFailed(String::from("empty command")));
                }
                let head = parts.remove(0);
                (head, parts, false)
            }
            Some(command) => (command.clone(), options.args.clone(), false),
            None => {
                let shell = self
                    .config
                    .get()
                    .shell
                    .clone()
                    .unwrap_or_else(|| self.user_info.default_shell.clone());
                let mut args = vec![];
                if self.config.get().norc.unwrap_or(false) && shell.ends_with("bash") {
                    args.push(String::from("--norc"));
                    args.push(String::from("--noprofile"));
                }
                (shell, args, true)
            }
        };

        let command = self
            .resolve_command_path(&raw_command)
            .ok_or_else(|| CreateError::SpawnFailed(format!("command not found: {raw_command}")))?;
        Ok((command, args, login_shell))
    }

    /// Resolve the binary up front so a bad command fails the create
    /// call synchronously instead of surfacing as an instant exit.
    fn resolve_command_path(&self, command: &str) -> Option<String> {
        let is_executable = |p: &Path| {
            fs::metadata(p)
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        };

        if command.contains('/') {
            return is_executable(Path::new(command)).then(|| String::from(command));
        }

        let config = self.config.get();
        let search_path =
            config.initial_path.clone().unwrap_or_else(|| String::from(DEFAULT_INITIAL_PATH));
        for dir in search_path.split(':') {
            let candidate = PathBuf::from(dir).join(command);
            if is_executable(&candidate) {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
        None
    }

    /// The child env is rebuilt from a blank slate: identity vars,
    /// the session id marker, TERM, then config env, then per-session
    /// overrides, in increasing precedence.
    fn build_session_env(&self, id: &str, options: &CreateOptions) -> Vec<(OsString, OsString)> {
        let s = OsString::from;
        let config = self.config.get();

        let mut env = vec![
            (s("HOME"), s(&self.user_info.home_dir)),
            (
                s("PATH"),
                s(config.initial_path.as_deref().unwrap_or(DEFAULT_INITIAL_PATH)),
            ),
            (s("SHELL"), s(&self.user_info.default_shell)),
            (s("USER"), s(&self.user_info.user)),
            (s(consts::SESSION_ID_VAR), s(id)),
            (s("TERM"), s(DEFAULT_TERM)),
        ];

        if let Some(extra) = config.env.as_ref() {
            env.extend(extra.iter().map(|(k, v)| (s(k), s(v))));
        }
        env.extend(options.env.iter().map(|(k, v)| (s(k), s(v))));

        env
    }
}

/// Session ids become file names in the store, so they must not
/// traverse.
fn id_is_valid(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use crossbeam_channel::unbounded;
    use ntest::timeout;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        _tmpdir: tempfile::TempDir,
        manager: SessionManager,
        data_rx: crossbeam_channel::Receiver<PtyChunk>,
        end_rx: crossbeam_channel::Receiver<SessionEnd>,
    }

    fn fixture() -> Fixture {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(tmpdir.path()));
        store.initialize().unwrap();

        let config: config::Config = toml::from_str("noecho = true").unwrap();
        let manager = SessionManager::new(config::Manager::from_config(config), store).unwrap();

        let (data_tx, data_rx) = unbounded();
        manager
            .on_data(move |chunk| {
                let _ = data_tx.send(chunk.clone());
            })
            .forever();
        let (end_tx, end_rx) = unbounded();
        manager
            .on_session_end(move |end| {
                let _ = end_tx.send(end.clone());
            })
            .forever();

        Fixture { _tmpdir: tmpdir, manager, data_rx, end_rx }
    }

    fn cat_options(id: &str) -> CreateOptions {
        CreateOptions {
            id: Some(String::from(id)),
            command: Some(String::from("/bin/cat")),
            ..Default::default()
        }
    }

    /// Accumulate chunks until the needle shows up somewhere in the
    /// concatenation (reads can split anywhere), returning the id of
    /// the session the last chunk came from.
    fn wait_for_data(rx: &crossbeam_channel::Receiver<PtyChunk>, needle: &[u8]) -> String {
        let deadline = Instant::now() + RECV_TIMEOUT;
        let mut collected: Vec<u8> = vec![];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = rx.recv_timeout(remaining).expect("data before timeout");
            collected.extend_from_slice(&chunk.data);
            if collected.windows(needle.len()).any(|w| w == needle) {
                return chunk.session_id;
            }
        }
    }

    #[test]
    #[timeout(60000)]
    fn create_write_read_kill() {
        let fx = fixture();

        let descriptor = fx
            .manager
            .create_session(80, 24, &cat_options("cat-1"))
            .expect("session to launch");
        assert_eq!(descriptor.status, SessionStatus::Running);
        assert_eq!(fx.manager.get_active_session_ids(), vec![String::from("cat-1")]);

        assert!(fx.manager.write_to_session("cat-1", b"hello roundtrip\n"));
        let session_id = wait_for_data(&fx.data_rx, b"hello roundtrip");
        assert_eq!(session_id, "cat-1");

        assert!(fx.manager.kill_session("cat-1"));
        let end = fx.end_rx.recv_timeout(RECV_TIMEOUT).expect("session end event");
        assert_eq!(end.session_id, "cat-1");

        let status = fx.manager.get_session("cat-1").expect("descriptor").status;
        assert_eq!(status, SessionStatus::Killed);
        assert!(fx.manager.get_active_session_ids().is_empty());
    }

    #[test]
    #[timeout(60000)]
    fn natural_exit_reports_exited() {
        let fx = fixture();

        let options = CreateOptions {
            id: Some(String::from("true-1")),
            command: Some(String::from("/bin/true")),
            ..Default::default()
        };
        fx.manager.create_session(80, 24, &options).expect("session to launch");

        let end = fx.end_rx.recv_timeout(RECV_TIMEOUT).expect("session end event");
        assert_eq!(end.session_id, "true-1");
        assert_eq!(end.code, Some(0));

        let status = fx.manager.get_session("true-1").expect("descriptor").status;
        assert_eq!(status, SessionStatus::Exited(0));
    }

    #[test]
    #[timeout(60000)]
    fn writes_to_dead_sessions_are_rejected() {
        let fx = fixture();

        let options = CreateOptions {
            id: Some(String::from("short")),
            command: Some(String::from("/bin/true")),
            ..Default::default()
        };
        fx.manager.create_session(80, 24, &options).expect("session to launch");
        fx.end_rx.recv_timeout(RECV_TIMEOUT).expect("session end event");

        assert!(!fx.manager.write_to_session("short", b"too late\n"));
        assert!(!fx.manager.write_to_session("never-existed", b"x"));
    }

    #[test]
    #[timeout(60000)]
    fn id_collision_rejected_even_after_exit() {
        let fx = fixture();

        fx.manager.create_session(80, 24, &cat_options("dupe")).expect("first create");
        let err = fx.manager.create_session(80, 24, &cat_options("dupe")).unwrap_err();
        assert_eq!(err, CreateError::IdCollision(String::from("dupe")));

        fx.manager.kill_session("dupe");
        fx.end_rx.recv_timeout(RECV_TIMEOUT).expect("session end event");

        // the exited session retains its record, so the id stays taken
        let err = fx.manager.create_session(80, 24, &cat_options("dupe")).unwrap_err();
        assert_eq!(err, CreateError::IdCollision(String::from("dupe")));

        // deleting frees it up
        assert!(fx.manager.delete_session("dupe"));
        fx.manager.create_session(80, 24, &cat_options("dupe")).expect("create after delete");
    }

    #[test]
    #[timeout(60000)]
    fn bad_ids_and_bad_commands_rejected() {
        let fx = fixture();

        let bad_id = CreateOptions {
            id: Some(String::from("../escape")),
            command: Some(String::from("/bin/cat")),
            ..Default::default()
        };
        assert_matches!(
            fx.manager.create_session(80, 24, &bad_id),
            Err(CreateError::InvalidId(_))
        );

        let bad_cmd = CreateOptions {
            id: Some(String::from("nope")),
            command: Some(String::from("/definitely/not/real")),
            ..Default::default()
        };
        assert_matches!(
            fx.manager.create_session(80, 24, &bad_cmd),
            Err(CreateError::SpawnFailed(_))
        );
        // spawn-failed must not leave a record behind
        assert!(fx.manager.get_session("nope").is_none());
    }

    #[test]
    #[timeout(60000)]
    fn resize_updates_descriptor() {
        let fx = fixture();
        fx.manager.create_session(80, 24, &cat_options("sz")).expect("create");

        assert!(fx.manager.resize("sz", 120, 40));
        let descriptor = fx.manager.get_session("sz").unwrap();
        assert_eq!((descriptor.cols, descriptor.rows), (120, 40));

        // idempotent
        assert!(fx.manager.resize("sz", 120, 40));
        assert!(!fx.manager.resize("missing", 1, 1));
    }

    #[test]
    #[timeout(60000)]
    fn generated_ids_are_unique() {
        let fx = fixture();
        let opts = CreateOptions { command: Some(String::from("/bin/cat")), ..Default::default() };
        let a = fx.manager.create_session(80, 24, &opts).expect("create a");
        let b = fx.manager.create_session(80, 24, &opts).expect("create b");
        assert_ne!(a.id, b.id);
    }
}
