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

use std::{collections::HashMap, fmt};

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A message sent by a client to the daemon.
///
/// Every message is a single JSON document tagged by its `type` field
/// and framed with a 4 byte little endian length prefix. Clients may
/// send any number of messages over one connection; the daemon keeps
/// the connection open across errors other than transport failures.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a new session. Responds with `ServerMessage::Created`
    /// and implicitly attaches the creating client.
    Create {
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
        #[serde(default)]
        options: Option<CreateOptions>,
    },
    /// Attach to an existing session. Responds with
    /// `ServerMessage::Connect` carrying the scrollback.
    ///
    /// `from_seq` lets a reconnecting client resume from the last
    /// sequence number it saw so already-delivered chunks are not
    /// re-sent.
    Connect {
        session_id: String,
        #[serde(default)]
        from_seq: Option<u64>,
    },
    /// Detach this client from the session. The session keeps running.
    Disconnect { session_id: String },
    /// Write keyboard input to the session's pty.
    Input { session_id: String, data: String },
    /// Resize the session's pty.
    Resize { session_id: String, cols: u16, rows: u16 },
    /// Terminate the session's child process.
    Kill { session_id: String },
    /// Register an output matcher on the session. Responds with
    /// `ServerMessage::PatternRegistered`.
    PatternRegister { session_id: String, spec: PatternSpec },
    /// Remove a previously registered matcher.
    PatternUnregister { session_id: String, pattern_id: String },
    /// List every session the daemon knows about, active or exited.
    AdminListSessions,
    /// Attach as a supervisor client. Admin attachments are tracked
    /// separately from primary attachments so admin activity never
    /// perturbs ordinary clients.
    AdminAttach { session_id: String, mode: AdminMode },
    /// Detach a supervisor client.
    AdminDetach { session_id: String },
    /// Write input as a supervisor. Only permitted for attachments
    /// made with `AdminMode::Interactive`.
    AdminInput { session_id: String, data: String },
}

/// A message sent by the daemon to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to `Create`.
    Created { session_id: String, session: SessionDescriptor },
    /// Reply to `Connect` and `AdminAttach`.
    ///
    /// `scrollback` is the flat concatenation of all retained output.
    /// `truncated` is set when the requested `from_seq` predates the
    /// oldest retained entry and a full snapshot was returned instead
    /// of an incremental slice.
    Connect {
        session_id: String,
        session: SessionDescriptor,
        scrollback: String,
        last_sequence: u64,
        #[serde(default)]
        truncated: bool,
    },
    /// A chunk of processed session output.
    Output { session_id: String, data: String, sequence: u64 },
    /// The session's child process has exited.
    SessionEnd {
        session_id: String,
        #[serde(default)]
        code: Option<i32>,
    },
    /// Reply to `PatternRegister`.
    PatternRegistered { pattern_id: String },
    /// A registered matcher fired.
    PatternMatch {
        session_id: String,
        pattern_id: String,
        name: String,
        r#match: String,
        position: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        groups: Option<HashMap<String, String>>,
        timestamp: u64,
    },
    /// An ANSI escape sequence was observed in the output stream.
    AnsiSequence { session_id: String, category: AnsiCategory, raw: String, timestamp: u64 },
    /// Reply to `AdminListSessions`.
    AdminSessionsList { sessions: Vec<SessionDescriptor> },
    /// The client's send queue overflowed and the connection is about
    /// to be closed.
    Lagged { session_id: String, dropped_bytes: u64 },
    /// Any request-level failure. The connection stays open.
    Error { message: String },
}

/// Launch options for a new session beyond the terminal dimensions.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptions {
    /// Caller-chosen session id. Must not collide with an existing
    /// session; collisions are rejected, never reattached to.
    #[serde(default)]
    pub id: Option<String>,
    /// Command to run instead of the user's default shell. Parsed
    /// into a binary and arguments with shell-words.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Optional human label.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub restrictions: Option<Restrictions>,
}

/// Advisory launch restrictions. These are interpreted by whatever
/// spawns the shell command; the daemon records them but does not
/// enforce them.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restrictions {
    #[serde(default)]
    pub restrict_to_path: Option<String>,
    #[serde(default)]
    pub allow_upward_navigation: bool,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub read_only_mode: bool,
}

/// Session metadata as shown to clients and persisted to disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds, bumped on every client interaction.
    pub last_accessed_at: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub restrictions: Option<Restrictions>,
    pub status: SessionStatus,
}

/// Lifecycle state of a session. Transitions are monotonic:
/// `Starting -> Running -> Exited | Killed`, with no resurrection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited(i32),
    Killed,
}

impl SessionStatus {
    /// True once the session can no longer accept input.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Exited(_) | SessionStatus::Killed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Exited(code) => write!(f, "exited({code})"),
            SessionStatus::Killed => write!(f, "killed"),
        }
    }
}

/// A matcher registration request.
///
/// The matcher kind is flattened into the spec object, so on the wire
/// this reads `{"name": "jest", "kind": "regex", "pattern": "..."}`.
/// Custom (callable) matchers cannot travel over the wire; they are
/// registered directly against the engine by embedding code.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PatternSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: PatternKind,
    #[serde(default)]
    pub options: PatternOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PatternKind {
    /// Substring search.
    Literal { pattern: String },
    /// Any string from a set; the earliest position wins.
    LiteralSet { patterns: Vec<String> },
    /// Compiled once at registration time.
    Regex { pattern: String },
    /// Fires on ANSI escape sequences of the given class.
    AnsiClass { class: AnsiCategory },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternOptions {
    /// Defaults to true for literal matchers.
    #[serde(default)]
    pub case_sensitive: Option<bool>,
    /// Regex only: evaluate against the flat buffer with multi-line
    /// semantics rather than against the current chunk.
    #[serde(default)]
    pub multiline: bool,
    /// Suppress (and do not count) matches that fire within this many
    /// milliseconds of the previous one.
    #[serde(default)]
    pub debounce_ms: Option<u64>,
}

/// Classes of ANSI escape sequence reported by the stream scanner.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AnsiCategory {
    Cursor,
    Color,
    Clear,
    Osc,
    Esc,
    Other,
}

impl fmt::Display for AnsiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnsiCategory::Cursor => "cursor",
            AnsiCategory::Color => "color",
            AnsiCategory::Clear => "clear",
            AnsiCategory::Osc => "osc",
            AnsiCategory::Esc => "esc",
            AnsiCategory::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// Attachment mode for supervisor clients.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AdminMode {
    ReadOnly,
    Interactive,
}

/// The on-disk record for one session: the descriptor plus the most
/// recent flat buffer snapshot. One JSON file per session, written
/// atomically (write-temp then rename).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    #[serde(flatten)]
    pub session: SessionDescriptor,
    #[serde(default)]
    pub buffer: String,
    #[serde(default)]
    pub last_sequence: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            id: String::from("S1"),
            command: String::from("/bin/bash"),
            args: vec![],
            cwd: None,
            env: HashMap::new(),
            cols: 80,
            rows: 24,
            created_at: 1,
            last_accessed_at: 2,
            title: None,
            restrictions: None,
            status: SessionStatus::Running,
        }
    }

    #[test]
    fn client_message_wire_shape() {
        let cases = vec![
            (
                ClientMessage::Create { cols: Some(80), rows: Some(24), options: None },
                r#""type":"create""#,
            ),
            (
                ClientMessage::Connect { session_id: String::from("S1"), from_seq: Some(7) },
                r#""sessionId":"S1""#,
            ),
            (
                ClientMessage::PatternUnregister {
                    session_id: String::from("S1"),
                    pattern_id: String::from("p-1"),
                },
                r#""patternId":"p-1""#,
            ),
            (ClientMessage::AdminListSessions, r#""type":"admin-list-sessions""#),
            (
                ClientMessage::AdminAttach {
                    session_id: String::from("S1"),
                    mode: AdminMode::ReadOnly,
                },
                r#""mode":"read-only""#,
            ),
        ];

        for (msg, substr) in cases.into_iter() {
            let encoded = serde_json::to_string(&msg).expect("message to encode");
            assert!(encoded.contains(substr), "{encoded} missing {substr}");
            let decoded: ClientMessage = serde_json::from_str(&encoded).expect("round trip");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn client_message_parses_spec_examples() {
        let cases = vec![
            r#"{"type":"create","cols":80,"rows":24}"#,
            r#"{"type":"connect","sessionId":"S1"}"#,
            r#"{"type":"input","sessionId":"S1","data":"echo hi\n"}"#,
            r#"{"type":"kill","sessionId":"S1"}"#,
            r#"{"type":"admin-attach","sessionId":"S1","mode":"interactive"}"#,
            r#"{"type":"pattern-register","sessionId":"S1",
                "spec":{"name":"jest","kind":"regex","pattern":"Tests:"}}"#,
        ];

        for case in cases.into_iter() {
            let _: ClientMessage = serde_json::from_str(case).expect("spec example to parse");
        }
    }

    #[test]
    fn server_message_round_trip() {
        let cases = vec![
            ServerMessage::Created { session_id: String::from("S1"), session: descriptor() },
            ServerMessage::Output {
                session_id: String::from("S1"),
                data: String::from("hi\r\n"),
                sequence: 3,
            },
            ServerMessage::SessionEnd { session_id: String::from("S1"), code: Some(0) },
            ServerMessage::PatternMatch {
                session_id: String::from("S1"),
                pattern_id: String::from("p-1"),
                name: String::from("jest"),
                r#match: String::from("Tests: 12 passed, 3 failed"),
                position: 0,
                groups: Some(HashMap::from([
                    (String::from("1"), String::from("12")),
                    (String::from("2"), String::from("3")),
                ])),
                timestamp: 99,
            },
            ServerMessage::Lagged { session_id: String::from("S1"), dropped_bytes: 4096 },
        ];

        for msg in cases.into_iter() {
            let encoded = serde_json::to_string(&msg).expect("message to encode");
            let decoded: ServerMessage = serde_json::from_str(&encoded).expect("round trip");
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn match_field_serializes_bare() {
        let msg = ServerMessage::PatternMatch {
            session_id: String::from("S1"),
            pattern_id: String::from("p-1"),
            name: String::from("n"),
            r#match: String::from("hit"),
            position: 4,
            groups: None,
            timestamp: 0,
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""match":"hit""#), "{encoded}");
        assert!(!encoded.contains("groups"), "{encoded}");
    }

    #[test]
    fn session_status_shape() {
        assert_eq!(serde_json::to_string(&SessionStatus::Running).unwrap(), r#""running""#);
        assert_eq!(serde_json::to_string(&SessionStatus::Exited(3)).unwrap(), r#"{"exited":3}"#);

        let decoded: SessionStatus = serde_json::from_str(r#"{"exited":0}"#).unwrap();
        assert_eq!(decoded, SessionStatus::Exited(0));
    }

    #[test]
    fn persisted_session_flattens_descriptor() {
        let record = PersistedSession {
            session: descriptor(),
            buffer: String::from("echo hi\r\nhi\r\n$ "),
            last_sequence: 12,
        };
        let encoded = serde_json::to_string(&record).unwrap();
        assert!(encoded.contains(r#""id":"S1""#), "{encoded}");
        assert!(encoded.contains(r#""lastSequence":12"#), "{encoded}");

        let decoded: PersistedSession = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
