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

use std::time;

/// Read buffer size for the per-session pty reader.
pub const BUF_SIZE: usize = 1024 * 16;

/// How often the pty reader wakes up to check for shutdown when the
/// shell is quiet.
pub const PTY_POLL_MS: u16 = 100;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Cap on the total bytes retained in a session's output buffer.
pub const DEFAULT_BUFFER_CAP_BYTES: usize = 100_000;

/// Default outbound rate limit applied by the rate-limit processor.
pub const DEFAULT_RATE_LIMIT_BYTES_PER_SEC: usize = 1024 * 1024;

/// Largest inbound frame a client may send. Input beyond this is
/// rejected with an error reply rather than written to the pty.
pub const MAX_INBOUND_CHUNK_BYTES: usize = 10 * 1024;

/// Largest frame we will accept off the wire in either direction.
/// Output frames can carry a full buffer snapshot plus headroom.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Idle time before a session's buffer snapshot is written to disk.
pub const DEFAULT_PERSIST_DEBOUNCE: time::Duration = time::Duration::from_secs(1);

/// How long to wait after SIGHUP before escalating to SIGKILL.
pub const DEFAULT_KILL_GRACE: time::Duration = time::Duration::from_secs(2);

/// A client whose unsent output queue exceeds this many bytes gets a
/// lagged notice and is disconnected rather than stalling producers.
pub const DEFAULT_SEND_QUEUE_CAP_BYTES: usize = 1024 * 1024;

/// Matchers that take longer than this on one chunk get a slow-match
/// warning logged (they stay registered).
pub const SLOW_MATCH_WARN: time::Duration = time::Duration::from_millis(10);

/// The session id env var injected into spawned shells and consumed
/// by `shelltender kill` when no session argument is given.
pub const SESSION_ID_VAR: &str = "SHELLTENDER_SESSION_ID";
