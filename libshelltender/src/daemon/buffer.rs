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

//! Per-session output spools. Each accepted chunk gets a sequence
//! number that is unique for the life of the session, even after the
//! chunk itself has been evicted to stay under the byte cap. The
//! sequence numbers are what let a reconnecting client say "give me
//! everything after N" and get exactly the bytes it has not seen.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tracing::debug;

/// One accepted chunk.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub sequence: u64,
    /// Milliseconds since the owning session started.
    pub timestamp_ms: u64,
    pub chunk: Vec<u8>,
}

/// The result of reading a spool, either in full or incrementally.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSlice {
    pub data: Vec<u8>,
    /// The sequence of the newest entry ever accepted (not merely the
    /// newest retained). 0 when nothing was ever appended.
    pub last_sequence: u64,
    /// Set when the caller asked for an incremental read but the
    /// starting point had already been evicted, forcing a full
    /// snapshot instead.
    pub truncated: bool,
}

#[derive(Debug)]
struct Spool {
    entries: VecDeque<BufferEntry>,
    total_bytes: usize,
    cap_bytes: usize,
    next_sequence: u64,
}

impl Spool {
    fn new(cap_bytes: usize) -> Self {
        Spool { entries: VecDeque::new(), total_bytes: 0, cap_bytes, next_sequence: 0 }
    }

    fn append(&mut self, chunk: &[u8], timestamp_ms: u64) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        // A single chunk bigger than the whole spool keeps only its
        // trailing cap bytes. Observers of the live stream saw the
        // full chunk; only the retained history is clipped.
        let stored: &[u8] = if chunk.len() > self.cap_bytes {
            debug!(
                "chunk of {} bytes exceeds spool cap of {}, storing trailing suffix",
                chunk.len(),
                self.cap_bytes
            );
            &chunk[chunk.len() - self.cap_bytes..]
        } else {
            chunk
        };

        self.total_bytes += stored.len();
        self.entries.push_back(BufferEntry { sequence, timestamp_ms, chunk: stored.to_vec() });

        while self.total_bytes > self.cap_bytes {
            let evicted = self
                .entries
                .pop_front()
                .expect("entries cannot be empty while total_bytes is nonzero");
            self.total_bytes -= evicted.chunk.len();
        }

        sequence
    }

    fn last_sequence(&self) -> u64 {
        self.next_sequence.saturating_sub(1)
    }

    fn snapshot(&self) -> BufferSlice {
        let mut data = Vec::with_capacity(self.total_bytes);
        for entry in self.entries.iter() {
            data.extend_from_slice(&entry.chunk);
        }
        BufferSlice { data, last_sequence: self.last_sequence(), truncated: false }
    }

    fn incremental(&self, from_seq: u64) -> BufferSlice {
        let oldest_retained = match self.entries.front() {
            Some(entry) => entry.sequence,
            None => {
                return BufferSlice {
                    data: vec![],
                    last_sequence: self.last_sequence(),
                    truncated: false,
                };
            }
        };

        // from_seq is the newest sequence the caller has already
        // seen. If the entry right after it is gone, the caller
        // cannot be caught up incrementally and gets the full
        // snapshot flagged as truncated.
        if from_seq + 1 < oldest_retained {
            let mut snap = self.snapshot();
            snap.truncated = true;
            return snap;
        }

        let mut data = Vec::new();
        for entry in self.entries.iter() {
            if entry.sequence > from_seq {
                data.extend_from_slice(&entry.chunk);
            }
        }
        BufferSlice { data, last_sequence: self.last_sequence(), truncated: false }
    }
}

/// All session spools. Each session's spool sits behind its own
/// mutex; the outer map lock is only held long enough to clone the
/// spool handle, so sessions never contend with each other on the
/// append path.
pub struct BufferStore {
    spools: Mutex<HashMap<String, Arc<Mutex<Spool>>>>,
    default_cap_bytes: usize,
}

impl BufferStore {
    pub fn new(default_cap_bytes: usize) -> Self {
        BufferStore { spools: Mutex::new(HashMap::new()), default_cap_bytes }
    }

    fn spool(&self, session_id: &str) -> Arc<Mutex<Spool>> {
        let mut spools = self.spools.lock().unwrap();
        if let Some(spool) = spools.get(session_id) {
            return Arc::clone(spool);
        }
        let spool = Arc::new(Mutex::new(Spool::new(self.default_cap_bytes)));
        spools.insert(String::from(session_id), Arc::clone(&spool));
        spool
    }

    /// Accept a chunk, returning the sequence number it was assigned.
    pub fn append(&self, session_id: &str, chunk: &[u8], timestamp_ms: u64) -> u64 {
        let spool = self.spool(session_id);
        let mut spool = spool.lock().unwrap();
        spool.append(chunk, timestamp_ms)
    }

    /// The full retained scrollback.
    pub fn snapshot(&self, session_id: &str) -> BufferSlice {
        let spool = self.spool(session_id);
        let snap = spool.lock().unwrap().snapshot();
        snap
    }

    /// Everything after `from_seq`, or a truncated-flagged full
    /// snapshot when that point has been evicted.
    pub fn incremental(&self, session_id: &str, from_seq: u64) -> BufferSlice {
        let spool = self.spool(session_id);
        let slice = spool.lock().unwrap().incremental(from_seq);
        slice
    }

    /// Drop the session's retained bytes. Sequence numbers are not
    /// reset; a session that kept going would continue from where it
    /// left off.
    pub fn clear(&self, session_id: &str) {
        let spool = self.spool(session_id);
        let mut spool = spool.lock().unwrap();
        spool.entries.clear();
        spool.total_bytes = 0;
    }

    /// Forget the session entirely, sequence counter included. Only
    /// for sessions that are gone for good.
    pub fn remove(&self, session_id: &str) {
        let mut spools = self.spools.lock().unwrap();
        spools.remove(session_id);
    }
}
