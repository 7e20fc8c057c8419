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

//! Debounced buffer persistence. The data path calls `touch` on
//! every processed chunk; the worker coalesces touches per session
//! and invokes the flush callback at most once per debounce window,
//! so a chatty session costs one disk write per second instead of one
//! per chunk. Session end force-flushes synchronously and cancels the
//! pending deadline.

use std::{
    collections::HashMap,
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use crossbeam_channel::{select, unbounded, Sender};
use tracing::{debug, error, warn};

enum Msg {
    Touch(String),
    FlushNow(String, Sender<()>),
    FlushAll(Sender<()>),
    Shutdown,
}

pub struct Debouncer {
    tx: Sender<Msg>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Debouncer {
    /// `flush` is called with a session id whenever that session's
    /// debounce window closes. It runs on the worker thread and does
    /// the actual snapshot + store write.
    pub fn new(delay: Duration, flush: impl Fn(&str) + Send + 'static) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded();

        let worker = thread::Builder::new()
            .name(String::from("persist-debounce"))
            .spawn(move || {
                let mut pending: HashMap<String, Instant> = HashMap::new();
                loop {
                    // fire whatever is due before sleeping again
                    let now = Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in due {
                        pending.remove(&id);
                        debug!("debounce window closed for {}", id);
                        flush(&id);
                    }

                    let next_deadline = pending.values().min().copied();
                    let timeout = next_deadline
                        .map(crossbeam_channel::at)
                        .unwrap_or_else(crossbeam_channel::never);

                    select! {
                        recv(rx) -> msg => match msg {
                            Ok(Msg::Touch(id)) => {
                                // keep the earliest deadline so steady
                                // output still persists once per window
                                pending.entry(id).or_insert_with(|| Instant::now() + delay);
                            }
                            Ok(Msg::FlushNow(id, ack)) => {
                                pending.remove(&id);
                                flush(&id);
                                let _ = ack.send(());
                            }
                            Ok(Msg::FlushAll(ack)) => {
                                for (id, _) in pending.drain() {
                                    flush(&id);
                                }
                                let _ = ack.send(());
                            }
                            Ok(Msg::Shutdown) | Err(_) => {
                                // flush stragglers on the way out
                                for (id, _) in pending.drain() {
                                    flush(&id);
                                }
                                return;
                            }
                        },
                        recv(timeout) -> _ => {}
                    }
                }
            })
            .context("spawning persistence debounce thread")?;

        Ok(Debouncer { tx, worker: Mutex::new(Some(worker)) })
    }

    /// Note that the session has fresh output worth persisting.
    pub fn touch(&self, session_id: &str) {
        if self.tx.send(Msg::Touch(String::from(session_id))).is_err() {
            warn!("persistence worker gone, dropping touch for {}", session_id);
        }
    }

    /// Persist the session right now, canceling any pending deadline,
    /// and wait for the write to happen. Used on session end so the
    /// final transcript is durable before anyone is told about the
    /// exit.
    pub fn flush_sync(&self, session_id: &str) {
        let (ack_tx, ack_rx) = unbounded();
        if self.tx.send(Msg::FlushNow(String::from(session_id), ack_tx)).is_err() {
            warn!("persistence worker gone, cannot flush {}", session_id);
            return;
        }
        if ack_rx.recv().is_err() {
            warn!("persistence worker died mid-flush for {}", session_id);
        }
    }

    /// Flush every pending session and wait.
    pub fn flush_all_sync(&self) {
        let (ack_tx, ack_rx) = unbounded();
        if self.tx.send(Msg::FlushAll(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.recv();
    }

    /// Stop the worker, flushing pending sessions first.
    pub fn shutdown(&self) {
        if self.tx.send(Msg::Shutdown).is_ok() {
            if let Some(worker) = self.worker.lock().unwrap().take() {
                if worker.join().is_err() {
                    error!("persistence worker panicked during shutdown");
                }
            }
        }
    }
}
