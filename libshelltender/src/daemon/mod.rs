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

//! Daemon assembly. Builds every component, wires the data path
//! between them, and runs the accept loop. The flow for each
//! outbound chunk is:
//!
//! ```text
//! pty -> manager(data) -> pipeline -> { buffer.append -> hub.broadcast,
//!                                       pattern.evaluate, persist.touch }
//! ```

use std::{os::unix::net::UnixListener, path::PathBuf, sync::Arc, time};

use anyhow::Context;
use tracing::{info, instrument};

pub mod ansi;
pub mod buffer;
pub mod exit_notify;
pub mod manager;
pub mod pattern;
pub mod persist;
pub mod pipeline;
pub mod pty;
pub mod server;
mod signals;
pub mod store;

use buffer::BufferStore;
use manager::SessionManager;
use pattern::PatternEngine;
use persist::Debouncer;
use pipeline::{DataEvent, Pipeline};
use server::Server;
use store::SessionStore;

use crate::config;

/// Wall clock in unix milliseconds, the timestamp unit of the wire
/// protocol and persisted records. Saturates rather than erroring on
/// a clock set before the epoch.
pub(crate) fn unix_ms() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Everything the daemon is made of, fully wired. Exposed so tests
/// and embedders can run a daemon in-process against a listener of
/// their choosing.
#[derive(Clone)]
pub struct Daemon {
    pub manager: Arc<SessionManager>,
    pub buffers: Arc<BufferStore>,
    pub patterns: Arc<PatternEngine>,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<SessionStore>,
    pub persist: Arc<Debouncer>,
    pub hub: Arc<Server>,
}

/// Construct and wire all components. The store is initialized (and
/// must be) before the hub can accept any traffic.
#[instrument(skip_all)]
pub fn build(config: config::Manager, runtime_dir: &PathBuf) -> anyhow::Result<Daemon> {
    let store = Arc::new(SessionStore::new(runtime_dir.join("sessions")));
    store.initialize().context("initializing session store")?;

    let buffers = Arc::new(BufferStore::new(config.get().buffer_cap_bytes()));
    let patterns = Arc::new(PatternEngine::new().context("starting pattern engine")?);
    let pipeline_config = config.get().pipeline.clone().unwrap_or_default();
    let pipeline =
        Arc::new(Pipeline::from_config(&pipeline_config).context("assembling pipeline")?);
    let manager = Arc::new(
        SessionManager::new(config.clone(), Arc::clone(&store))
            .context("starting session manager")?,
    );

    let flush_buffers = Arc::clone(&buffers);
    let flush_store = Arc::clone(&store);
    let persist = Arc::new(
        Debouncer::new(config.get().persist_debounce(), move |session_id| {
            let snap = flush_buffers.snapshot(session_id);
            flush_store.update_buffer(
                session_id,
                &String::from_utf8_lossy(&snap.data),
                snap.last_sequence,
            );
        })
        .context("starting persistence debouncer")?,
    );

    let hub = Server::new(
        config.clone(),
        Arc::clone(&manager),
        Arc::clone(&buffers),
        Arc::clone(&patterns),
        Arc::clone(&store),
    );

    let daemon = Daemon { manager, buffers, patterns, pipeline, store, persist, hub };
    wire(&daemon);
    Ok(daemon)
}

/// Subscribe the components to each other. All subscriptions live for
/// the daemon's lifetime.
fn wire(daemon: &Daemon) {
    // pty output enters the pipeline on the reader thread, keeping
    // per-session ordering
    let pipeline = Arc::clone(&daemon.pipeline);
    daemon
        .manager
        .on_data(move |chunk| {
            pipeline.process(DataEvent::new(
                &chunk.session_id,
                chunk.data.clone(),
                chunk.timestamp_ms,
            ));
        })
        .forever();

    // processed chunks: sequence + spool, fan out, schedule pattern
    // evaluation, and note the session dirty for persistence
    let buffers = Arc::clone(&daemon.buffers);
    let hub = Arc::clone(&daemon.hub);
    let patterns = Arc::clone(&daemon.patterns);
    let persist = Arc::clone(&daemon.persist);
    daemon
        .pipeline
        .on_processed(move |event| {
            let sequence = buffers.append(&event.session_id, &event.data, event.timestamp_ms);
            hub.broadcast_output(&event.session_id, &event.data, sequence);

            let flat = buffers.snapshot(&event.session_id).data;
            patterns.evaluate(&event.session_id, &event.data, flat);

            persist.touch(&event.session_id);
        })
        .forever();

    // pattern engine events route through the hub to the clients
    // that asked for them
    let match_hub = Arc::clone(&daemon.hub);
    daemon.patterns.on_match(move |ev| match_hub.deliver_pattern_match(ev)).forever();
    let ansi_hub = Arc::clone(&daemon.hub);
    daemon.patterns.on_ansi(move |ev| ansi_hub.deliver_ansi(ev)).forever();

    // session end: durable flush first, then tell clients, then
    // release the in-memory spool and the session's matchers
    let end_persist = Arc::clone(&daemon.persist);
    let end_hub = Arc::clone(&daemon.hub);
    let end_buffers = Arc::clone(&daemon.buffers);
    let end_patterns = Arc::clone(&daemon.patterns);
    daemon
        .manager
        .on_session_end(move |end| {
            end_persist.flush_sync(&end.session_id);
            end_hub.notify_session_end(&end.session_id, end.code);
            end_buffers.clear(&end.session_id);
            end_patterns.remove_session(&end.session_id);
        })
        .forever();
}

impl Daemon {
    /// Graceful teardown in reverse dependency order: kill sessions
    /// (their end events flush transcripts), then flush any
    /// stragglers synchronously, then stop the workers and close
    /// client connections.
    #[instrument(skip_all)]
    pub fn shutdown(&self) {
        info!("shutting down: killing sessions");
        self.manager.shutdown();
        self.persist.flush_all_sync();
        self.persist.shutdown();
        self.patterns.shutdown();
        self.hub.shutdown();
    }
}

#[instrument(skip_all)]
pub fn run(
    config_manager: config::Manager,
    runtime_dir: PathBuf,
    socket: PathBuf,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    let daemon = build(config_manager, &runtime_dir)?;

    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent).context("creating socket dir")?;
    }
    let listener = UnixListener::bind(&socket).context("binding to socket")?;

    // spawn the signal handler thread in the background
    let signal_daemon = daemon.clone();
    signals::Handler::new(Some(socket.clone()), move || signal_daemon.shutdown()).spawn()?;

    server::Server::serve(Arc::clone(&daemon.hub), listener)?;

    std::fs::remove_file(socket).context("cleaning up socket on exit")?;
    daemon.shutdown();

    Ok(())
}
