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

//! Notify watcher to detect config file changes.
//!
//! The watch is placed on the config file's parent directory so that
//! editors which replace the file (write temp, rename over) keep
//! being observed. Change bursts are debounced; the handler fires
//! once per quiet period.

use std::{
    path::PathBuf,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context as _, Result};
use crossbeam_channel::{select, unbounded, Sender};
use notify::{recommended_watcher, RecursiveMode, Watcher as _};
use tracing::{debug, error, instrument, warn};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

pub struct ConfigWatcher {
    /// For shutting the worker down on drop.
    tx: Sender<()>,

    /// Handle to worker thread
    #[allow(unused)]
    worker: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `path`, calling `handler` (debounced) whenever it may
    /// have changed. The handler runs on the worker thread, so it is
    /// expected to handle its own synchronization.
    #[instrument(skip_all)]
    pub fn new(path: PathBuf, handler: impl FnMut() + Send + 'static) -> Result<Self> {
        Self::with_debounce(path, handler, RELOAD_DEBOUNCE)
    }

    #[instrument(skip_all)]
    pub fn with_debounce(
        path: PathBuf,
        handler: impl FnMut() + Send + 'static,
        reload_debounce: Duration,
    ) -> Result<Self> {
        let (notify_tx, notify_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();

        let mut watcher = recommended_watcher(notify_tx).context("create notify watcher")?;
        let watch_dir = path
            .parent()
            .ok_or(anyhow!("config path has no parent directory"))?
            .to_path_buf();
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("adding notify watch on {}", watch_dir.display()))?;

        let mut inner = Inner {
            target: path,
            reload_debounce,
            reload_deadline: None,
            handler,
            // moved into the worker so the watch stays alive
            _watcher: watcher,
            notify_rx,
            shutdown_rx,
        };
        let worker = thread::Builder::new()
            .name(String::from("config-reload"))
            .spawn(move || inner.run())
            .context("create config reload thread")?;

        Ok(Self { tx: shutdown_tx, worker })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        if let Err(err) = self.tx.send(()) {
            warn!("config watcher thread already died: {:?}", err);
        }
    }
}

struct Inner<Handler> {
    target: PathBuf,
    reload_debounce: Duration,
    reload_deadline: Option<Instant>,
    handler: Handler,
    _watcher: notify::RecommendedWatcher,
    notify_rx: crossbeam_channel::Receiver<notify::Result<notify::Event>>,
    shutdown_rx: crossbeam_channel::Receiver<()>,
}

impl<Handler> Inner<Handler>
where
    Handler: FnMut(),
{
    fn run(&mut self) {
        loop {
            // only impose a deadline if there is a pending reload
            let timeout = self
                .reload_deadline
                .map(crossbeam_channel::at)
                .unwrap_or_else(crossbeam_channel::never);

            select! {
                recv(self.notify_rx) -> res => {
                    match res {
                        Ok(Ok(event)) => {
                            if self.is_relevant(&event) {
                                debug!("config event: {:?}", event);
                                self.reload_deadline = self
                                    .reload_deadline
                                    .or_else(|| Some(Instant::now() + self.reload_debounce));
                            }
                        }
                        Ok(Err(err)) => {
                            // watch errors are worth a reload attempt since we
                            // may have missed the event that mattered
                            error!("notify error: {:?}", err);
                            self.reload_deadline = self
                                .reload_deadline
                                .or_else(|| Some(Instant::now() + self.reload_debounce));
                        }
                        Err(_) => {
                            debug!("notify channel closed, stopping watcher thread");
                            return;
                        }
                    }
                }
                recv(timeout) -> _ => {
                    self.reload_deadline = None;
                    (self.handler)();
                }
                recv(self.shutdown_rx) -> _ => {
                    debug!("stopping config watcher thread");
                    return;
                }
            }
        }
    }

    fn is_relevant(&self, event: &notify::Event) -> bool {
        event.need_rescan() || event.paths.iter().any(|p| p == &self.target)
    }
}
