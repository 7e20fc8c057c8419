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

//! Durable session records. One JSON file per session under
//! `<runtime_dir>/sessions`, written atomically by writing a temp
//! file in the same directory and renaming it over the target.
//!
//! The in-memory map is authoritative; disk writes are best effort
//! and failures are logged rather than propagated, so a full disk
//! degrades persistence without taking sessions down.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use shelltender_protocol::{PersistedSession, SessionStatus};
use tracing::{info, instrument, warn};

pub struct SessionStore {
    root: PathBuf,
    records: Mutex<HashMap<String, PersistedSession>>,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        SessionStore { root: root.as_ref().to_path_buf(), records: Mutex::new(HashMap::new()) }
    }

    /// Load all records from disk. Must complete before the daemon
    /// accepts traffic so reconnecting clients can see sessions from
    /// before a restart. Sessions that were live when the previous
    /// daemon died are downgraded to exited since their child
    /// processes did not survive it.
    #[instrument(skip_all)]
    pub fn initialize(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating session store dir {}", self.root.display()))?;

        let mut records = self.records.lock().unwrap();
        for dirent in fs::read_dir(&self.root).context("listing session store dir")? {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    warn!("skipping unreadable store dirent: {:?}", e);
                    continue;
                }
            };
            let path = dirent.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            match load_record(&path) {
                Ok(mut record) => {
                    if !record.session.status.is_terminal() {
                        record.session.status = SessionStatus::Exited(1);
                    }
                    records.insert(record.session.id.clone(), record);
                }
                Err(e) => {
                    warn!("skipping corrupt session record {}: {:?}", path.display(), e);
                }
            }
        }
        info!("loaded {} persisted session records", records.len());

        Ok(())
    }

    pub fn put(&self, record: PersistedSession) {
        let id = record.session.id.clone();
        self.records.lock().unwrap().insert(id.clone(), record.clone());
        self.write_through(&id, &record);
    }

    pub fn get(&self, id: &str) -> Option<PersistedSession> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn delete(&self, id: &str) {
        self.records.lock().unwrap().remove(id);
        let path = self.record_path(id);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not remove session record {}: {:?}", path.display(), e);
            }
        }
    }

    pub fn list_all(&self) -> Vec<PersistedSession> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Update just the session's lifecycle status.
    pub fn update_status(&self, id: &str, status: SessionStatus) {
        let record = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(id) {
                Some(record) => {
                    record.session.status = status;
                    record.clone()
                }
                None => return,
            }
        };
        self.write_through(id, &record);
    }

    /// Replace the stored flat buffer snapshot. Called through the
    /// persistence debouncer, never directly from the data path.
    pub fn update_buffer(&self, id: &str, flat: &str, last_sequence: u64) {
        let record = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(id) {
                Some(record) => {
                    record.buffer = String::from(flat);
                    record.last_sequence = last_sequence;
                    record.clone()
                }
                None => return,
            }
        };
        self.write_through(id, &record);
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn write_through(&self, id: &str, record: &PersistedSession) {
        if let Err(e) = self.write_record(id, record) {
            warn!("could not persist session {}: {:?}", id, e);
        }
    }

    fn write_record(&self, id: &str, record: &PersistedSession) -> anyhow::Result<()> {
        let body = serde_json::to_vec(record).context("serializing session record")?;

        // write-temp + rename so readers never observe a partial
        // record, even across a crash mid-write
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .context("creating temp file for session record")?;
        io::Write::write_all(&mut tmp, &body).context("writing session record")?;
        tmp.persist(self.record_path(id)).context("renaming session record into place")?;

        Ok(())
    }
}

fn load_record(path: &Path) -> anyhow::Result<PersistedSession> {
    let body = fs::read(path).context("reading session record")?;
    let record = serde_json::from_slice(&body).context("parsing session record")?;
    Ok(record)
}
