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

use std::{
    collections::HashMap,
    fs,
    ops::Deref,
    path::PathBuf,
    sync::{Arc, RwLock, RwLockReadGuard},
    time,
};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument, warn};

use crate::{config_watcher, consts, user};

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Some(config_path) = default_config_path() {
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

fn default_config_path() -> Option<PathBuf> {
    let user_info = user::info().ok()?;
    let mut config_path = PathBuf::from(user_info.home_dir);
    config_path.push(".config");
    config_path.push("shelltender");
    config_path.push("config.toml");
    Some(config_path)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// shell overrides the user's default shell for sessions that
    /// don't name a command of their own
    pub shell: Option<String>,

    /// norc makes it so that new shells do not load rc files
    /// when they spawn. Only works with bash.
    pub norc: Option<bool>,

    /// Disable the tty echo flag for spawned sessions. You likely
    /// don't want to set this, but if you plan on interacting
    /// programatically with the sessions it can make the output
    /// easier to parse.
    pub noecho: Option<bool>,

    /// a table of environment variables to inject into every
    /// spawned session
    pub env: Option<HashMap<String, String>>,

    /// The initial path to spawn session processes with. By default
    /// `/usr/bin:/bin:/usr/sbin:/sbin` (copying openssh).
    pub initial_path: Option<String>,

    /// Cap on the total retained output bytes per session.
    /// By default, 100000 bytes.
    pub buffer_cap_bytes: Option<usize>,

    /// Largest input message a client may send. By default 10KiB.
    pub max_inbound_chunk_bytes: Option<usize>,

    /// Idle milliseconds before a session's buffer is snapshotted to
    /// disk. By default 1000.
    pub persist_debounce_ms: Option<u64>,

    /// How long to wait after a SIGHUP before escalating to SIGKILL
    /// when killing a session. By default 2000.
    pub kill_grace_ms: Option<u64>,

    /// Per-client unsent output cap before the client is declared
    /// lagged and disconnected. By default 1MiB.
    pub send_queue_cap_bytes: Option<usize>,

    /// Configuration for the output processing pipeline.
    pub pipeline: Option<PipelineConfig>,
}

impl Config {
    pub fn buffer_cap_bytes(&self) -> usize {
        self.buffer_cap_bytes.unwrap_or(consts::DEFAULT_BUFFER_CAP_BYTES)
    }

    pub fn max_inbound_chunk_bytes(&self) -> usize {
        self.max_inbound_chunk_bytes.unwrap_or(consts::MAX_INBOUND_CHUNK_BYTES)
    }

    pub fn persist_debounce(&self) -> time::Duration {
        self.persist_debounce_ms
            .map(time::Duration::from_millis)
            .unwrap_or(consts::DEFAULT_PERSIST_DEBOUNCE)
    }

    pub fn kill_grace(&self) -> time::Duration {
        self.kill_grace_ms.map(time::Duration::from_millis).unwrap_or(consts::DEFAULT_KILL_GRACE)
    }

    pub fn send_queue_cap_bytes(&self) -> usize {
        self.send_queue_cap_bytes.unwrap_or(consts::DEFAULT_SEND_QUEUE_CAP_BYTES)
    }
}

/// Stage toggles and tunables for the output pipeline. Stages are
/// assembled in a fixed relative order; the config only controls
/// which are present and their parameters.
#[derive(Deserialize, Default, Debug, Clone)]
pub struct PipelineConfig {
    /// Regexes whose matches are replaced with `[REDACTED]` in all
    /// output, buffers, and persisted snapshots.
    pub redact_patterns: Option<Vec<String>>,

    /// Replace 13-19 digit runs with `[CREDIT_CARD_REDACTED]`.
    pub credit_card_redact: Option<bool>,

    /// Only redact digit runs that pass a Luhn check. Has no effect
    /// unless credit_card_redact is on.
    pub luhn_check: Option<bool>,

    /// Token bucket cap on output bytes per second per session.
    /// Chunks over the budget are dropped. By default 1MiB/s;
    /// set to 0 to disable rate limiting entirely.
    pub rate_limit_bytes_per_sec: Option<usize>,

    /// Rewrite \r\n to \n in output.
    pub normalize_line_endings: Option<bool>,

    /// Strip ANSI escape sequences from output.
    pub strip_ansi: Option<bool>,

    /// Drop chunks larger than this many bytes.
    pub max_chunk_bytes: Option<usize>,

    /// Drop chunks containing NUL bytes.
    pub reject_binary: Option<bool>,

    /// If set, only sessions named here flow through the pipeline at
    /// all; output from other sessions is blocked.
    pub session_allowlist: Option<Vec<String>>,
}

/// Shared handle on the live config. The daemon re-reads the config
/// file when the watcher reports a change, so holders should call
/// `get()` per operation rather than caching values.
#[derive(Clone)]
pub struct Manager {
    config: Arc<RwLock<Config>>,
    config_file: Option<String>,
    // kept alive for its watch on the config file
    _watcher: Option<Arc<config_watcher::ConfigWatcher>>,
}

impl Manager {
    /// Load the config and start watching the file (when there is
    /// one) for updates.
    pub fn new(config_file: Option<String>) -> anyhow::Result<Self> {
        let config = Arc::new(RwLock::new(read_config(&config_file)?));

        let watch_path = match &config_file {
            Some(p) => Some(PathBuf::from(p)),
            None => default_config_path(),
        };
        let watcher = match watch_path {
            Some(path) => {
                let reload_config = Arc::clone(&config);
                let reload_file = config_file.clone();
                match config_watcher::ConfigWatcher::new(path, move || {
                    match read_config(&reload_file) {
                        Ok(fresh) => {
                            info!("reloaded config");
                            *reload_config.write().unwrap() = fresh;
                        }
                        Err(e) => warn!("could not reload config: {:?}", e),
                    }
                }) {
                    Ok(w) => Some(Arc::new(w)),
                    Err(e) => {
                        warn!("could not set up config watcher: {:?}", e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(Manager { config, config_file, _watcher: watcher })
    }

    /// Wrap a fixed config with no file backing it. Used by tests and
    /// embedders that manage configuration themselves.
    pub fn from_config(config: Config) -> Self {
        Manager { config: Arc::new(RwLock::new(config)), config_file: None, _watcher: None }
    }

    pub fn get(&self) -> impl Deref<Target = Config> + '_ {
        ConfigGuard(self.config.read().unwrap())
    }

    pub fn config_file(&self) -> Option<&str> {
        self.config_file.as_deref()
    }
}

struct ConfigGuard<'a>(RwLockReadGuard<'a, Config>);

impl Deref for ConfigGuard<'_> {
    type Target = Config;

    fn deref(&self) -> &Config {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse() -> anyhow::Result<()> {
        let cases = vec![
            r#"
            shell = "/bin/zsh"
            "#,
            r#"
            buffer_cap_bytes = 1024
            persist_debounce_ms = 250
            "#,
            r#"
            [pipeline]
            redact_patterns = ["password:\\s*\\S+"]
            credit_card_redact = true
            rate_limit_bytes_per_sec = 65536
            "#,
            r#"
            [pipeline]
            session_allowlist = ["s1", "s2"]
            "#,
        ];

        for case in cases.into_iter() {
            let _: Config = toml::from_str(case)?;
        }

        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn defaults_applied() {
        let config = Config::default();
        assert_eq!(config.buffer_cap_bytes(), consts::DEFAULT_BUFFER_CAP_BYTES);
        assert_eq!(config.persist_debounce(), consts::DEFAULT_PERSIST_DEBOUNCE);
        assert_eq!(config.kill_grace(), consts::DEFAULT_KILL_GRACE);
        assert_eq!(config.send_queue_cap_bytes(), consts::DEFAULT_SEND_QUEUE_CAP_BYTES);
    }

    #[test]
    #[timeout(30000)]
    fn manager_reflects_updates() {
        let manager = Manager::from_config(Config::default());
        assert!(manager.get().shell.is_none());

        *manager.config.write().unwrap() =
            toml::from_str(r#"shell = "/bin/zsh""#).expect("config to parse");
        assert_eq!(manager.get().shell.as_deref(), Some("/bin/zsh"));
    }
}
