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

use anyhow::{anyhow, Context};
use nix::unistd::{self, User};

/// The identity sessions launch as. Sessions with no explicit command
/// run `default_shell` as a login shell and start in `home_dir`; the
/// rest of the fields seed the rebuilt child environment.
#[derive(Debug, Clone)]
pub struct Info {
    pub default_shell: String,
    pub home_dir: String,
    pub user: String,
}

pub fn info() -> anyhow::Result<Info> {
    let uid = unistd::Uid::current();
    let entry = User::from_uid(uid)
        .context("reading passwd entry")?
        .ok_or_else(|| anyhow!("no passwd entry for uid {uid}"))?;

    let mut default_shell = entry.shell.to_string_lossy().into_owned();
    if default_shell.is_empty() {
        // daemons run as nologin-style accounts still get sessions
        default_shell = String::from("/bin/sh");
    }

    Ok(Info {
        default_shell,
        home_dir: entry.dir.to_string_lossy().into_owned(),
        user: entry.name,
    })
}
