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

use std::{env, path::PathBuf};

use anyhow::{anyhow, Context};
use shelltender_protocol::{ClientMessage, ServerMessage};

use crate::{consts, protocol};

pub fn run(mut sessions: Vec<String>, socket: PathBuf) -> anyhow::Result<()> {
    // with no id argument, fall back to the session this command is
    // being typed inside of
    if sessions.is_empty() {
        match env::var(consts::SESSION_ID_VAR) {
            Ok(current) => sessions.push(current),
            Err(_) => {
                eprintln!("no session to kill");
                return Err(anyhow!("no session to kill (pass an id or run inside a session)"));
            }
        }
    }

    let mut client = match protocol::Client::new(&socket) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("could not connect to daemon");
            return Err(err).context("connecting to daemon");
        }
    };

    let mut failed = vec![];
    for session_id in sessions.into_iter() {
        client
            .send(&ClientMessage::Kill { session_id: session_id.clone() })
            .context("sending kill request")?;

        // A successful kill has no direct ack (attached clients learn
        // about it from the session-end broadcast), so probe with a
        // list request: the daemon handles messages from one client
        // in order, and any kill error lands before the list reply.
        client.send(&ClientMessage::AdminListSessions).context("sending list probe")?;
        let mut kill_error = None;
        loop {
            match client.recv().context("reading kill outcome")? {
                ServerMessage::Error { message } => kill_error = Some(message),
                ServerMessage::AdminSessionsList { .. } => break,
                _ => {}
            }
        }
        if let Some(message) = kill_error {
            eprintln!("{session_id}: {message}");
            failed.push(session_id);
        }
    }

    if !failed.is_empty() {
        return Err(anyhow!("could not kill: {}", failed.join(" ")));
    }

    Ok(())
}
