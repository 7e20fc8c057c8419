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

use std::{path::PathBuf, time};

use anyhow::{anyhow, Context};
use shelltender_protocol::{ClientMessage, ServerMessage};

use crate::protocol;

pub fn run(socket: PathBuf) -> anyhow::Result<()> {
    let mut client = match protocol::Client::new(&socket) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("could not connect to daemon");
            return Err(err).context("connecting to daemon");
        }
    };

    client.send(&ClientMessage::AdminListSessions).context("sending list request")?;
    let reply = client
        .recv_matching(|msg| {
            matches!(msg, ServerMessage::AdminSessionsList { .. } | ServerMessage::Error { .. })
        })
        .context("reading reply")?;

    let sessions = match reply {
        ServerMessage::AdminSessionsList { sessions } => sessions,
        ServerMessage::Error { message } => return Err(anyhow!("daemon error: {}", message)),
        _ => unreachable!("recv_matching only returns list or error"),
    };

    println!("ID\tCOMMAND\tCREATED_AT\tSTATUS");
    for session in sessions.iter() {
        let created_at =
            time::UNIX_EPOCH + time::Duration::from_millis(session.created_at);
        let created_at = chrono::DateTime::<chrono::Utc>::from(created_at);
        println!(
            "{}\t{}\t{}\t{}",
            session.id,
            session.command,
            created_at.to_rfc3339(),
            session.status
        );
    }

    Ok(())
}
