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

//! Framing for the client-daemon protocol. Each frame is a 4 byte
//! little endian length prefix followed by one JSON document. The
//! framing is transport agnostic; the daemon listens on a unix
//! socket, but anything byte-stream shaped works.

use std::{
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use serde::{Deserialize, Serialize};
use shelltender_protocol::{ClientMessage, ServerMessage};

use crate::consts;

/// The centralized encoding function that should be used for all
/// protocol serialization.
pub fn encode_to<T, W>(d: &T, mut w: W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    let body = serde_json::to_vec(d).context("serializing frame body")?;
    if body.len() > consts::MAX_FRAME_BYTES {
        return Err(anyhow!(
            "frame of size {} exceeds size limit of {} bytes",
            body.len(),
            consts::MAX_FRAME_BYTES
        ));
    }
    w.write_u32::<LittleEndian>(body.len() as u32).context("writing length prefix")?;
    w.write_all(&body).context("writing frame body")?;
    w.flush().context("flushing frame")?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// protocol deserialization.
pub fn decode_from<T, R>(mut r: R) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let buf = read_frame(&mut r)?;
    let d: T = serde_json::from_slice(&buf).context("deserializing frame body")?;
    Ok(d)
}

/// Read one raw frame body off the stream without interpreting it.
pub fn read_frame<R: Read>(r: &mut R) -> anyhow::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>().context("reading length prefix")? as usize;
    if len > consts::MAX_FRAME_BYTES {
        return Err(anyhow!(
            "frame of size {} exceeds size limit of {} bytes",
            len,
            consts::MAX_FRAME_BYTES
        ));
    }
    let mut buf = vec![0; len];
    r.read_exact(&mut buf).context("reading frame body")?;
    Ok(buf)
}

/// Serialize a server message into a ready-to-write frame. The hub
/// uses this to serialize a broadcast once and hand the same bytes to
/// every attached client's writer.
pub fn to_frame(msg: &ServerMessage) -> anyhow::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg).context("serializing server message")?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.write_u32::<LittleEndian>(body.len() as u32)?;
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// A simple blocking protocol client, used by the `list` and `kill`
/// subcommands (and by tests).
pub struct Client {
    stream: UnixStream,
}

impl Client {
    pub fn new<P: AsRef<Path>>(sock: P) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(sock).context("connecting to daemon")?;
        Ok(Client { stream })
    }

    /// Bound how long `recv` will block. Mostly for tests and probes;
    /// interactive clients want the default of no timeout.
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Close the connection for both directions.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }

    pub fn send(&mut self, msg: &ClientMessage) -> anyhow::Result<()> {
        encode_to(msg, &mut self.stream).context("writing client message")
    }

    pub fn recv(&mut self) -> anyhow::Result<ServerMessage> {
        decode_from(&mut self.stream).context("reading server message")
    }

    /// Receive messages until one passes the given predicate,
    /// discarding broadcast traffic (output chunks and the like) that
    /// arrives ahead of the reply we care about.
    pub fn recv_matching(
        &mut self,
        mut pred: impl FnMut(&ServerMessage) -> bool,
    ) -> anyhow::Result<ServerMessage> {
        loop {
            let msg = self.recv()?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }
}

/// Classify an IO error as a peer hangup. Hangups are routine (a
/// client closing its terminal) and get logged at info rather than
/// treated as daemon errors.
pub fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let cases = vec![
            ClientMessage::AdminListSessions,
            ClientMessage::Input {
                session_id: String::from("S1"),
                data: String::from("echo hi\n"),
            },
            ClientMessage::Connect { session_id: String::from("S1"), from_seq: None },
        ];

        for msg in cases.into_iter() {
            let mut buf = io::Cursor::new(vec![]);
            encode_to(&msg, &mut buf).expect("encode to succeed");
            buf.set_position(0);
            let round_tripped: ClientMessage = decode_from(&mut buf).expect("decode to succeed");
            assert_eq!(round_tripped, msg);
        }
    }

    #[test]
    fn multiple_frames_on_one_stream() {
        let mut buf = io::Cursor::new(vec![]);
        let first = ClientMessage::Kill { session_id: String::from("a") };
        let second = ClientMessage::Kill { session_id: String::from("b") };
        encode_to(&first, &mut buf).unwrap();
        encode_to(&second, &mut buf).unwrap();

        buf.set_position(0);
        let got_first: ClientMessage = decode_from(&mut buf).unwrap();
        let got_second: ClientMessage = decode_from(&mut buf).unwrap();
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = io::Cursor::new(vec![]);
        buf.write_u32::<LittleEndian>((consts::MAX_FRAME_BYTES + 1) as u32).unwrap();
        buf.set_position(0);

        let res: anyhow::Result<ClientMessage> = decode_from(&mut buf);
        let errstr = format!("{:?}", res.expect_err("oversized frame to be rejected"));
        assert!(errstr.contains("exceeds size limit"), "{errstr}");
    }

    #[test]
    fn to_frame_matches_encode_to() {
        let msg = ServerMessage::Error { message: String::from("nope") };
        let frame = to_frame(&msg).unwrap();

        let mut buf = io::Cursor::new(vec![]);
        encode_to(&msg, &mut buf).unwrap();
        assert_eq!(frame, buf.into_inner());
    }
}
