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

//! An online scanner for ANSI escape sequences in the output stream.
//! The scanner keeps its state between chunks, so a sequence split
//! across two pty reads is reassembled and reported exactly once; a
//! partial sequence is never reported as a match.

use shelltender_protocol::AnsiCategory;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

// A runaway "sequence" (binary data that happens to start with ESC)
// gets flushed as Other rather than buffered forever.
const MAX_SEQ_LEN: usize = 4096;

/// One complete escape sequence found in a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AnsiSeq {
    pub category: AnsiCategory,
    /// The full sequence bytes, including any prefix carried over
    /// from a previous chunk.
    pub raw: Vec<u8>,
    /// Offset of the byte after the sequence within the current
    /// chunk. For sequences that began in an earlier chunk this is
    /// where the tail ended, not where the sequence started.
    pub end_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Ground,
    /// Seen ESC, waiting to learn the sequence family.
    Escape,
    /// Inside a CSI sequence, accumulating until a final byte.
    Csi,
    /// Inside an OSC string, terminated by BEL or ESC-backslash.
    Osc,
    /// Seen ESC inside an OSC string; a following backslash is the
    /// string terminator.
    OscEsc,
}

#[derive(Debug)]
pub struct AnsiScanner {
    state: State,
    pending: Vec<u8>,
}

impl Default for AnsiScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiScanner {
    pub fn new() -> Self {
        AnsiScanner { state: State::Ground, pending: vec![] }
    }

    /// Scan one chunk, returning every sequence completed within it.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<AnsiSeq> {
        let mut found = vec![];

        for (i, byte) in chunk.iter().copied().enumerate() {
            match self.state {
                State::Ground => {
                    if byte == ESC {
                        self.pending.push(byte);
                        self.state = State::Escape;
                    }
                }
                State::Escape => {
                    self.pending.push(byte);
                    match byte {
                        b'[' => self.state = State::Csi,
                        b']' => self.state = State::Osc,
                        // ESC ESC: stay in escape, restart the sequence
                        ESC => {
                            self.pending.clear();
                            self.pending.push(ESC);
                        }
                        _ => {
                            // two-byte escape (ESC c, ESC 7, charset
                            // selection and friends)
                            self.complete(categorize_escape(byte), i + 1, &mut found);
                        }
                    }
                }
                State::Csi => {
                    self.pending.push(byte);
                    if (0x40..=0x7e).contains(&byte) {
                        self.complete(categorize_csi(byte), i + 1, &mut found);
                    } else if self.pending.len() > MAX_SEQ_LEN {
                        self.complete(AnsiCategory::Other, i + 1, &mut found);
                    }
                }
                State::Osc => {
                    self.pending.push(byte);
                    if byte == BEL {
                        self.complete(AnsiCategory::Osc, i + 1, &mut found);
                    } else if byte == ESC {
                        self.state = State::OscEsc;
                    } else if self.pending.len() > MAX_SEQ_LEN {
                        self.complete(AnsiCategory::Other, i + 1, &mut found);
                    }
                }
                State::OscEsc => {
                    self.pending.push(byte);
                    if byte == b'\\' {
                        self.complete(AnsiCategory::Osc, i + 1, &mut found);
                    } else {
                        self.state = State::Osc;
                    }
                }
            }
        }

        found
    }

    fn complete(&mut self, category: AnsiCategory, end_offset: usize, found: &mut Vec<AnsiSeq>) {
        found.push(AnsiSeq { category, raw: std::mem::take(&mut self.pending), end_offset });
        self.state = State::Ground;
    }
}

fn categorize_csi(final_byte: u8) -> AnsiCategory {
    match final_byte {
        // cursor movement, position set, save/restore
        b'A'..=b'H' | b'f' | b's' | b'u' | b'd' | b'G' => AnsiCategory::Cursor,
        // select graphic rendition
        b'm' => AnsiCategory::Color,
        // erase display / erase line
        b'J' | b'K' => AnsiCategory::Clear,
        _ => AnsiCategory::Other,
    }
}

fn categorize_escape(byte: u8) -> AnsiCategory {
    match byte {
        // RIS full reset
        b'c' => AnsiCategory::Clear,
        // DECSC / DECRC cursor save and restore
        b'7' | b'8' => AnsiCategory::Cursor,
        _ => AnsiCategory::Esc,
    }
}

#[cfg(test)]
mod test {
    use ntest::timeout;

    use super::*;

    fn categories(scanner: &mut AnsiScanner, chunk: &[u8]) -> Vec<AnsiCategory> {
        scanner.scan(chunk).into_iter().map(|s| s.category).collect()
    }

    #[test]
    #[timeout(30000)]
    fn classifies_common_sequences() {
        let cases: Vec<(&[u8], Vec<AnsiCategory>)> = vec![
            (b"\x1b[31m", vec![AnsiCategory::Color]),
            (b"\x1b[0m", vec![AnsiCategory::Color]),
            (b"\x1b[2J", vec![AnsiCategory::Clear]),
            (b"\x1b[K", vec![AnsiCategory::Clear]),
            (b"\x1b[3A", vec![AnsiCategory::Cursor]),
            (b"\x1b[10;20H", vec![AnsiCategory::Cursor]),
            (b"\x1b]0;title\x07", vec![AnsiCategory::Osc]),
            (b"\x1b]0;title\x1b\\", vec![AnsiCategory::Osc]),
            (b"\x1bc", vec![AnsiCategory::Clear]),
            (b"\x1b7", vec![AnsiCategory::Cursor]),
            (b"\x1b(B", vec![AnsiCategory::Esc]),
            (b"\x1b[?25l", vec![AnsiCategory::Other]),
            (b"plain text, no escapes", vec![]),
            (
                b"red: \x1b[31mtext\x1b[0m done",
                vec![AnsiCategory::Color, AnsiCategory::Color],
            ),
        ];

        for (input, want) in cases.into_iter() {
            let mut scanner = AnsiScanner::new();
            let got = categories(&mut scanner, input);
            assert_eq!(got, want, "input: {:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    #[timeout(30000)]
    fn split_sequence_reassembles_across_chunks() {
        let mut scanner = AnsiScanner::new();

        // split mid-CSI
        assert!(scanner.scan(b"before \x1b[3").is_empty());
        let got = scanner.scan(b"1m after");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].category, AnsiCategory::Color);
        assert_eq!(got[0].raw, b"\x1b[31m");
        // the tail ended after "1m" in the second chunk
        assert_eq!(got[0].end_offset, 2);
    }

    #[test]
    #[timeout(30000)]
    fn split_osc_reassembles() {
        let mut scanner = AnsiScanner::new();
        assert!(scanner.scan(b"\x1b]0;my ti").is_empty());
        let got = scanner.scan(b"tle\x07rest");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].category, AnsiCategory::Osc);
        assert_eq!(got[0].raw, b"\x1b]0;my title\x07");
    }

    #[test]
    #[timeout(30000)]
    fn partial_sequence_is_never_reported() {
        let mut scanner = AnsiScanner::new();
        assert!(scanner.scan(b"\x1b[31").is_empty());
        assert!(scanner.scan(b";4").is_empty());
        // still pending, nothing spurious emitted
        assert_eq!(scanner.scan(b"2m").len(), 1);
    }

    #[test]
    #[timeout(30000)]
    fn runaway_sequence_flushes_as_other() {
        let mut scanner = AnsiScanner::new();
        scanner.scan(b"\x1b[");
        let junk = vec![b'0'; MAX_SEQ_LEN + 10];
        let got = scanner.scan(&junk);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].category, AnsiCategory::Other);
    }
}
