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

//! The pattern engine. Holds registered matchers per session and
//! evaluates them against every processed output chunk, emitting
//! structured match events plus classification events for every ANSI
//! escape sequence it sees.
//!
//! Evaluation runs on a dedicated worker thread fed by a channel so
//! regex work never stalls the pty read path. Jobs for one session
//! are evaluated in submission order.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use regex::Regex;
use shelltender_protocol::{AnsiCategory, PatternKind, PatternSpec};
use tracing::{debug, error, info, span, warn, Level};

use super::{
    ansi::{AnsiScanner, AnsiSeq},
    unix_ms,
};
use crate::{
    consts,
    events::{Notifier, Subscription},
};

/// A matcher fired.
#[derive(Debug, Clone)]
pub struct PatternMatchEvent {
    pub session_id: String,
    pub pattern_id: String,
    pub name: String,
    pub matched: String,
    /// Byte offset within the haystack the matcher ran against: the
    /// chunk for chunk-scoped matchers, the flat buffer for multiline
    /// regex and custom matchers.
    pub position: u64,
    pub groups: Option<HashMap<String, String>>,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// An ANSI escape sequence was detected in a session's output.
#[derive(Debug, Clone)]
pub struct AnsiSequenceEvent {
    pub session_id: String,
    pub category: AnsiCategory,
    pub raw: String,
    pub timestamp: u64,
}

/// What a custom matcher reports when it fires.
#[derive(Debug, Clone)]
pub struct CustomHit {
    pub matched: String,
    pub position: u64,
    pub groups: Option<HashMap<String, String>>,
}

/// Embedder-supplied matcher callable: `(chunk, flat_buffer)`.
pub type CustomMatcher = Box<dyn Fn(&[u8], &[u8]) -> Option<CustomHit> + Send>;

enum Matcher {
    Literal { needle: String, case_sensitive: bool },
    LiteralSet { needles: Vec<String>, case_sensitive: bool },
    Regex { re: Regex, multiline: bool },
    AnsiClass { class: AnsiCategory },
    Custom { f: CustomMatcher },
}

struct Registration {
    pattern_id: String,
    name: String,
    matcher: Matcher,
    debounce: Option<Duration>,
    last_match_at: Option<Instant>,
    match_count: u64,
}

struct Hit {
    matched: String,
    position: u64,
    groups: Option<HashMap<String, String>>,
}

enum Job {
    Evaluate { session_id: String, chunk: Vec<u8>, flat: Vec<u8> },
    RemoveSession(String),
    Shutdown,
}

type SessionRegistry = Arc<Mutex<Vec<Registration>>>;

pub struct PatternEngine {
    registries: Arc<Mutex<HashMap<String, SessionRegistry>>>,
    next_id: AtomicU64,
    matches: Notifier<PatternMatchEvent>,
    ansi: Notifier<AnsiSequenceEvent>,
    jobs: crossbeam_channel::Sender<Job>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PatternEngine {
    pub fn new() -> anyhow::Result<Self> {
        let registries: Arc<Mutex<HashMap<String, SessionRegistry>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let matches = Notifier::new();
        let ansi = Notifier::new();

        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let worker_registries = Arc::clone(&registries);
        let worker_matches = matches.clone();
        let worker_ansi = ansi.clone();
        let worker = thread::Builder::new()
            .name(String::from("pattern-eval"))
            .spawn(move || {
                run_worker(jobs_rx, worker_registries, worker_matches, worker_ansi);
            })
            .context("spawning pattern evaluation thread")?;

        Ok(PatternEngine {
            registries,
            next_id: AtomicU64::new(0),
            matches,
            ansi,
            jobs: jobs_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Register a declarative (wire-expressible) matcher. Regexes are
    /// compiled here, once, so a bad pattern fails the registration
    /// rather than the stream.
    pub fn register(&self, session_id: &str, spec: &PatternSpec) -> anyhow::Result<String> {
        let case_sensitive = spec.options.case_sensitive.unwrap_or(true);
        let matcher = match &spec.kind {
            PatternKind::Literal { pattern } => {
                Matcher::Literal { needle: pattern.clone(), case_sensitive }
            }
            PatternKind::LiteralSet { patterns } => {
                Matcher::LiteralSet { needles: patterns.clone(), case_sensitive }
            }
            PatternKind::Regex { pattern } => {
                let re = regex::RegexBuilder::new(pattern)
                    .case_insensitive(!case_sensitive)
                    .multi_line(spec.options.multiline)
                    .build()
                    .with_context(|| format!("compiling pattern regex '{pattern}'"))?;
                Matcher::Regex { re, multiline: spec.options.multiline }
            }
            PatternKind::AnsiClass { class } => Matcher::AnsiClass { class: *class },
        };

        Ok(self.insert(session_id, &spec.name, matcher, spec.options.debounce_ms))
    }

    /// Register an opaque matcher callable. Only reachable from
    /// embedding code; the wire protocol cannot express these.
    pub fn register_custom(
        &self,
        session_id: &str,
        name: &str,
        debounce_ms: Option<u64>,
        f: CustomMatcher,
    ) -> String {
        self.insert(session_id, name, Matcher::Custom { f }, debounce_ms)
    }

    fn insert(
        &self,
        session_id: &str,
        name: &str,
        matcher: Matcher,
        debounce_ms: Option<u64>,
    ) -> String {
        let pattern_id = format!("p-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            pattern_id: pattern_id.clone(),
            name: String::from(name),
            matcher,
            debounce: debounce_ms.map(Duration::from_millis),
            last_match_at: None,
            match_count: 0,
        };

        let registry = {
            let mut registries = self.registries.lock().unwrap();
            Arc::clone(
                registries.entry(String::from(session_id)).or_insert_with(Default::default),
            )
        };
        registry.lock().unwrap().push(registration);
        info!("registered pattern {} on session {}", pattern_id, session_id);

        pattern_id
    }

    /// Remove one matcher. Events already emitted stay delivered;
    /// returns false if the pattern was not registered.
    pub fn unregister(&self, session_id: &str, pattern_id: &str) -> bool {
        let registry = {
            let registries = self.registries.lock().unwrap();
            match registries.get(session_id) {
                Some(r) => Arc::clone(r),
                None => return false,
            }
        };

        let mut registry = registry.lock().unwrap();
        let before = registry.len();
        registry.retain(|r| r.pattern_id != pattern_id);
        before != registry.len()
    }

    /// Deleting a session cascades to its patterns and scanner state.
    pub fn remove_session(&self, session_id: &str) {
        self.registries.lock().unwrap().remove(session_id);
        if self.jobs.send(Job::RemoveSession(String::from(session_id))).is_err() {
            warn!("pattern worker gone, scanner state for {} leaks", session_id);
        }
    }

    /// Queue a chunk for evaluation. `flat` is the session's current
    /// scrollback including this chunk at its tail; context-sensitive
    /// matchers run against it.
    pub fn evaluate(&self, session_id: &str, chunk: &[u8], flat: Vec<u8>) {
        let job = Job::Evaluate {
            session_id: String::from(session_id),
            chunk: chunk.to_vec(),
            flat,
        };
        if self.jobs.send(job).is_err() {
            error!("pattern worker gone, dropping evaluation for {}", session_id);
        }
    }

    pub fn on_match(
        &self,
        callback: impl Fn(&PatternMatchEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.matches.subscribe(callback)
    }

    pub fn on_ansi(
        &self,
        callback: impl Fn(&AnsiSequenceEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.ansi.subscribe(callback)
    }

    /// Stop the worker after draining queued evaluations.
    pub fn shutdown(&self) {
        if self.jobs.send(Job::Shutdown).is_ok() {
            if let Some(worker) = self.worker.lock().unwrap().take() {
                if worker.join().is_err() {
                    error!("pattern worker panicked during shutdown");
                }
            }
        }
    }
}

fn run_worker(
    jobs: crossbeam_channel::Receiver<Job>,
    registries: Arc<Mutex<HashMap<String, SessionRegistry>>>,
    matches: Notifier<PatternMatchEvent>,
    ansi: Notifier<AnsiSequenceEvent>,
) {
    let _s = span!(Level::INFO, "pattern_eval").entered();
    let mut scanners: HashMap<String, AnsiScanner> = HashMap::new();

    for job in jobs.iter() {
        match job {
            Job::Evaluate { session_id, chunk, flat } => {
                let seqs =
                    scanners.entry(session_id.clone()).or_default().scan(&chunk);
                for seq in seqs.iter() {
                    ansi.emit(&AnsiSequenceEvent {
                        session_id: session_id.clone(),
                        category: seq.category,
                        raw: String::from_utf8_lossy(&seq.raw).into_owned(),
                        timestamp: unix_ms(),
                    });
                }

                let registry = {
                    let registries = registries.lock().unwrap();
                    registries.get(&session_id).map(Arc::clone)
                };
                if let Some(registry) = registry {
                    evaluate_registry(&session_id, &registry, &chunk, &flat, &seqs, &matches);
                }
            }
            Job::RemoveSession(session_id) => {
                scanners.remove(&session_id);
            }
            Job::Shutdown => {
                debug!("pattern worker shutting down");
                return;
            }
        }
    }
}

fn evaluate_registry(
    session_id: &str,
    registry: &SessionRegistry,
    chunk: &[u8],
    flat: &[u8],
    seqs: &[AnsiSeq],
    matches: &Notifier<PatternMatchEvent>,
) {
    // evaluation holds the registry lock, so registration order is
    // also delivery order and match state updates are race free
    let mut registry = registry.lock().unwrap();
    for reg in registry.iter_mut() {
        let started = Instant::now();
        let hit = run_matcher(&reg.matcher, chunk, flat, seqs);
        let elapsed = started.elapsed();
        if elapsed > consts::SLOW_MATCH_WARN {
            warn!(
                "slow pattern match: {} ({}) took {}ms on session {}",
                reg.name,
                reg.pattern_id,
                elapsed.as_millis(),
                session_id
            );
        }

        let hit = match hit {
            Some(h) => h,
            None => continue,
        };

        if let (Some(debounce), Some(last)) = (reg.debounce, reg.last_match_at) {
            if last.elapsed() < debounce {
                debug!("debouncing match on {} ({})", reg.name, reg.pattern_id);
                continue;
            }
        }
        reg.last_match_at = Some(Instant::now());
        reg.match_count += 1;

        matches.emit(&PatternMatchEvent {
            session_id: String::from(session_id),
            pattern_id: reg.pattern_id.clone(),
            name: reg.name.clone(),
            matched: hit.matched,
            position: hit.position,
            groups: hit.groups,
            timestamp: unix_ms(),
        });
    }
}

fn run_matcher(matcher: &Matcher, chunk: &[u8], flat: &[u8], seqs: &[AnsiSeq]) -> Option<Hit> {
    match matcher {
        Matcher::Literal { needle, case_sensitive } => {
            find_literal(chunk, needle.as_bytes(), *case_sensitive).map(|pos| Hit {
                matched: String::from_utf8_lossy(&chunk[pos..pos + needle.len()]).into_owned(),
                position: pos as u64,
                groups: None,
            })
        }
        Matcher::LiteralSet { needles, case_sensitive } => {
            // earliest position wins, ties go to the first needle
            let mut best: Option<(usize, &str)> = None;
            for needle in needles.iter() {
                if let Some(pos) = find_literal(chunk, needle.as_bytes(), *case_sensitive) {
                    if best.map(|(best_pos, _)| pos < best_pos).unwrap_or(true) {
                        best = Some((pos, needle));
                    }
                }
            }
            best.map(|(pos, needle)| Hit {
                matched: String::from_utf8_lossy(&chunk[pos..pos + needle.len()]).into_owned(),
                position: pos as u64,
                groups: None,
            })
        }
        Matcher::Regex { re, multiline } => {
            let haystack = if *multiline {
                String::from_utf8_lossy(flat)
            } else {
                String::from_utf8_lossy(chunk)
            };
            let caps = re.captures(&haystack)?;
            let full = caps.get(0)?;

            let mut groups = HashMap::new();
            for i in 1..caps.len() {
                if let Some(m) = caps.get(i) {
                    groups.insert(i.to_string(), String::from(m.as_str()));
                }
            }
            for name in re.capture_names().flatten() {
                if let Some(m) = caps.name(name) {
                    groups.insert(String::from(name), String::from(m.as_str()));
                }
            }

            Some(Hit {
                matched: String::from(full.as_str()),
                position: full.start() as u64,
                groups: if groups.is_empty() { None } else { Some(groups) },
            })
        }
        Matcher::AnsiClass { class } => seqs.iter().find(|s| s.category == *class).map(|seq| Hit {
            matched: String::from_utf8_lossy(&seq.raw).into_owned(),
            position: seq.end_offset.saturating_sub(seq.raw.len()) as u64,
            groups: None,
        }),
        Matcher::Custom { f } => {
            // matcher code is untrusted-ish: a panic is logged and
            // treated as a non-match, the matcher stays registered
            match panic::catch_unwind(AssertUnwindSafe(|| f(chunk, flat))) {
                Ok(hit) => hit.map(|h| Hit {
                    matched: h.matched,
                    position: h.position,
                    groups: h.groups,
                }),
                Err(_) => {
                    warn!("custom matcher panicked, treating as non-match");
                    None
                }
            }
        }
    }
}

fn find_literal(haystack: &[u8], needle: &[u8], case_sensitive: bool) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| {
        if case_sensitive { w == needle } else { w.eq_ignore_ascii_case(needle) }
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crossbeam_channel::unbounded;
    use ntest::timeout;
    use shelltender_protocol::PatternOptions;

    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn spec(name: &str, kind: PatternKind, options: PatternOptions) -> PatternSpec {
        PatternSpec { name: String::from(name), kind, options }
    }

    fn collector(engine: &PatternEngine) -> crossbeam_channel::Receiver<PatternMatchEvent> {
        let (tx, rx) = unbounded();
        engine
            .on_match(move |ev| {
                let _ = tx.send(ev.clone());
            })
            .forever();
        rx
    }

    #[test]
    #[timeout(30000)]
    fn literal_match() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "err",
                    PatternKind::Literal { pattern: String::from("ERROR") },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"all fine here", vec![]);
        engine.evaluate("s", b"oops: ERROR found", vec![]);

        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert_eq!(ev.name, "err");
        assert_eq!(ev.matched, "ERROR");
        assert_eq!(ev.position, 6);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    #[timeout(30000)]
    fn literal_case_insensitive() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "err",
                    PatternKind::Literal { pattern: String::from("error") },
                    PatternOptions { case_sensitive: Some(false), ..Default::default() },
                ),
            )
            .unwrap();

        engine.evaluate("s", b"an ERROR happened", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert_eq!(ev.matched, "ERROR");
    }

    #[test]
    #[timeout(30000)]
    fn literal_set_earliest_position_wins() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "level",
                    PatternKind::LiteralSet {
                        patterns: vec![String::from("FATAL"), String::from("WARN")],
                    },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"WARN before FATAL", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert_eq!(ev.matched, "WARN");
        assert_eq!(ev.position, 0);
    }

    #[test]
    #[timeout(30000)]
    fn regex_with_groups() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "jest",
                    PatternKind::Regex {
                        pattern: String::from(r"Tests:\s+(\d+) passed, (\d+) failed"),
                    },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"Tests: 12 passed, 3 failed\n", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert_eq!(ev.matched, "Tests: 12 passed, 3 failed");
        let groups = ev.groups.expect("groups");
        assert_eq!(groups.get("1").map(String::as_str), Some("12"));
        assert_eq!(groups.get("2").map(String::as_str), Some("3"));
    }

    #[test]
    #[timeout(30000)]
    fn named_groups_surface_by_name() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "named",
                    PatternKind::Regex { pattern: String::from(r"user=(?P<user>\w+)") },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"login user=alice ok", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        let groups = ev.groups.expect("groups");
        assert_eq!(groups.get("user").map(String::as_str), Some("alice"));
        assert_eq!(groups.get("1").map(String::as_str), Some("alice"));
    }

    #[test]
    #[timeout(30000)]
    fn multiline_regex_runs_against_flat_buffer() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "span",
                    PatternKind::Regex { pattern: String::from(r"^begin$[\s\S]*^end$") },
                    PatternOptions { multiline: true, ..Default::default() },
                ),
            )
            .unwrap();

        // the chunk alone does not contain the pattern, the flat
        // buffer does
        engine.evaluate("s", b"end\n", b"begin\nmiddle\nend\n".to_vec());
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert!(ev.matched.starts_with("begin"));
    }

    #[test]
    #[timeout(30000)]
    fn bad_regex_fails_registration() {
        let engine = PatternEngine::new().unwrap();
        let res = engine.register(
            "s",
            &spec(
                "bad",
                PatternKind::Regex { pattern: String::from("(unclosed") },
                PatternOptions::default(),
            ),
        );
        assert!(res.is_err());
    }

    #[test]
    #[timeout(30000)]
    fn debounce_suppresses_rapid_repeats() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "beat",
                    PatternKind::Literal { pattern: String::from("tick") },
                    PatternOptions { debounce_ms: Some(60_000), ..Default::default() },
                ),
            )
            .unwrap();

        for _ in 0..5 {
            engine.evaluate("s", b"tick", vec![]);
        }
        engine.shutdown();

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1, "exactly one match per debounce window");
    }

    #[test]
    #[timeout(30000)]
    fn custom_matcher_panic_is_contained() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine.register_custom(
            "s",
            "bomb",
            None,
            Box::new(|_, _| panic!("matcher bug")),
        );
        // registered after the bomb, must still be evaluated
        engine
            .register(
                "s",
                &spec(
                    "ok",
                    PatternKind::Literal { pattern: String::from("hi") },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"hi there", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("match from the healthy matcher");
        assert_eq!(ev.name, "ok");

        // the bomb stays registered and keeps not matching
        engine.evaluate("s", b"hi again", vec![]);
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("second match");
        assert_eq!(ev.name, "ok");
    }

    #[test]
    #[timeout(30000)]
    fn custom_matcher_sees_chunk_and_flat() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine.register_custom(
            "s",
            "both",
            None,
            Box::new(|chunk, flat| {
                if chunk == b"tail" && flat.ends_with(b"tail") {
                    Some(CustomHit {
                        matched: String::from("tail"),
                        position: (flat.len() - 4) as u64,
                        groups: None,
                    })
                } else {
                    None
                }
            }),
        );

        engine.evaluate("s", b"tail", b"head tail".to_vec());
        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("a match event");
        assert_eq!(ev.position, 5);
    }

    #[test]
    #[timeout(30000)]
    fn ansi_class_matcher_and_events() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);
        let (ansi_tx, ansi_rx) = unbounded();
        engine
            .on_ansi(move |ev| {
                let _ = ansi_tx.send(ev.clone());
            })
            .forever();

        engine
            .register(
                "s",
                &spec(
                    "colors",
                    PatternKind::AnsiClass { class: AnsiCategory::Color },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"\x1b[31mred\x1b[0m", vec![]);

        let ev = rx.recv_timeout(RECV_TIMEOUT).expect("ansi-class match");
        assert_eq!(ev.name, "colors");

        let first = ansi_rx.recv_timeout(RECV_TIMEOUT).expect("ansi event");
        assert_eq!(first.category, AnsiCategory::Color);
        let second = ansi_rx.recv_timeout(RECV_TIMEOUT).expect("second ansi event");
        assert_eq!(second.category, AnsiCategory::Color);
    }

    #[test]
    #[timeout(30000)]
    fn split_ansi_sequence_never_matches_spuriously() {
        let engine = PatternEngine::new().unwrap();
        let (ansi_tx, ansi_rx) = unbounded();
        engine
            .on_ansi(move |ev| {
                let _ = ansi_tx.send(ev.clone());
            })
            .forever();

        engine.evaluate("s", b"text \x1b[3", vec![]);
        engine.evaluate("s", b"1m more", vec![]);
        engine.shutdown();

        let events: Vec<_> = ansi_rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AnsiCategory::Color);
        assert_eq!(events[0].raw, "\x1b[31m");
    }

    #[test]
    #[timeout(30000)]
    fn unregister_stops_matches() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        let pattern_id = engine
            .register(
                "s",
                &spec(
                    "once",
                    PatternKind::Literal { pattern: String::from("x") },
                    PatternOptions::default(),
                ),
            )
            .unwrap();

        engine.evaluate("s", b"x", vec![]);
        rx.recv_timeout(RECV_TIMEOUT).expect("first match");

        assert!(engine.unregister("s", &pattern_id));
        assert!(!engine.unregister("s", &pattern_id));

        engine.evaluate("s", b"x", vec![]);
        engine.shutdown();
        assert!(rx.try_iter().next().is_none());
    }

    #[test]
    #[timeout(30000)]
    fn events_delivered_in_registration_order() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        for name in ["first", "second", "third"] {
            engine
                .register(
                    "s",
                    &spec(
                        name,
                        PatternKind::Literal { pattern: String::from("hit") },
                        PatternOptions::default(),
                    ),
                )
                .unwrap();
        }

        engine.evaluate("s", b"hit", vec![]);
        engine.shutdown();

        let names: Vec<_> = rx.try_iter().map(|ev| ev.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    #[timeout(30000)]
    fn remove_session_cascades() {
        let engine = PatternEngine::new().unwrap();
        let rx = collector(&engine);

        engine
            .register(
                "s",
                &spec(
                    "gone",
                    PatternKind::Literal { pattern: String::from("x") },
                    PatternOptions::default(),
                ),
            )
            .unwrap();
        engine.remove_session("s");

        engine.evaluate("s", b"x", vec![]);
        engine.shutdown();
        assert!(rx.try_iter().next().is_none());
    }
}
