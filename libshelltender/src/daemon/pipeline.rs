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

//! The output pipeline. Every chunk read from a pty flows through an
//! ordered chain of filters (keep/drop) and processors (transform)
//! before it can reach buffers, the pattern engine, or clients. A
//! chunk dropped here never happened as far as downstream consumers
//! are concerned, which is what makes the redaction stages safe:
//! secrets are gone before anything records them.
//!
//! Stages run synchronously on the per-session reader thread, so one
//! session's chunks are processed in read order. A failing stage is
//! logged and bypassed; the chunk continues through the rest of the
//! chain untransformed by the bad stage.

use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
    time::Instant,
};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

use crate::{
    config,
    events::{Notifier, Subscription},
};

/// One chunk in flight through the pipeline.
#[derive(Debug, Clone)]
pub struct DataEvent {
    pub session_id: String,
    pub data: Vec<u8>,
    /// The chunk exactly as read from the pty, for audit consumers.
    pub original_data: Vec<u8>,
    /// Milliseconds since the owning session started.
    pub timestamp_ms: u64,
    /// Names of the processors that transformed this event, in the
    /// order they ran.
    pub transformations: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl DataEvent {
    pub fn new(session_id: &str, data: Vec<u8>, timestamp_ms: u64) -> Self {
        DataEvent {
            session_id: String::from(session_id),
            original_data: data.clone(),
            data,
            timestamp_ms,
            transformations: vec![],
            metadata: HashMap::new(),
        }
    }
}

/// A filter said no. Audit-level event naming the filter.
#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub session_id: String,
    pub filter: String,
}

/// A processor dropped the chunk (rate limiting, mostly).
#[derive(Debug, Clone)]
pub struct DroppedEvent {
    pub session_id: String,
    pub stage: String,
    pub dropped_bytes: u64,
}

pub type FilterFn = Box<dyn Fn(&DataEvent) -> bool + Send + Sync>;
pub type ProcessorFn = Box<dyn Fn(DataEvent) -> Option<DataEvent> + Send + Sync>;

struct Filter {
    name: String,
    f: FilterFn,
}

struct Processor {
    name: String,
    priority: i32,
    // registration order breaks priority ties
    order: u64,
    f: ProcessorFn,
}

pub struct Pipeline {
    filters: RwLock<Vec<Filter>>,
    processors: RwLock<Vec<Processor>>,
    next_order: AtomicU64,
    raw: Notifier<DataEvent>,
    processed: Notifier<DataEvent>,
    blocked: Notifier<BlockedEvent>,
    dropped: Notifier<DroppedEvent>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            filters: RwLock::new(vec![]),
            processors: RwLock::new(vec![]),
            next_order: AtomicU64::new(0),
            raw: Notifier::new(),
            processed: Notifier::new(),
            blocked: Notifier::new(),
            dropped: Notifier::new(),
        }
    }

    /// Assemble the stock chain described by the config. Relative
    /// stage order is fixed; config only picks which stages exist and
    /// their parameters.
    pub fn from_config(cfg: &config::PipelineConfig) -> anyhow::Result<Self> {
        let pipeline = Pipeline::new();

        if let Some(allowlist) = &cfg.session_allowlist {
            let set: HashSet<String> = allowlist.iter().cloned().collect();
            pipeline.add_filter("session-allowlist", stock::session_allowlist(set));
        }
        if cfg.reject_binary.unwrap_or(false) {
            pipeline.add_filter("no-binary", stock::no_binary());
        }
        if let Some(max) = cfg.max_chunk_bytes {
            pipeline.add_filter("max-size", stock::max_size(max));
        }

        if let Some(patterns) = &cfg.redact_patterns {
            let mut compiled = Vec::with_capacity(patterns.len());
            for pattern in patterns.iter() {
                let re = regex::RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| anyhow::anyhow!("compiling redact pattern '{pattern}': {e}"))?;
                compiled.push(re);
            }
            pipeline.add_processor("security-redact", 10, stock::security_redact(compiled));
        }
        if cfg.credit_card_redact.unwrap_or(false) {
            pipeline.add_processor(
                "credit-card-redact",
                11,
                stock::credit_card_redact(cfg.luhn_check.unwrap_or(false)),
            );
        }
        if cfg.normalize_line_endings.unwrap_or(false) {
            pipeline.add_processor("line-ending-normalize", 20, stock::line_ending_normalize());
        }
        if cfg.strip_ansi.unwrap_or(false) {
            pipeline.add_processor("ansi-strip", 30, stock::ansi_strip());
        }
        // rate limiting runs last so it meters what clients would
        // actually receive
        let rate = cfg
            .rate_limit_bytes_per_sec
            .unwrap_or(crate::consts::DEFAULT_RATE_LIMIT_BYTES_PER_SEC);
        if rate > 0 {
            pipeline.add_processor("rate-limit", 100, stock::rate_limit(rate));
        }

        Ok(pipeline)
    }

    pub fn add_filter(&self, name: &str, f: FilterFn) {
        self.filters.write().unwrap().push(Filter { name: String::from(name), f });
    }

    /// Processors run in ascending priority; ties break by
    /// registration order.
    pub fn add_processor(&self, name: &str, priority: i32, f: ProcessorFn) {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        let mut processors = self.processors.write().unwrap();
        processors.push(Processor { name: String::from(name), priority, order, f });
        processors.sort_by_key(|p| (p.priority, p.order));
    }

    /// Run one chunk through the chain. Returns the processed event,
    /// or None if a stage dropped it.
    pub fn process(&self, event: DataEvent) -> Option<DataEvent> {
        self.raw.emit(&event);

        {
            let filters = self.filters.read().unwrap();
            for filter in filters.iter() {
                match panic::catch_unwind(AssertUnwindSafe(|| (filter.f)(&event))) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("filter {} blocked chunk from {}", filter.name, event.session_id);
                        self.blocked.emit(&BlockedEvent {
                            session_id: event.session_id.clone(),
                            filter: filter.name.clone(),
                        });
                        return None;
                    }
                    Err(_) => {
                        warn!("filter {} panicked, bypassing it for this chunk", filter.name);
                    }
                }
            }
        }

        let mut event = event;
        {
            let processors = self.processors.read().unwrap();
            for processor in processors.iter() {
                let pre_stage = event.clone();
                match panic::catch_unwind(AssertUnwindSafe(|| (processor.f)(event))) {
                    Ok(Some(mut out)) => {
                        if out.data != pre_stage.data {
                            out.transformations.push(processor.name.clone());
                        }
                        event = out;
                    }
                    Ok(None) => {
                        debug!(
                            "processor {} dropped chunk from {}",
                            processor.name, pre_stage.session_id
                        );
                        self.dropped.emit(&DroppedEvent {
                            session_id: pre_stage.session_id.clone(),
                            stage: processor.name.clone(),
                            dropped_bytes: pre_stage.data.len() as u64,
                        });
                        return None;
                    }
                    Err(_) => {
                        warn!(
                            "processor {} panicked, bypassing it for this chunk",
                            processor.name
                        );
                        event = pre_stage;
                    }
                }
            }
        }

        self.processed.emit(&event);
        Some(event)
    }

    pub fn on_raw(&self, cb: impl Fn(&DataEvent) + Send + Sync + 'static) -> Subscription {
        self.raw.subscribe(cb)
    }

    pub fn on_processed(&self, cb: impl Fn(&DataEvent) + Send + Sync + 'static) -> Subscription {
        self.processed.subscribe(cb)
    }

    pub fn on_blocked(&self, cb: impl Fn(&BlockedEvent) + Send + Sync + 'static) -> Subscription {
        self.blocked.subscribe(cb)
    }

    pub fn on_dropped(&self, cb: impl Fn(&DroppedEvent) + Send + Sync + 'static) -> Subscription {
        self.dropped.subscribe(cb)
    }
}

/// The stock stages the daemon composes from config. Embedders can
/// also register their own via `add_filter`/`add_processor`.
pub mod stock {
    use super::*;

    pub const REDACTED: &str = "[REDACTED]";
    pub const CREDIT_CARD_REDACTED: &str = "[CREDIT_CARD_REDACTED]";

    lazy_static! {
        static ref CARD_RUN: Regex = Regex::new(r"\d{13,19}").expect("static regex to compile");
    }

    /// Replace every match of every given regex with `[REDACTED]`.
    pub fn security_redact(patterns: Vec<Regex>) -> ProcessorFn {
        Box::new(move |mut event| {
            let mut text = String::from_utf8_lossy(&event.data).into_owned();
            for re in patterns.iter() {
                text = re.replace_all(&text, REDACTED).into_owned();
            }
            event.data = text.into_bytes();
            Some(event)
        })
    }

    /// Replace 13-19 digit runs with `[CREDIT_CARD_REDACTED]`,
    /// optionally only when the run passes a Luhn check.
    pub fn credit_card_redact(luhn_check: bool) -> ProcessorFn {
        Box::new(move |mut event| {
            let text = String::from_utf8_lossy(&event.data).into_owned();
            let replaced = CARD_RUN.replace_all(&text, |caps: &regex::Captures| {
                let run = &caps[0];
                if !luhn_check || luhn_valid(run) {
                    String::from(CREDIT_CARD_REDACTED)
                } else {
                    String::from(run)
                }
            });
            event.data = replaced.into_owned().into_bytes();
            Some(event)
        })
    }

    /// Whole-second token bucket per session. A chunk that would
    /// push the current second over budget is dropped entirely; the
    /// next second starts fresh.
    pub fn rate_limit(bytes_per_sec: usize) -> ProcessorFn {
        struct Bucket {
            window_start: Instant,
            used: usize,
        }
        let buckets: Mutex<HashMap<String, Bucket>> = Mutex::new(HashMap::new());

        Box::new(move |event| {
            let mut buckets = buckets.lock().unwrap();
            let bucket = buckets
                .entry(event.session_id.clone())
                .or_insert_with(|| Bucket { window_start: Instant::now(), used: 0 });

            if bucket.window_start.elapsed().as_secs() >= 1 {
                bucket.window_start = Instant::now();
                bucket.used = 0;
            }

            if bucket.used + event.data.len() > bytes_per_sec {
                return None;
            }
            bucket.used += event.data.len();
            Some(event)
        })
    }

    /// `\r\n` -> `\n`.
    pub fn line_ending_normalize() -> ProcessorFn {
        Box::new(|mut event| {
            let mut out = Vec::with_capacity(event.data.len());
            let mut i = 0;
            while i < event.data.len() {
                if event.data[i] == b'\r'
                    && event.data.get(i + 1).copied() == Some(b'\n')
                {
                    out.push(b'\n');
                    i += 2;
                } else {
                    out.push(event.data[i]);
                    i += 1;
                }
            }
            event.data = out;
            Some(event)
        })
    }

    /// Remove ANSI escape sequences entirely.
    pub fn ansi_strip() -> ProcessorFn {
        Box::new(|mut event| {
            event.data = strip_ansi_escapes::strip(&event.data);
            Some(event)
        })
    }

    /// Reject chunks containing NUL bytes. Terminal streams are not
    /// supposed to carry them; their presence usually means binary
    /// garbage got catted into the session.
    pub fn no_binary() -> FilterFn {
        Box::new(|event| !event.data.contains(&0u8))
    }

    /// Reject chunks larger than `max` bytes.
    pub fn max_size(max: usize) -> FilterFn {
        Box::new(move |event| event.data.len() <= max)
    }

    /// Only let output from the named sessions through.
    pub fn session_allowlist(allowed: HashSet<String>) -> FilterFn {
        Box::new(move |event| allowed.contains(&event.session_id))
    }

    fn luhn_valid(digits: &str) -> bool {
        let mut sum = 0u32;
        let mut double = false;
        for c in digits.chars().rev() {
            let mut d = match c.to_digit(10) {
                Some(d) => d,
                None => return false,
            };
            if double {
                d *= 2;
                if d > 9 {
                    d -= 9;
                }
            }
            sum += d;
            double = !double;
        }
        sum % 10 == 0
    }

    #[cfg(test)]
    pub(super) fn luhn_valid_for_test(digits: &str) -> bool {
        luhn_valid(digits)
    }
}
