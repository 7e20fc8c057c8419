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
    sync::{Condvar, Mutex},
    time::Duration,
};

/// A one-shot broadcast slot for a child process exit status. The
/// watcher thread fills it exactly once; any number of threads can
/// wait on it, before or after the exit happens.
#[derive(Debug, Default)]
pub struct ExitNotifier {
    slot: Mutex<Option<i32>>,
    cond: Condvar,
}

impl ExitNotifier {
    pub fn new() -> Self {
        ExitNotifier { slot: Mutex::new(None), cond: Condvar::new() }
    }

    /// Notify all waiters that the process has exited.
    pub fn notify_exit(&self, status: i32) {
        let mut slot = self.slot.lock().unwrap();
        // first writer wins, exits don't happen twice
        if slot.is_none() {
            *slot = Some(status);
        }
        self.cond.notify_all();
    }

    /// Wait for the process to exit, with an optional timeout to
    /// allow the caller to wake up periodically. Returns None on
    /// timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<i32> {
        let slot = self.slot.lock().unwrap();

        if slot.is_some() {
            return *slot;
        }

        match timeout {
            Some(t) => {
                // returns a lock result, so we want to unwrap
                // to propagate the lock poisoning
                let (status, wait_res) =
                    self.cond.wait_timeout_while(slot, t, |status| status.is_none()).unwrap();
                if wait_res.timed_out() { None } else { *status }
            }
            None => *self.cond.wait_while(slot, |status| status.is_none()).unwrap(),
        }
    }

    /// Non-blocking probe for the exit status.
    pub fn poll(&self) -> Option<i32> {
        *self.slot.lock().unwrap()
    }
}
