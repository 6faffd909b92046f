// Copyright 2023 Google LLC
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

use std::sync::{Condvar, Mutex};

use anyhow::anyhow;
use tracing::warn;

/// The one-shot initialization barrier. Control plane handlers wait
/// on it before touching anything the init task builds; the init task
/// opens it exactly once, either with the pipeline handles or with
/// the error that killed initialization.
pub struct InitGate<T> {
    slot: Mutex<GateState<T>>,
    cond: Condvar,
}

enum GateState<T> {
    Pending,
    Ready(T),
    Failed(String),
}

impl<T: Clone> InitGate<T> {
    pub fn new() -> Self {
        InitGate { slot: Mutex::new(GateState::Pending), cond: Condvar::new() }
    }

    /// Publish the handles and release every waiter. A second open is
    /// ignored; the barrier opens at most once.
    pub fn open(&self, handles: T) {
        let mut slot = self.slot.lock().unwrap();
        if !matches!(*slot, GateState::Pending) {
            warn!("init gate already opened, ignoring");
            return;
        }
        *slot = GateState::Ready(handles);
        self.cond.notify_all();
    }

    /// Publish an initialization failure instead. Waiters see it as
    /// an error rather than blocking forever.
    pub fn fail(&self, reason: String) {
        let mut slot = self.slot.lock().unwrap();
        if !matches!(*slot, GateState::Pending) {
            warn!("init gate already opened, ignoring failure report");
            return;
        }
        *slot = GateState::Failed(reason);
        self.cond.notify_all();
    }

    /// Block until the gate opens.
    pub fn wait(&self) -> anyhow::Result<T> {
        let slot = self.slot.lock().unwrap();
        // unwrap to propagate lock poisoning as an unwind
        let slot =
            self.cond.wait_while(slot, |state| matches!(state, GateState::Pending)).unwrap();
        match &*slot {
            GateState::Ready(handles) => Ok(handles.clone()),
            GateState::Failed(reason) => Err(anyhow!("daemon initialization failed: {}", reason)),
            GateState::Pending => unreachable!("wait_while returned while pending"),
        }
    }
}

impl<T: Clone> Default for InitGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{sync::Arc, thread, time};

    #[test]
    fn waiters_block_until_open() {
        let gate: Arc<InitGate<u32>> = Arc::new(InitGate::new());

        let mut waiters = vec![];
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            waiters.push(thread::spawn(move || gate.wait()));
        }

        // give the waiters a moment to actually park
        thread::sleep(time::Duration::from_millis(50));
        gate.open(7);

        for h in waiters {
            let got = h.join().expect("waiter not to panic").expect("gate to open");
            assert_eq!(got, 7);
        }
    }

    #[test]
    fn opens_at_most_once() {
        let gate: InitGate<u32> = InitGate::new();
        gate.open(1);
        gate.open(2);
        assert_eq!(gate.wait().expect("gate open"), 1);
    }

    #[test]
    fn failure_unblocks_waiters_with_error() {
        let gate: Arc<InitGate<u32>> = Arc::new(InitGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait())
        };

        gate.fail(String::from("no entropy"));
        let res = waiter.join().expect("waiter not to panic");
        let err = res.expect_err("gate failure to surface");
        assert!(format!("{err:#}").contains("no entropy"));
    }
}
