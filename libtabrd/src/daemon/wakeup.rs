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

use std::{
    io::{Read, Write},
    os::{fd::AsFd, unix::io::BorrowedFd, unix::net::UnixStream},
    sync::Arc,
};

use anyhow::Context;
use tracing::warn;

/// The command source's magic-byte wakeup channel. Any byte written
/// to the notifier end makes the readiness watcher return from
/// poll(2) so it can re-synchronize its set with the registry.
pub struct Wakeup {
    reader: UnixStream,
    writer: Arc<UnixStream>,
}

impl Wakeup {
    pub fn new() -> anyhow::Result<Wakeup> {
        let (reader, writer) = UnixStream::pair().context("creating wakeup channel")?;
        // both ends non-blocking: the watcher never blocks draining,
        // and a full kernel buffer already guarantees a pending wakeup
        reader.set_nonblocking(true).context("setting wakeup reader nonblocking")?;
        writer.set_nonblocking(true).context("setting wakeup writer nonblocking")?;
        Ok(Wakeup { reader, writer: Arc::new(writer) })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier { writer: Arc::clone(&self.writer) }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// Swallow every byte currently buffered. One wakeup covers any
    /// number of notifies that raced in.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("draining wakeup channel: {}", e);
                    return;
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    writer: Arc<UnixStream>,
}

impl Notifier {
    pub fn notify(&self) {
        match (&*self.writer).write(&[1]) {
            Ok(_) => {}
            // a full buffer means a wakeup is already pending
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("poking wakeup channel: {}", e),
        }
    }
}
