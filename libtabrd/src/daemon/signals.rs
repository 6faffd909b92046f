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
    os::unix::net::UnixStream,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::{debug, info};

/// The process-wide shutdown request. Signal handlers set the flag;
/// blocking threads observe it at their next cancellation check. The
/// accept loop additionally needs a poke, which request() delivers by
/// dialing the control socket.
#[derive(Clone)]
pub struct ShutdownToken {
    requested: Arc<AtomicBool>,
    socket: PathBuf,
}

impl ShutdownToken {
    pub fn new(socket: PathBuf) -> Self {
        ShutdownToken { requested: Arc::new(AtomicBool::new(false)), socket }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The raw flag, for registration with signal-hook so the signal
    /// handler itself only does an atomic store.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.requested)
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("requesting orderly shutdown");
        }
        // wake the accept loop so it observes the flag
        if let Err(e) = UnixStream::connect(&self.socket) {
            debug!("poking accept loop: {}", e);
        }
    }
}

pub struct Handler {
    token: ShutdownToken,
}

impl Handler {
    pub fn new(token: ShutdownToken) -> Self {
        Handler { token }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        info!("spawning signal handler thread");

        // This sets us up to shutdown immediately if someone
        // mashes ^C so we don't get stuck attempting a graceful
        // shutdown.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in TERM_SIGNALS {
            // When terminated by a second term signal, exit with exit code 1.
            // This will do nothing the first time (because term_now is false).
            flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
            // But this will "arm" the above for the second time, by setting it to true.
            // The order of registering these is important, if you put this one first, it
            // will first arm and then terminate ‒ all in the first round.
            flag::register(*sig, Arc::clone(&term_now))?;
            // The handler itself only flips the shutdown flag; the
            // watcher thread below does the non-reentrant work.
            flag::register(*sig, self.token.flag())?;
        }

        let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
        thread::spawn(move || {
            // Signals are exposed via an iterator so this loop is just to consume
            // that by blocking until the first value is emitted. Clippy thinks we
            // are looping over a collection and is confused about why we always
            // exit in the loop body.
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                assert!(TERM_SIGNALS.contains(&signal));

                info!("term sig handler: requesting orderly shutdown");
                self.token.request();
                break;
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn request_is_sticky() {
        let token = ShutdownToken::new(PathBuf::from("/nonexistent/tabrd-test.socket"));
        assert!(!token.is_requested());
        token.request();
        assert!(token.is_requested());
        token.request();
        assert!(token.is_requested());
    }
}
