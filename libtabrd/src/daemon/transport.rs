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
    fs,
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex},
    time,
};

use anyhow::Context;
use tracing::info;

use crate::{config, consts};

/// How a transport operation can go wrong. Tpm errors carry a
/// response code that travels back to the client as a response body;
/// Io faults mean the transport is unusable and take the daemon down;
/// Unsupported marks operations a driver simply does not have.
#[derive(Debug)]
pub enum TransportError {
    Tpm(u32),
    Unsupported(&'static str),
    Io(io::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Tpm(rc) => write!(f, "TPM response code {rc:#x}"),
            TransportError::Unsupported(op) => write!(f, "transport does not support {op}"),
            TransportError::Io(e) => write!(f, "transport I/O fault: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// The pluggable TPM driver seam. The broker thread is the only
/// caller of send/receive; cancel and set_locality may additionally
/// be reached from control plane threads, so drivers synchronize
/// internally.
pub trait TpmTransport: Send + Sync {
    /// Hand one complete command buffer to the TPM.
    fn send(&self, command: &[u8]) -> Result<()>;

    /// Block until the response to the last sent command is ready.
    fn receive(&self) -> Result<Vec<u8>>;

    /// Ask the TPM to abandon the currently executing command.
    fn cancel(&self) -> Result<()>;

    /// Switch the locality future commands execute under.
    fn set_locality(&self, locality: u8) -> Result<()>;
}

/// Build the configured driver. Any failure here is fatal to the
/// daemon.
pub fn init(config: &config::Config) -> anyhow::Result<Arc<dyn TpmTransport>> {
    match config.transport.unwrap_or_default() {
        config::TransportKind::Device => {
            let device = DeviceTransport::open(config.device(), config.max_command_size())?;
            Ok(Arc::new(device))
        }
        config::TransportKind::Echo => Ok(Arc::new(EchoTransport::new())),
    }
}

/// Driver for a kernel TPM character device such as /dev/tpm0: one
/// write submits a command, one read collects the response. The
/// device interface has no cancellation or locality control.
pub struct DeviceTransport {
    file: Mutex<fs::File>,
    max_response_size: usize,
}

impl DeviceTransport {
    pub fn open(path: &str, max_response_size: usize) -> anyhow::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening TPM device {path}"))?;
        info!("opened TPM device {}", path);
        Ok(DeviceTransport { file: Mutex::new(file), max_response_size })
    }
}

impl TpmTransport for DeviceTransport {
    fn send(&self, command: &[u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.write_all(command)?;
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        let mut buf = vec![0u8; self.max_response_size];
        // the device hands back the whole response in one read
        let n = loop {
            match file.read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        };
        if n < consts::TPM_HEADER_SIZE {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("TPM device returned a {n} byte response"),
            )));
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn cancel(&self) -> Result<()> {
        Err(TransportError::Unsupported("cancel"))
    }

    fn set_locality(&self, _locality: u8) -> Result<()> {
        Err(TransportError::Unsupported("set_locality"))
    }
}

/// Loopback driver: every command comes straight back as its own
/// response. Used by the test suite and handy for exercising client
/// plumbing without TPM hardware.
pub struct EchoTransport {
    state: Mutex<EchoState>,
    cond: Condvar,
}

struct EchoState {
    pending: Option<Vec<u8>>,
    cancelled: bool,
    localities: Vec<u8>,
}

impl EchoTransport {
    pub fn new() -> Self {
        EchoTransport {
            state: Mutex::new(EchoState { pending: None, cancelled: false, localities: vec![] }),
            cond: Condvar::new(),
        }
    }

    /// Every locality value set_locality has been called with, in
    /// order.
    #[cfg(test)]
    pub fn localities(&self) -> Vec<u8> {
        self.state.lock().unwrap().localities.clone()
    }

    fn receive_after(&self, delay: Option<time::Duration>) -> Result<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if let Some(delay) = delay {
            let deadline = time::Instant::now() + delay;
            while !state.cancelled {
                let now = time::Instant::now();
                if now >= deadline {
                    break;
                }
                let (next, _timeout) = self.cond.wait_timeout(state, deadline - now).unwrap();
                state = next;
            }
        }
        if state.cancelled {
            state.cancelled = false;
            state.pending = None;
            return Err(TransportError::Tpm(consts::TPM_RC_CANCELED));
        }
        state.pending.take().ok_or_else(|| {
            TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "receive without a sent command",
            ))
        })
    }
}

impl Default for EchoTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TpmTransport for EchoTransport {
    fn send(&self, command: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancelled = false;
        state.pending = Some(command.to_vec());
        Ok(())
    }

    fn receive(&self) -> Result<Vec<u8>> {
        self.receive_after(None)
    }

    fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        self.cond.notify_all();
        Ok(())
    }

    fn set_locality(&self, locality: u8) -> Result<()> {
        self.state.lock().unwrap().localities.push(locality);
        Ok(())
    }
}

/// An echo transport that stalls every receive by a fixed delay, so
/// tests can catch a command while it is "on the TPM".
#[cfg(test)]
pub struct DelayedEchoTransport {
    inner: EchoTransport,
    delay: time::Duration,
}

#[cfg(test)]
impl DelayedEchoTransport {
    pub fn new(delay: time::Duration) -> Self {
        DelayedEchoTransport { inner: EchoTransport::new(), delay }
    }
}

#[cfg(test)]
impl TpmTransport for DelayedEchoTransport {
    fn send(&self, command: &[u8]) -> Result<()> {
        self.inner.send(command)
    }

    fn receive(&self) -> Result<Vec<u8>> {
        self.inner.receive_after(Some(self.delay))
    }

    fn cancel(&self) -> Result<()> {
        self.inner.cancel()
    }

    fn set_locality(&self, locality: u8) -> Result<()> {
        self.inner.set_locality(locality)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn echo_round_trip() {
        let transport = EchoTransport::new();
        transport.send(&[1, 2, 3]).expect("send");
        assert_eq!(transport.receive().expect("receive"), vec![1, 2, 3]);
    }

    #[test]
    fn echo_receive_without_send_is_io_fault() {
        let transport = EchoTransport::new();
        assert!(matches!(transport.receive(), Err(TransportError::Io(_))));
    }

    #[test]
    fn cancel_interrupts_delayed_receive() {
        let transport = Arc::new(DelayedEchoTransport::new(time::Duration::from_secs(5)));
        transport.send(&[9]).expect("send");

        let canceller = Arc::clone(&transport);
        let h = thread::spawn(move || {
            thread::sleep(time::Duration::from_millis(50));
            canceller.cancel().expect("cancel");
        });

        let start = time::Instant::now();
        let res = transport.receive();
        h.join().expect("canceller not to panic");

        assert!(matches!(res, Err(TransportError::Tpm(rc)) if rc == consts::TPM_RC_CANCELED));
        assert!(start.elapsed() < time::Duration::from_secs(4), "cancel did not cut the delay");
    }

    #[test]
    fn echo_records_localities() {
        let transport = EchoTransport::new();
        transport.set_locality(3).expect("set_locality");
        transport.set_locality(0).expect("set_locality");
        assert_eq!(transport.localities(), vec![3, 0]);
    }
}
