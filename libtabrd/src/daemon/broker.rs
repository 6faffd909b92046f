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

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    consts,
    daemon::{
        pipeline::{BufferKind, PipelineMsg, TaggedBuffer},
        registry::{Pending, Session, SessionRegistry},
        signals::ShutdownToken,
        transport::{TpmTransport, TransportError},
        wakeup::Notifier,
    },
};

/// The cross-thread face of the broker: the active slot that pairs
/// the currently executing command with its session, and the cancel
/// entry point. The control plane consults the slot under the same
/// lock the broker thread updates it under.
#[derive(Clone)]
pub struct BrokerHandle {
    active: Arc<Mutex<Option<u64>>>,
    transport: Arc<dyn TpmTransport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NothingToCancel,
}

impl BrokerHandle {
    pub fn new(transport: Arc<dyn TpmTransport>) -> Self {
        BrokerHandle { active: Arc::new(Mutex::new(None)), transport }
    }

    /// Cancel a session's sole in-flight command, from any thread.
    /// Queued commands are marked so the broker drops them and
    /// synthesizes a cancellation response; a command already on the
    /// TPM gets a transport-level cancel.
    #[instrument(skip_all)]
    pub fn cancel(&self, session: &Session) -> CancelOutcome {
        // lock order everywhere: active slot, then session-lock
        let active = self.active.lock().unwrap();
        let mut state = session.state();
        match state.pending {
            Pending::Queued { ref mut cancelled } => {
                debug!("marking queued command for session {:x} cancelled", session.id());
                *cancelled = true;
                CancelOutcome::Cancelled
            }
            Pending::Active => {
                trace!("active slot = {:x?}", *active);
                info!("cancelling command executing for session {:x}", session.id());
                if let Err(e) = self.transport.cancel() {
                    // drivers without cancel support let the command
                    // run out naturally; the client still gets exactly
                    // one response frame
                    warn!("transport cancel: {}", e);
                }
                CancelOutcome::Cancelled
            }
            Pending::Idle | Pending::Closing => CancelOutcome::NothingToCancel,
        }
    }
}

pub struct BrokerArgs {
    pub input: crossbeam_channel::Receiver<PipelineMsg>,
    pub output: crossbeam_channel::Sender<PipelineMsg>,
    pub handle: BrokerHandle,
    pub registry: Arc<SessionRegistry>,
    pub source_notifier: Notifier,
    pub shutdown: ShutdownToken,
}

/// The broker thread: strictly serial against the TPM transport.
/// Consumes tagged commands, applies locality changes, executes, and
/// emits tagged responses. Runs until its input queue closes; a
/// transport I/O fault escalates to daemon shutdown.
#[instrument(skip_all)]
pub fn run(args: BrokerArgs) -> anyhow::Result<()> {
    let transport = Arc::clone(&args.handle.transport);
    // the last locality actually applied to the transport; commands
    // only pay for a set_locality when their session differs
    let mut applied_locality: Option<u8> = None;

    for msg in args.input.iter() {
        let cmd = match msg {
            PipelineMsg::Close(id) => {
                forward_close(&args, id)?;
                continue;
            }
            PipelineMsg::Buffer(cmd) => cmd,
        };
        debug_assert_eq!(cmd.kind, BufferKind::Command);

        let Some(session) = args.registry.lookup(cmd.session_id) else {
            debug!("dropping command for departed session {:x}", cmd.session_id);
            continue;
        };

        let locality = match arbitrate(&args.handle, &session) {
            Arbitration::Execute(locality) => locality,
            Arbitration::Drop => continue,
            Arbitration::SynthesizeCancel => {
                debug!("queued command for session {:x} was cancelled, synthesizing", session.id());
                deliver(&args, &session, rc_response(consts::TPM_RC_CANCELED))?;
                continue;
            }
        };

        if applied_locality != Some(locality) {
            match transport.set_locality(locality) {
                Ok(()) => {
                    trace!("applied locality {} for session {:x}", locality, session.id());
                    applied_locality = Some(locality);
                }
                Err(TransportError::Unsupported(op)) => {
                    warn!("transport has no {}, leaving locality {}", op, locality);
                    applied_locality = Some(locality);
                }
                Err(TransportError::Tpm(rc)) => {
                    warn!("set_locality({}) failed with rc {:#x}", locality, rc);
                    finish(&args, &session, rc_response(rc))?;
                    continue;
                }
                Err(TransportError::Io(e)) => {
                    return fault(&args, &session, e.into());
                }
            }
        }

        let result = transport.send(&cmd.bytes).and_then(|_| transport.receive());
        let response = match result {
            Ok(bytes) => bytes,
            Err(TransportError::Tpm(rc)) => rc_response(rc),
            Err(err) => return fault(&args, &session, err),
        };
        finish(&args, &session, response)?;
    }

    info!("input queue closed, drained and exiting");
    Ok(())
}

enum Arbitration {
    Execute(u8),
    SynthesizeCancel,
    Drop,
}

/// Decide what to do with the command at the head of the queue, and
/// claim the active slot if it is going to execute.
fn arbitrate(handle: &BrokerHandle, session: &Session) -> Arbitration {
    let mut active = handle.active.lock().unwrap();
    let mut state = session.state();
    match state.pending {
        Pending::Queued { cancelled: true } => {
            state.pending = Pending::Idle;
            Arbitration::SynthesizeCancel
        }
        Pending::Queued { cancelled: false } => {
            state.pending = Pending::Active;
            *active = Some(session.id());
            Arbitration::Execute(state.locality)
        }
        Pending::Closing => Arbitration::Drop,
        Pending::Idle | Pending::Active => {
            // the source only queues from Idle, so this means
            // bookkeeping went sideways somewhere
            warn!("command for session {:x} in state {:?}", session.id(), state.pending);
            Arbitration::Drop
        }
    }
}

/// Release the active slot, return the session to Idle, and hand the
/// response to the sink. The wakeup poke puts the session's endpoint
/// back in the readiness set right away.
fn finish(args: &BrokerArgs, session: &Session, response: Vec<u8>) -> anyhow::Result<()> {
    {
        let mut active = args.handle.active.lock().unwrap();
        *active = None;
        let mut state = session.state();
        if !matches!(state.pending, Pending::Closing) {
            state.pending = Pending::Idle;
        }
    }
    deliver(args, session, response)
}

fn deliver(args: &BrokerArgs, session: &Session, response: Vec<u8>) -> anyhow::Result<()> {
    let msg = PipelineMsg::Buffer(TaggedBuffer {
        session_id: session.id(),
        bytes: response,
        kind: BufferKind::Response,
    });
    if args.output.send(msg).is_err() {
        args.shutdown.request();
        return Err(anyhow!("response sink hung up"));
    }
    args.source_notifier.notify();
    Ok(())
}

fn forward_close(args: &BrokerArgs, id: u64) -> anyhow::Result<()> {
    if args.output.send(PipelineMsg::Close(id)).is_err() {
        args.shutdown.request();
        return Err(anyhow!("response sink hung up"));
    }
    Ok(())
}

/// The transport is unusable. Clean up the slot so nothing looks
/// in-flight, then take the daemon down.
fn fault(args: &BrokerArgs, session: &Session, err: TransportError) -> anyhow::Result<()> {
    {
        let mut active = args.handle.active.lock().unwrap();
        *active = None;
        let mut state = session.state();
        if !matches!(state.pending, Pending::Closing) {
            state.pending = Pending::Idle;
        }
    }
    error!("TPM transport fault, shutting down: {}", err);
    args.shutdown.request();
    Err(err).context("TPM transport fault")
}

/// A header-only TPM response carrying the given response code.
pub fn rc_response(rc: u32) -> Vec<u8> {
    let mut buf = vec![0u8; consts::TPM_HEADER_SIZE];
    BigEndian::write_u16(&mut buf[0..2], consts::TPM_ST_NO_SESSIONS);
    BigEndian::write_u32(&mut buf[2..6], consts::TPM_HEADER_SIZE as u32);
    BigEndian::write_u32(&mut buf[6..10], rc);
    buf
}
