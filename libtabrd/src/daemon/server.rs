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
    io,
    os::unix::{
        io::AsRawFd,
        net::{UnixListener, UnixStream},
    },
    sync::Arc,
    thread,
};

use anyhow::{anyhow, Context};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tabrd_protocol::{
    CancelReply, CancelRequest, ControlRequest, CreateConnectionReply, SetLocalityReply,
    SetLocalityRequest, VersionHeader,
};
use tracing::{debug, error, info, instrument, span, warn, Level};

use crate::{
    config, consts,
    daemon::{
        broker::CancelOutcome,
        init_gate::InitGate,
        pipeline::Handles,
        registry::{InsertError, Session},
        signals::ShutdownToken,
    },
    protocol,
};

/// The control plane. Owns nothing but the gate; everything else
/// arrives through it once initialization finishes.
pub struct Server {
    config: config::Config,
    gate: Arc<InitGate<Handles>>,
}

impl Server {
    pub fn new(config: config::Config, gate: Arc<InitGate<Handles>>) -> Arc<Self> {
        Arc::new(Server { config, gate })
    }

    #[instrument(skip_all)]
    pub fn serve(
        server: Arc<Self>,
        listener: UnixListener,
        shutdown: ShutdownToken,
    ) -> anyhow::Result<()> {
        let mut conn_counter = 0;
        for stream in listener.incoming() {
            if shutdown.is_requested() {
                info!("shutdown requested, leaving accept loop");
                break;
            }
            info!("control socket got a new connection");
            match stream {
                Ok(stream) => {
                    conn_counter += 1;
                    let conn_id = conn_counter;
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_conn(stream, conn_id) {
                            error!("handling control connection: {:?}", err)
                        }
                    });
                }
                Err(err) => {
                    error!("accepting stream: {:?}", err);
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(cid = conn_id))]
    fn handle_conn(&self, mut stream: UnixStream, conn_id: usize) -> anyhow::Result<()> {
        if let Err(err) = check_peer(&stream) {
            stream.shutdown(std::net::Shutdown::Both).context("closing stream")?;
            return Err(err);
        }

        // advertize our protocol version to the client so that it can
        // warn about mismatches
        match write_reply(
            &mut stream,
            VersionHeader { version: String::from(tabrd_protocol::VERSION) },
        ) {
            Ok(_) => {}
            Err(e)
                if e.root_cause()
                    .downcast_ref::<io::Error>()
                    .map(|ioe| ioe.kind() == io::ErrorKind::BrokenPipe)
                    .unwrap_or(false) =>
            {
                info!("broken pipe while writing version, likely just a presence probe");
                return Ok(());
            }
            Err(e) => return Err(e).context("while writing version"),
        }

        // clients may hold the connection and issue requests at their
        // own pace, so reads run without a timeout
        loop {
            let request: ControlRequest = match protocol::decode_from(&stream) {
                Ok(r) => r,
                Err(e)
                    if e.root_cause()
                        .downcast_ref::<io::Error>()
                        .map(|ioe| ioe.kind() == io::ErrorKind::UnexpectedEof)
                        .unwrap_or(false) =>
                {
                    debug!("control client hung up");
                    return Ok(());
                }
                Err(e) => return Err(e).context("parsing control request"),
            };

            match request {
                ControlRequest::CreateConnection => {
                    self.handle_create_connection(&mut stream)?;
                }
                ControlRequest::Cancel(r) => self.handle_cancel(&mut stream, r)?,
                ControlRequest::SetLocality(r) => self.handle_set_locality(&mut stream, r)?,
            }
        }
    }

    #[instrument(skip_all)]
    fn handle_create_connection(&self, stream: &mut UnixStream) -> anyhow::Result<()> {
        let handles = self.gate.wait()?;

        let (command_server, command_client) =
            socketpair_stream().context("creating command socketpair")?;
        let (response_server, response_client) =
            socketpair_stream().context("creating response socketpair")?;
        // only the watcher-facing end runs non-blocking
        command_server
            .set_nonblocking(true)
            .context("setting command endpoint nonblocking")?;

        let mut session_id = handles.ids.next_id();
        while handles.registry.contains(session_id) {
            session_id = handles.ids.next_id();
        }

        let session = Arc::new(Session::new(session_id, command_server, response_server));
        let inserted = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            handles.registry.insert(session)
        };
        match inserted {
            Ok(()) => {}
            Err(err) => {
                if let InsertError::DuplicateId = err {
                    warn!("lost an id collision race on {:x}", session_id);
                }
                info!("rejecting connection: {}", err);
                return write_reply(stream, CreateConnectionReply::ResourceExhausted);
            }
        }

        // pull the watcher onto the fresh endpoint
        handles.notifier.notify();

        info!("registered session {:x} ({} active)", session_id, handles.registry.len());
        protocol::encode_to_with_fds(
            &CreateConnectionReply::Created { session_id },
            stream,
            &[command_client.as_raw_fd(), response_client.as_raw_fd()],
        )
        .context("writing create connection reply")?;

        // our copies of the client ends close here; the client holds
        // the kernel-duplicated descriptors from the reply
        Ok(())
    }

    #[instrument(skip_all)]
    fn handle_cancel(&self, stream: &mut UnixStream, request: CancelRequest) -> anyhow::Result<()> {
        let handles = self.gate.wait()?;

        let reply = {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            match handles.registry.lookup(request.session_id) {
                None => CancelReply::UnknownSession,
                Some(session) => match handles.broker.cancel(&session) {
                    CancelOutcome::Cancelled => CancelReply::Success,
                    CancelOutcome::NothingToCancel => CancelReply::NothingToCancel,
                },
            }
        };
        info!("cancel({:x}) -> {:?}", request.session_id, reply);

        write_reply(stream, reply).context("writing cancel reply")
    }

    #[instrument(skip_all)]
    fn handle_set_locality(
        &self,
        stream: &mut UnixStream,
        request: SetLocalityRequest,
    ) -> anyhow::Result<()> {
        let handles = self.gate.wait()?;

        let reply = if request.locality > consts::TPM_LOCALITY_MAX {
            SetLocalityReply::InvalidLocality
        } else {
            let _s = span!(Level::INFO, "lock(sessions)").entered();
            match handles.registry.lookup(request.session_id) {
                None => SetLocalityReply::UnknownSession,
                Some(session) => {
                    // takes effect on the session's next dispatched
                    // command, never on one already in flight
                    session.state().locality = request.locality;
                    SetLocalityReply::Success
                }
            }
        };
        info!("set_locality({:x}, {}) -> {:?}", request.session_id, request.locality, reply);

        write_reply(stream, reply).context("writing set locality reply")
    }
}

fn socketpair_stream() -> anyhow::Result<(UnixStream, UnixStream)> {
    let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::SOCK_CLOEXEC)
        .context("creating socketpair")?;
    Ok((UnixStream::from(a), UnixStream::from(b)))
}

#[instrument(skip_all)]
fn write_reply<H>(stream: &mut UnixStream, reply: H) -> anyhow::Result<()>
where
    H: serde::Serialize,
{
    stream
        .set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
        .context("setting write timeout on control stream")?;

    protocol::encode_to(&reply, &mut *stream).context("writing reply")?;

    stream.set_write_timeout(None).context("unsetting write timeout on control stream")?;

    Ok(())
}

/// check_peer makes sure that a process dialing in on the control
/// socket belongs to the same user the daemon runs as.
#[cfg(target_os = "linux")]
fn check_peer(sock: &UnixStream) -> anyhow::Result<()> {
    use nix::{sys::socket, unistd};

    let peer_creds = socket::getsockopt(sock, socket::sockopt::PeerCredentials)
        .context("could not get peer creds from socket")?;
    let peer_uid = unistd::Uid::from_raw(peer_creds.uid());
    let self_uid = unistd::Uid::current();
    if peer_uid != self_uid {
        return Err(anyhow!("tabrd prohibits connections across users"));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn check_peer(_sock: &UnixStream) -> anyhow::Result<()> {
    Ok(())
}
