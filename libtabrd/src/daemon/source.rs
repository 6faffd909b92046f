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
    cmp,
    collections::HashMap,
    io::{self, Read},
    mem,
    os::{
        fd::AsFd,
        unix::{io::AsRawFd, net::UnixStream, prelude::RawFd},
    },
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ByteOrder};
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    consts,
    daemon::{
        pipeline::{BufferKind, PipelineMsg, TaggedBuffer},
        registry::{Pending, Session, SessionRegistry},
        wakeup::Wakeup,
    },
};

// the length field ends here; we can size the frame once we have
// this much
const LEN_END: usize = consts::TPM_HEADER_LEN_OFFSET + 4;

pub struct SourceArgs {
    pub registry: Arc<SessionRegistry>,
    pub wakeup: Wakeup,
    pub output: crossbeam_channel::Sender<PipelineMsg>,
    pub stop: Arc<AtomicBool>,
    pub max_command_size: usize,
}

/// The command source thread: watches every idle session's command
/// endpoint plus the wakeup channel, reassembles framed TPM commands,
/// and feeds them to the broker tagged with their session id.
#[instrument(skip_all)]
pub fn run(args: SourceArgs) -> anyhow::Result<()> {
    let mut partials: HashMap<u64, FrameReader> = HashMap::new();

    loop {
        if args.stop.load(Ordering::Relaxed) {
            info!("recvd stop msg");
            return Ok(());
        }

        let snapshot = args.registry.snapshot();
        // forget reassembly state for sessions that are gone
        partials.retain(|id, _| snapshot.iter().any(|s| s.id() == *id));

        // Sessions with a queued or active command are left out of the
        // readiness set: one in-flight command per session is the deal,
        // and it is also what keeps a flooding client from starving
        // everyone else.
        let watched: Vec<&Arc<Session>> = snapshot
            .iter()
            .filter(|s| matches!(s.state().pending, Pending::Idle))
            .collect();

        let mut poll_fds = Vec::with_capacity(watched.len() + 1);
        poll_fds.push(PollFd::new(args.wakeup.as_fd(), PollFlags::POLLIN));
        for session in &watched {
            poll_fds.push(PollFd::new(session.command_stream().as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut poll_fds, consts::SOURCE_POLL_MS) {
            Ok(0) => continue, // timeout, recheck the stop flag
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("polling session endpoints"),
        }

        let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let wakeup_ready =
            poll_fds[0].revents().map(|r| r.intersects(readable)).unwrap_or(false);
        let ready_fds: Vec<RawFd> = poll_fds
            .iter()
            .skip(1)
            .zip(watched.iter())
            .filter(|(pfd, _)| pfd.revents().map(|r| r.intersects(readable)).unwrap_or(false))
            .map(|(_, session)| session.command_stream().as_raw_fd())
            .collect();
        drop(poll_fds);
        drop(watched);
        drop(snapshot);

        if wakeup_ready {
            trace!("wakeup poked, resyncing with registry");
            args.wakeup.drain();
        }

        for fd in ready_fds {
            // re-resolve through the registry: the session may have
            // been removed while we were away in poll
            let Some(session) = args.registry.lookup_by_command_fd(fd) else {
                continue;
            };
            if service_session(&session, &mut partials, &args)? {
                // pipeline is gone, nothing left to read for
                return Ok(());
            }
        }
    }
}

/// Pump one readable session. Returns true if the downstream queue
/// has hung up and the thread should exit.
fn service_session(
    session: &Arc<Session>,
    partials: &mut HashMap<u64, FrameReader>,
    args: &SourceArgs,
) -> anyhow::Result<bool> {
    let id = session.id();
    let reader = partials.entry(id).or_default();

    match reader.fill(session.command_stream(), args.max_command_size) {
        Ok(Fill::Complete(bytes)) => {
            partials.remove(&id);
            trace!("read {} byte command for session {:x}", bytes.len(), id);
            {
                let mut state = session.state();
                if matches!(state.pending, Pending::Closing) {
                    return Ok(false);
                }
                state.pending = Pending::Queued { cancelled: false };
            }
            let msg = PipelineMsg::Buffer(TaggedBuffer {
                session_id: id,
                bytes,
                kind: BufferKind::Command,
            });
            if args.output.send(msg).is_err() {
                info!("broker queue closed, exiting");
                return Ok(true);
            }
        }
        Ok(Fill::Pending) => {
            // uncooperative client; resume on next readiness
        }
        Ok(Fill::Eof) => {
            debug!("eof on command endpoint for session {:x}", id);
            return close_session(session, partials, args);
        }
        Err(err) => {
            warn!("dropping session {:x}: {:#}", id, err);
            return close_session(session, partials, args);
        }
    }

    Ok(false)
}

fn close_session(
    session: &Arc<Session>,
    partials: &mut HashMap<u64, FrameReader>,
    args: &SourceArgs,
) -> anyhow::Result<bool> {
    let id = session.id();
    partials.remove(&id);
    session.state().pending = Pending::Closing;
    // the close rides the pipeline behind any in-flight command so
    // the sink flushes every queued response before the endpoints go
    if args.output.send(PipelineMsg::Close(id)).is_err() {
        info!("broker queue closed, exiting");
        return Ok(true);
    }
    Ok(false)
}

/// Incremental reassembly of one TPM command frame from a
/// non-blocking stream.
#[derive(Default)]
struct FrameReader {
    buf: Vec<u8>,
}

enum Fill {
    Complete(Vec<u8>),
    Pending,
    Eof,
}

impl FrameReader {
    /// Pull whatever the socket has. Stops at a complete frame, at
    /// WouldBlock, or at EOF; malformed length fields are errors.
    fn fill(&mut self, stream: &UnixStream, max_size: usize) -> anyhow::Result<Fill> {
        let mut stream = stream;
        loop {
            let have = self.buf.len();
            let need = if have < LEN_END {
                LEN_END - have
            } else {
                let total =
                    BigEndian::read_u32(&self.buf[consts::TPM_HEADER_LEN_OFFSET..LEN_END]) as usize;
                if total < consts::TPM_HEADER_SIZE {
                    return Err(anyhow!("frame length {} below the TPM header size", total));
                }
                if total > max_size {
                    return Err(anyhow!(
                        "frame length {} exceeds the maximum command size {}",
                        total,
                        max_size
                    ));
                }
                if have == total {
                    return Ok(Fill::Complete(mem::take(&mut self.buf)));
                }
                total - have
            };

            let mut chunk = [0u8; 4096];
            let want = cmp::min(need, chunk.len());
            match stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(Fill::Eof),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading command endpoint"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    fn frame(total_len: usize) -> Vec<u8> {
        let mut f = vec![0u8; total_len];
        BigEndian::write_u16(&mut f[0..2], consts::TPM_ST_NO_SESSIONS);
        BigEndian::write_u32(&mut f[2..6], total_len as u32);
        f
    }

    fn pair() -> anyhow::Result<(UnixStream, UnixStream)> {
        let (server, client) = UnixStream::pair()?;
        server.set_nonblocking(true)?;
        Ok((server, client))
    }

    #[test]
    fn whole_frame_in_one_read() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let f = frame(12);
        client.write_all(&f)?;

        let mut reader = FrameReader::default();
        match reader.fill(&server, 4096)? {
            Fill::Complete(bytes) => assert_eq!(bytes, f),
            _ => panic!("expected a complete frame"),
        }
        Ok(())
    }

    #[test]
    fn partial_reads_resume() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let f = frame(32);

        let mut reader = FrameReader::default();
        client.write_all(&f[..3])?;
        assert!(matches!(reader.fill(&server, 4096)?, Fill::Pending));

        client.write_all(&f[3..20])?;
        assert!(matches!(reader.fill(&server, 4096)?, Fill::Pending));

        client.write_all(&f[20..])?;
        match reader.fill(&server, 4096)? {
            Fill::Complete(bytes) => assert_eq!(bytes, f),
            _ => panic!("expected a complete frame"),
        }
        Ok(())
    }

    #[test]
    fn back_to_back_frames() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let first = frame(16);
        let second = frame(24);
        client.write_all(&first)?;
        client.write_all(&second)?;

        let mut reader = FrameReader::default();
        match reader.fill(&server, 4096)? {
            Fill::Complete(bytes) => assert_eq!(bytes, first),
            _ => panic!("expected first frame"),
        }
        match reader.fill(&server, 4096)? {
            Fill::Complete(bytes) => assert_eq!(bytes, second),
            _ => panic!("expected second frame"),
        }
        Ok(())
    }

    #[test]
    fn undersized_length_is_an_error() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let mut f = frame(12);
        BigEndian::write_u32(&mut f[2..6], 4);
        client.write_all(&f)?;

        let mut reader = FrameReader::default();
        assert!(reader.fill(&server, 4096).is_err());
        Ok(())
    }

    #[test]
    fn oversized_length_is_an_error() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let f = frame(64);
        client.write_all(&f)?;

        let mut reader = FrameReader::default();
        assert!(reader.fill(&server, 63).is_err());
        Ok(())
    }

    #[test]
    fn max_sized_frame_is_fine() -> anyhow::Result<()> {
        let (server, mut client) = pair()?;
        let f = frame(64);
        client.write_all(&f)?;

        let mut reader = FrameReader::default();
        match reader.fill(&server, 64)? {
            Fill::Complete(bytes) => assert_eq!(bytes.len(), 64),
            _ => panic!("expected a complete frame"),
        }
        Ok(())
    }

    #[test]
    fn eof_reported() -> anyhow::Result<()> {
        let (server, client) = pair()?;
        drop(client);

        let mut reader = FrameReader::default();
        assert!(matches!(reader.fill(&server, 4096)?, Fill::Eof));
        Ok(())
    }
}
