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
    io::{self, IoSlice, IoSliceMut, Read, Write},
    os::{
        fd::{FromRawFd, OwnedFd},
        unix::{
            io::{AsRawFd, RawFd},
            net::UnixStream,
        },
    },
    path::Path,
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt as _, WriteBytesExt as _};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use serde::{Deserialize, Serialize};
use tabrd_protocol::{
    CancelReply, CancelRequest, ControlRequest, CreateConnectionReply, SetLocalityReply,
    SetLocalityRequest, VersionHeader,
};
use tracing::{info, instrument, warn};

use crate::consts;

/// Control frames are small; anything bigger than this is a framing
/// error, not a legitimate request.
const CONTROL_FRAME_MAX: usize = 4096;

/// The centralized encoding function that should be used for all
/// control protocol serialization. Frames are a 4 byte little endian
/// length followed by a msgpack body.
pub fn encode_to<T, W>(d: &T, mut w: W) -> anyhow::Result<()>
where
    T: Serialize,
    W: Write,
{
    let frame = encode_frame(d)?;
    w.write_all(&frame).context("writing control frame")?;
    Ok(())
}

/// The centralized decoding function that should be used for all
/// control protocol deserialization.
pub fn decode_from<T, R>(mut r: R) -> anyhow::Result<T>
where
    for<'de> T: Deserialize<'de>,
    R: Read,
{
    let len = r.read_u32::<LittleEndian>().context("reading control frame length")? as usize;
    if len > CONTROL_FRAME_MAX {
        return Err(anyhow!("control frame of {} bytes exceeds limit", len));
    }
    let mut payload = vec![0; len];
    r.read_exact(&mut payload).context("reading control frame body")?;

    let mut deserializer = rmp_serde::Deserializer::new(io::Cursor::new(payload));
    let d: T = Deserialize::deserialize(&mut deserializer).context("deserializing frame body")?;
    Ok(d)
}

fn encode_frame<T>(d: &T) -> anyhow::Result<Vec<u8>>
where
    T: Serialize,
{
    // You might be worried that unknown fields could mangle followup
    // frames, but msgpack is basically binary encoded json, so it can
    // skip past fields it does not know about, and the length prefix
    // hard-delimits every frame anyway.
    let mut payload = vec![];
    let mut serializer = rmp_serde::Serializer::new(&mut payload).with_struct_map();
    d.serialize(&mut serializer).context("serializing control frame")?;

    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.write_u32::<LittleEndian>(payload.len() as u32).context("writing length prefix")?;
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Send a control frame with file descriptors riding along as
/// SCM_RIGHTS ancillary data. The descriptors are attached to the
/// first byte of the frame, so a single sendmsg covers them even if
/// the stream write gets split.
pub fn encode_to_with_fds<T>(d: &T, stream: &UnixStream, fds: &[RawFd]) -> anyhow::Result<()>
where
    T: Serialize,
{
    let frame = encode_frame(d)?;
    let iov = [IoSlice::new(&frame)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let n = loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(n) => break n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("sendmsg with fds"),
        }
    };
    if n < frame.len() {
        (&*stream).write_all(&frame[n..]).context("writing control frame tail")?;
    }
    Ok(())
}

/// Receive a control frame plus any file descriptors attached to it.
pub fn decode_from_with_fds<T>(stream: &UnixStream) -> anyhow::Result<(T, Vec<OwnedFd>)>
where
    for<'de> T: Deserialize<'de>,
{
    let mut buf = vec![0u8; CONTROL_FRAME_MAX + 4];
    let mut fds = vec![];
    let mut filled = 0;

    let total = loop {
        if filled >= 4 {
            let len = LittleEndian::read_u32(&buf[..4]) as usize;
            if len > CONTROL_FRAME_MAX {
                return Err(anyhow!("control frame of {} bytes exceeds limit", len));
            }
            if filled >= 4 + len {
                break 4 + len;
            }
        }

        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut buf[filled..])];
            let msg = loop {
                match recvmsg::<()>(
                    stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                ) {
                    Ok(msg) => break msg,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("recvmsg with fds"),
                }
            };
            for cmsg in msg.cmsgs().context("walking control messages")? {
                if let ControlMessageOwned::ScmRights(received) = cmsg {
                    for fd in received {
                        // Safety: the kernel just handed us ownership of
                        // this descriptor via SCM_RIGHTS.
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            msg.bytes
        };
        if bytes == 0 {
            return Err(anyhow!("eof while reading control frame"));
        }
        filled += bytes;
    };

    let mut deserializer = rmp_serde::Deserializer::new(io::Cursor::new(&buf[4..total]));
    let d: T = Deserialize::deserialize(&mut deserializer).context("deserializing frame body")?;
    Ok((d, fds))
}

/// Read one TPM command/response frame from a blocking stream: the 10
/// byte header first, then however many bytes its big-endian length
/// field at offset 2 promises.
pub fn read_tpm_frame<R>(r: &mut R) -> anyhow::Result<Vec<u8>>
where
    R: Read,
{
    let mut frame = vec![0; consts::TPM_HEADER_SIZE];
    r.read_exact(&mut frame).context("reading TPM header")?;
    let len = BigEndian::read_u32(&frame[consts::TPM_HEADER_LEN_OFFSET..consts::TPM_HEADER_LEN_OFFSET + 4])
        as usize;
    if len < consts::TPM_HEADER_SIZE {
        return Err(anyhow!("TPM frame length {} below header size", len));
    }
    frame.resize(len, 0);
    r.read_exact(&mut frame[consts::TPM_HEADER_SIZE..]).context("reading TPM frame body")?;
    Ok(frame)
}

pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Dial the control socket and absorb the daemon's version header.
    pub fn new<P: AsRef<Path>>(sock: P) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(sock).context("connecting to tabrd")?;

        let daemon_version: VersionHeader =
            decode_from(&stream).context("reading daemon version header")?;
        info!("read daemon version header: {:?}", daemon_version);
        if daemon_version.version != tabrd_protocol::VERSION {
            warn!(
                "client protocol (version {:?}) differs from daemon protocol (version {:?})",
                tabrd_protocol::VERSION,
                daemon_version.version,
            );
        }

        Ok(Client { stream })
    }

    /// Ask the daemon for a fresh session. The returned connection
    /// owns the client ends of the data-path sockets.
    #[instrument(skip_all)]
    pub fn create_connection(&mut self) -> anyhow::Result<BrokerConnection> {
        encode_to(&ControlRequest::CreateConnection, &self.stream)
            .context("writing create connection request")?;
        let (reply, mut fds): (CreateConnectionReply, Vec<OwnedFd>) =
            decode_from_with_fds(&self.stream).context("reading create connection reply")?;

        match reply {
            CreateConnectionReply::Created { session_id } => {
                if fds.len() != 2 {
                    return Err(anyhow!("expected 2 session fds on reply, got {}", fds.len()));
                }
                let response = UnixStream::from(fds.pop().ok_or(anyhow!("missing response fd"))?);
                let command = UnixStream::from(fds.pop().ok_or(anyhow!("missing command fd"))?);
                Ok(BrokerConnection { session_id, command, response })
            }
            CreateConnectionReply::ResourceExhausted => {
                Err(anyhow!("daemon is at its connection ceiling"))
            }
        }
    }

    #[instrument(skip_all)]
    pub fn cancel(&mut self, session_id: u64) -> anyhow::Result<CancelReply> {
        encode_to(&ControlRequest::Cancel(CancelRequest { session_id }), &self.stream)
            .context("writing cancel request")?;
        decode_from(&self.stream).context("reading cancel reply")
    }

    #[instrument(skip_all)]
    pub fn set_locality(
        &mut self,
        session_id: u64,
        locality: u8,
    ) -> anyhow::Result<SetLocalityReply> {
        encode_to(
            &ControlRequest::SetLocality(SetLocalityRequest { session_id, locality }),
            &self.stream,
        )
        .context("writing set locality request")?;
        decode_from(&self.stream).context("reading set locality reply")
    }
}

/// The client half of one broker session: an id for control
/// operations plus the two data-path streams.
#[derive(Debug)]
pub struct BrokerConnection {
    pub session_id: u64,
    command: UnixStream,
    response: UnixStream,
}

impl BrokerConnection {
    /// Submit one framed TPM command.
    pub fn send_command(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.command.write_all(frame).context("writing command frame")?;
        Ok(())
    }

    /// Block until the next response frame for this session arrives.
    pub fn read_response(&mut self) -> anyhow::Result<Vec<u8>> {
        read_tpm_frame(&mut self.response)
    }

    /// Close the command direction while leaving the response
    /// direction open, as a client that is done submitting would.
    pub fn close_command(&mut self) -> anyhow::Result<()> {
        self.command.shutdown(std::net::Shutdown::Both).context("closing command stream")?;
        Ok(())
    }
}
