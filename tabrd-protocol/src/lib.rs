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

use serde_derive::{Deserialize, Serialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The TPM response code reported on fully successful control operations.
pub const RC_SUCCESS: u32 = 0;

/// The header used to advertize daemon version.
///
/// This header gets written by the daemon to every control stream as
/// soon as it is opened, which allows the client to compare
/// version strings for protocol negotiation (basically just
/// deciding if the user ought to be warned about mismatched
/// versions).
#[derive(Serialize, Deserialize, Debug)]
pub struct VersionHeader {
    pub version: String,
}

/// A control-plane request.
///
/// It uses an enum to allow the different management operations to be
/// issued on the same socket. Every frame on the control socket (in
/// both directions) is prefixed with a 4 byte little endian unsigned
/// word to indicate length.
#[derive(Serialize, Deserialize, Debug)]
pub enum ControlRequest {
    /// Allocate a new broker session.
    ///
    /// Responds with a CreateConnectionReply. On success, the reply
    /// frame carries the client-side command and response file
    /// descriptors (in that order) as SCM_RIGHTS ancillary data.
    CreateConnection,
    /// Cancel the in-flight command of the given session, if any.
    ///
    /// Responds with a CancelReply.
    Cancel(CancelRequest),
    /// Change the TPM locality of the given session. The new locality
    /// takes effect on the next command the broker dispatches for the
    /// session, not on any command already in flight.
    ///
    /// Responds with a SetLocalityReply.
    SetLocality(SetLocalityRequest),
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CancelRequest {
    pub session_id: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SetLocalityRequest {
    pub session_id: u64,
    pub locality: u8,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CreateConnectionReply {
    /// The session was registered. The data-path file descriptors
    /// ride along as ancillary data on this reply frame.
    Created { session_id: u64 },
    /// The daemon is at its connection ceiling.
    ResourceExhausted,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CancelReply {
    /// rc = RC_SUCCESS
    Success,
    /// No session with the given id is registered.
    UnknownSession,
    /// The session exists but has no command queued or executing.
    NothingToCancel,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum SetLocalityReply {
    /// rc = RC_SUCCESS
    Success,
    /// No session with the given id is registered.
    UnknownSession,
    /// The locality value is outside the range the TPM accepts.
    InvalidLocality,
}
