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

use std::time;

pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// How long the command source parks in poll(2) before rechecking
/// its stop flag. Wakeup pipe writes cut this short.
pub const SOURCE_POLL_MS: u16 = 100;

// The TPM 2.0 command/response header: a 2 byte tag, a 4 byte
// big-endian total length at offset 2, then a 4 byte command or
// response code. The broker never looks past the length field.
pub const TPM_HEADER_SIZE: usize = 10;
pub const TPM_HEADER_LEN_OFFSET: usize = 2;

pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;

// TPM_RC_CANCELED = RC_WARN (0x900) + 0x009
pub const TPM_RC_CANCELED: u32 = 0x909;

/// TPM2_MAX_COMMAND_SIZE. Frames longer than this close the session.
pub const DEFAULT_MAX_COMMAND_SIZE: usize = 4096;

/// Localities 0 through 4 are the ones a TPM will accept on the
/// command interface; everything above is reserved or vendor space.
pub const TPM_LOCALITY_MAX: u8 = 4;

/// Connection ceiling carried over from the original broker daemon.
pub const DEFAULT_MAX_CONNECTIONS: usize = 27;

/// Depth of each inter-stage pipeline queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

pub const DEFAULT_ENTROPY_SOURCE: &str = "/dev/urandom";
pub const DEFAULT_TPM_DEVICE: &str = "/dev/tpm0";
