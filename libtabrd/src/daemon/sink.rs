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

use std::{io::Write, sync::Arc};

use tracing::{debug, info, instrument, trace, warn};

use crate::daemon::{
    pipeline::{BufferKind, PipelineMsg},
    registry::SessionRegistry,
};

pub struct SinkArgs {
    pub input: crossbeam_channel::Receiver<PipelineMsg>,
    pub registry: Arc<SessionRegistry>,
}

/// The response sink thread: writes each tagged response to its
/// session's response endpoint, in queue order. Close requests
/// unregister the session; because the queue is FIFO, every response
/// produced before the close has already been written by the time the
/// endpoints drop.
#[instrument(skip_all)]
pub fn run(args: SinkArgs) -> anyhow::Result<()> {
    for msg in args.input.iter() {
        match msg {
            PipelineMsg::Buffer(response) => {
                debug_assert_eq!(response.kind, BufferKind::Response);
                let Some(session) = args.registry.lookup(response.session_id) else {
                    debug!("dropping response for departed session {:x}", response.session_id);
                    continue;
                };
                let mut stream = session.response_stream();
                if let Err(e) = stream.write_all(&response.bytes) {
                    // client is gone or wedged; it forfeits the session
                    warn!("response write error for session {:x}: {}", session.id(), e);
                    args.registry.remove(session.id());
                    continue;
                }
                trace!(
                    "wrote {} byte response for session {:x}",
                    response.bytes.len(),
                    session.id()
                );
            }
            PipelineMsg::Close(id) => {
                if args.registry.remove(id).is_some() {
                    debug!("closed session {:x}", id);
                }
            }
        }
    }

    info!("input queue closed, drained and exiting");
    Ok(())
}
