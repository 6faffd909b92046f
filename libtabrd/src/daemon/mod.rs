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

use std::{fs, os::unix::net::UnixListener, path::PathBuf, sync::Arc, thread};

use anyhow::Context;
use tracing::{error, info, instrument, warn};

use crate::config;

mod broker;
mod idgen;
mod init_gate;
mod pipeline;
mod registry;
mod server;
mod signals;
mod sink;
mod source;
mod transport;
mod wakeup;

#[instrument(skip_all)]
pub fn run(config: config::Config, socket: PathBuf) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING DAEMON ============================\n\n");

    // Bind the control socket right away so the public endpoint is
    // reachable while the heavier initialization runs; handlers park
    // on the barrier until it opens.
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).context("creating control socket directory")?;
    }
    let listener = UnixListener::bind(&socket).context("binding to control socket")?;

    let shutdown = signals::ShutdownToken::new(socket.clone());
    signals::Handler::new(shutdown.clone()).spawn()?;

    let gate: Arc<init_gate::InitGate<pipeline::Handles>> = Arc::new(init_gate::InitGate::new());

    let init_h = {
        let gate = Arc::clone(&gate);
        let shutdown = shutdown.clone();
        let config = config.clone();
        thread::Builder::new()
            .name(String::from("init"))
            .spawn(move || -> anyhow::Result<pipeline::Pipeline> {
                match init_pipeline(&config, shutdown.clone()) {
                    Ok(pipeline) => {
                        gate.open(pipeline.handles());
                        info!("initialization complete, barrier open");
                        Ok(pipeline)
                    }
                    Err(err) => {
                        error!("initialization failed: {:?}", err);
                        gate.fail(format!("{err:#}"));
                        shutdown.request();
                        Err(err)
                    }
                }
            })
            .context("spawning init thread")?
    };

    let server = server::Server::new(config, gate);
    server::Server::serve(server, listener, shutdown)?;

    // orderly teardown: control surface first, then the stages in
    // pipeline order, then the registry
    info!("control surface stopped, cleaning up socket");
    if let Err(e) = fs::remove_file(&socket) {
        warn!("cleaning up socket file: {}", e);
    }

    let pipeline = match init_h.join() {
        Ok(res) => res?,
        Err(panic_err) => std::panic::resume_unwind(panic_err),
    };
    pipeline.shutdown()
}

#[instrument(skip_all)]
fn init_pipeline(
    config: &config::Config,
    shutdown: signals::ShutdownToken,
) -> anyhow::Result<pipeline::Pipeline> {
    let ids = Arc::new(
        idgen::SessionIdGen::from_entropy_source(config.entropy_source())
            .context("seeding the session id generator")?,
    );
    let transport = transport::init(config).context("initializing the TPM transport")?;
    pipeline::build(config, transport, ids, shutdown)
}
