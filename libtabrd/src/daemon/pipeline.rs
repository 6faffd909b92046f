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
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use anyhow::Context;
use tracing::{error, info, instrument};

use crate::{
    config,
    daemon::{
        broker::{self, BrokerHandle},
        idgen::SessionIdGen,
        registry::SessionRegistry,
        signals::ShutdownToken,
        sink, source,
        transport::TpmTransport,
        wakeup::{Notifier, Wakeup},
    },
};

/// One message travelling a pipeline stage boundary. Ownership moves
/// with it; stages never alias a buffer.
#[derive(Debug)]
pub struct TaggedBuffer {
    pub session_id: u64,
    pub bytes: Vec<u8>,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Command,
    Response,
}

#[derive(Debug)]
pub enum PipelineMsg {
    Buffer(TaggedBuffer),
    /// In-band session teardown: follows the session's last command
    /// through the queues so the sink flushes before closing.
    Close(u64),
}

/// What the control plane needs once the barrier opens.
#[derive(Clone)]
pub struct Handles {
    pub registry: Arc<SessionRegistry>,
    pub broker: BrokerHandle,
    pub notifier: Notifier,
    pub ids: Arc<SessionIdGen>,
}

/// The running three-stage pipeline. Owned by the init/run path;
/// everything the control plane touches is behind Handles.
pub struct Pipeline {
    handles: Handles,
    stop_source: Arc<AtomicBool>,
    source_h: thread::JoinHandle<anyhow::Result<()>>,
    broker_h: thread::JoinHandle<anyhow::Result<()>>,
    sink_h: thread::JoinHandle<anyhow::Result<()>>,
}

/// Wire the queues and spawn the stage threads. Each stage owns the
/// consumer side of its input queue and the producer side of its
/// output queue; no stage holds a pointer to another stage.
#[instrument(skip_all)]
pub fn build(
    config: &config::Config,
    transport: Arc<dyn TpmTransport>,
    ids: Arc<SessionIdGen>,
    shutdown: ShutdownToken,
) -> anyhow::Result<Pipeline> {
    let registry = Arc::new(SessionRegistry::new(config.max_connections()));
    let wakeup = Wakeup::new()?;
    let notifier = wakeup.notifier();
    let broker_handle = BrokerHandle::new(Arc::clone(&transport));

    let (command_tx, command_rx) = crossbeam_channel::bounded(config.queue_depth());
    let (response_tx, response_rx) = crossbeam_channel::bounded(config.queue_depth());

    let stop_source = Arc::new(AtomicBool::new(false));

    let source_h = {
        let args = source::SourceArgs {
            registry: Arc::clone(&registry),
            wakeup,
            output: command_tx,
            stop: Arc::clone(&stop_source),
            max_command_size: config.max_command_size(),
        };
        thread::Builder::new()
            .name(String::from("command-source"))
            .spawn(move || log_if_error("command source", source::run(args)))
            .context("spawning command source thread")?
    };

    let broker_h = {
        let args = broker::BrokerArgs {
            input: command_rx,
            output: response_tx,
            handle: broker_handle.clone(),
            registry: Arc::clone(&registry),
            source_notifier: notifier.clone(),
            shutdown,
        };
        thread::Builder::new()
            .name(String::from("tpm-broker"))
            .spawn(move || log_if_error("broker", broker::run(args)))
            .context("spawning broker thread")?
    };

    let sink_h = {
        let args = sink::SinkArgs { input: response_rx, registry: Arc::clone(&registry) };
        thread::Builder::new()
            .name(String::from("response-sink"))
            .spawn(move || log_if_error("response sink", sink::run(args)))
            .context("spawning response sink thread")?
    };

    info!("pipeline stages running");
    Ok(Pipeline {
        handles: Handles { registry, broker: broker_handle, notifier, ids },
        stop_source,
        source_h,
        broker_h,
        sink_h,
    })
}

impl Pipeline {
    pub fn handles(&self) -> Handles {
        self.handles.clone()
    }

    /// Stop the stages in pipeline order and drain the registry.
    /// Stopping the source drops its sender, which drains the broker,
    /// which drains the sink, so every queued response gets flushed
    /// before any endpoint closes.
    #[instrument(skip_all)]
    pub fn shutdown(self) -> anyhow::Result<()> {
        info!("stopping pipeline stages");
        self.stop_source.store(true, Ordering::Relaxed);
        self.handles.notifier.notify();

        // join everything before propagating errors so a faulted
        // broker never leaves the sink dangling
        let source_res = join_stage("command source", self.source_h);
        let broker_res = join_stage("broker", self.broker_h);
        let sink_res = join_stage("response sink", self.sink_h);

        let drained = self.handles.registry.drain();
        info!("closed {} remaining sessions", drained.len());

        source_res?;
        broker_res?;
        sink_res?;
        Ok(())
    }
}

fn join_stage(name: &str, h: thread::JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    match h.join() {
        Ok(res) => res.with_context(|| format!("within {name} thread")),
        Err(panic_err) => std::panic::resume_unwind(panic_err),
    }
}

fn log_if_error<T, E>(ctx: &str, res: Result<T, E>) -> Result<T, E>
where
    E: std::fmt::Debug,
{
    res.map_err(|e| {
        error!("{}: {:?}", ctx, e);
        e
    })
}
