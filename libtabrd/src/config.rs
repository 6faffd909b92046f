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

use std::{env, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else if let Ok(home) = env::var("HOME") {
        let mut config_path = PathBuf::from(home);
        config_path.push(".config");
        config_path.push("tabrd");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// The file to read the session id PRNG seed from.
    /// Defaults to /dev/urandom. The daemon refuses to start
    /// if this cannot be read.
    pub entropy_source: Option<String>,

    /// Where to place the control socket when no --socket flag
    /// is given: "user" puts it under $XDG_RUNTIME_DIR, "system"
    /// under /run.
    pub socket_placement: Option<SocketPlacement>,

    /// Where daemon logs go when no --log-file flag is given.
    pub logger: Option<Logger>,

    /// Which TPM transport driver to use.
    pub transport: Option<TransportKind>,

    /// The TPM character device used by the "device" transport.
    /// Defaults to /dev/tpm0.
    pub device: Option<String>,

    /// The largest command frame a client may submit. Oversized
    /// frames close the session. Defaults to the TPM2 maximum
    /// command size.
    pub max_command_size: Option<usize>,

    /// How many sessions may be registered at once. CreateConnection
    /// fails with resource_exhausted beyond this.
    pub max_connections: Option<usize>,

    /// The depth of the two queues between pipeline stages. Small on
    /// purpose, so that misbehaving clients hit backpressure instead
    /// of ballooning daemon memory.
    pub queue_depth: Option<usize>,
}

impl Config {
    pub fn entropy_source(&self) -> &str {
        self.entropy_source.as_deref().unwrap_or(consts::DEFAULT_ENTROPY_SOURCE)
    }

    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or(consts::DEFAULT_TPM_DEVICE)
    }

    pub fn max_command_size(&self) -> usize {
        self.max_command_size.unwrap_or(consts::DEFAULT_MAX_COMMAND_SIZE)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.unwrap_or(consts::DEFAULT_MAX_CONNECTIONS)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue_depth.unwrap_or(consts::DEFAULT_QUEUE_DEPTH)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SocketPlacement {
    #[default]
    User,
    System,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Logger {
    Stdout,
    #[default]
    Stderr,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Device,
    Echo,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_full_config() -> anyhow::Result<()> {
        let config: Config = toml::from_str(
            r#"
            entropy_source = "/dev/hwrng"
            socket_placement = "system"
            logger = "stdout"
            transport = "echo"
            max_command_size = 8192
            max_connections = 4
            queue_depth = 2
        "#,
        )?;

        assert_eq!(config.entropy_source(), "/dev/hwrng");
        assert_eq!(config.socket_placement, Some(SocketPlacement::System));
        assert_eq!(config.logger, Some(Logger::Stdout));
        assert_eq!(config.transport, Some(TransportKind::Echo));
        assert_eq!(config.max_command_size(), 8192);
        assert_eq!(config.max_connections(), 4);
        assert_eq!(config.queue_depth(), 2);

        Ok(())
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.entropy_source(), "/dev/urandom");
        assert_eq!(config.device(), "/dev/tpm0");
        assert_eq!(config.max_command_size(), 4096);
        assert_eq!(config.max_connections(), 27);
    }
}
