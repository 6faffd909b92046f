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
    fs,
    os::unix::net::UnixStream,
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::Context;
use tempfile::TempDir;

use super::wait_until;

/// The config handed to test daemons: the loopback transport, a low
/// connection ceiling so exhaustion is testable, and a small frame
/// limit so boundary tests stay cheap.
const TEST_CONFIG: &str = r#"
transport = "echo"
max_connections = 4
"#;

/// Proc is a helper handle for a `tabrd daemon` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub tmp_dir: Option<TempDir>,
    pub log_file: PathBuf,
    pub socket_path: PathBuf,
}

impl Proc {
    pub fn new() -> anyhow::Result<Proc> {
        Self::with_config(TEST_CONFIG)
    }

    pub fn with_config(config: &str) -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("tabrd-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;

        let config_path = tmp_dir.path().join("config.toml");
        fs::write(&config_path, config).context("writing test config")?;

        let socket_path = tmp_dir.path().join("tabrd.socket");
        let log_file = tmp_dir.path().join("daemon.log");
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        let proc = Command::new(env!("CARGO_BIN_EXE_tabrd"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&socket_path)
            .arg("--config-file")
            .arg(&config_path)
            .arg("daemon")
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the socket successfully
        wait_until(|| Ok(UnixStream::connect(&socket_path).is_ok()))
            .context("waiting for daemon socket")?;

        Ok(Proc { proc, tmp_dir: Some(tmp_dir), log_file, socket_path })
    }

    pub fn client(&self) -> anyhow::Result<libtabrd::Client> {
        libtabrd::Client::new(&self.socket_path)
    }

    pub fn term(&self) -> anyhow::Result<()> {
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(self.proc.id() as i32),
            nix::sys::signal::Signal::SIGTERM,
        )
        .context("sending SIGTERM to daemon")?;
        Ok(())
    }

    /// Block until the daemon exits, with a bounded wait.
    pub fn wait_exit(&mut self, timeout: time::Duration) -> anyhow::Result<process::ExitStatus> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.proc.try_wait().context("polling daemon proc")? {
                return Ok(status);
            }
            if time::Instant::now() > deadline {
                return Err(anyhow::anyhow!("daemon did not exit within {:?}", timeout));
            }
            std::thread::sleep(time::Duration::from_millis(20));
        }
    }

    pub fn log_contents(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.log_file).context("slurping daemon log")
    }
}

impl std::ops::Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing daemon proc: {:?}", e);
        }
        if std::env::var("TABRD_LEAVE_TEST_LOGS").unwrap_or(String::from("")) == "true" {
            self.tmp_dir.take().map(|d| d.into_path());
        }
    }
}
