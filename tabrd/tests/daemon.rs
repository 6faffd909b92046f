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

use anyhow::Context;
use byteorder::{BigEndian, ByteOrder};
use ntest::timeout;
use tabrd_protocol::{CancelReply, SetLocalityReply};

mod support;

// A 12 byte no-sessions TPM2_CC_SelfTest command frame.
const SELF_TEST: [u8; 12] =
    [0x80, 0x01, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x01, 0x44, 0x00, 0x00];

#[test]
#[timeout(30000)]
fn start() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon = support::daemon::Proc::new().context("starting daemon")?;

        // The daemon should start up and run without incident for
        // half a second.
        std::thread::sleep(time::Duration::from_millis(500));
        assert!(daemon.proc.try_wait()?.is_none(), "daemon exited early");

        assert!(daemon.log_contents()?.contains("STARTING DAEMON"));

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn echo_round_trip() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        let mut conn = client.create_connection().context("creating session")?;
        assert_ne!(conn.session_id, 0);

        conn.send_command(&SELF_TEST)?;
        let response = conn.read_response()?;
        assert_eq!(response, SELF_TEST);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn several_sessions_on_one_control_connection() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        let mut a = client.create_connection().context("creating session a")?;
        let mut b = client.create_connection().context("creating session b")?;
        assert_ne!(a.session_id, b.session_id);

        b.send_command(&SELF_TEST)?;
        assert_eq!(b.read_response()?, SELF_TEST);
        a.send_command(&SELF_TEST)?;
        assert_eq!(a.read_response()?, SELF_TEST);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn unknown_session_errors() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        assert_eq!(client.cancel(0xdead_beef)?, CancelReply::UnknownSession);
        assert_eq!(client.set_locality(0xdead_beef, 0)?, SetLocalityReply::UnknownSession);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn cancel_with_nothing_outstanding() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        let mut conn = client.create_connection().context("creating session")?;
        assert_eq!(client.cancel(conn.session_id)?, CancelReply::NothingToCancel);

        // the session stays usable afterwards
        conn.send_command(&SELF_TEST)?;
        assert_eq!(conn.read_response()?, SELF_TEST);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn set_locality_validation() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        let conn = client.create_connection().context("creating session")?;
        assert_eq!(client.set_locality(conn.session_id, 3)?, SetLocalityReply::Success);
        assert_eq!(client.set_locality(conn.session_id, 5)?, SetLocalityReply::InvalidLocality);

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn connection_ceiling() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::with_config(
            r#"
            transport = "echo"
            max_connections = 1
        "#,
        )
        .context("starting daemon")?;
        let mut client = daemon.client()?;

        let _conn = client.create_connection().context("creating first session")?;
        let err = client
            .create_connection()
            .expect_err("second session should hit the ceiling");
        assert!(format!("{err:#}").contains("ceiling"));

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn responses_flushed_across_cancel() -> anyhow::Result<()> {
    support::dump_err(|| {
        let daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;
        let mut conn = client.create_connection().context("creating session")?;

        // interleave control ops with data traffic on one session
        for round in 0..10u16 {
            let mut frame = SELF_TEST.to_vec();
            BigEndian::write_u16(&mut frame[10..12], round);
            conn.send_command(&frame)?;
            assert_eq!(conn.read_response()?, frame);
            assert_eq!(client.cancel(conn.session_id)?, CancelReply::NothingToCancel);
        }

        Ok(())
    })
}

#[test]
#[timeout(30000)]
fn sigterm_shuts_down_cleanly() -> anyhow::Result<()> {
    support::dump_err(|| {
        let mut daemon = support::daemon::Proc::new().context("starting daemon")?;
        let mut client = daemon.client()?;

        let mut conn = client.create_connection().context("creating session")?;
        conn.send_command(&SELF_TEST)?;
        assert_eq!(conn.read_response()?, SELF_TEST);

        daemon.term()?;
        let status = daemon.wait_exit(time::Duration::from_secs(10))?;
        assert!(status.success(), "daemon exited with {status:?}");

        // the socket file is gone once shutdown completes
        assert!(!daemon.socket_path.exists());

        Ok(())
    })
}
