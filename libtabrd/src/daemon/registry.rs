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
    collections::HashMap,
    os::unix::{io::AsRawFd, net::UnixStream, prelude::RawFd},
    sync::{Arc, Mutex, MutexGuard},
};

/// Session binds one client to its identity and data-path endpoints.
///
/// The endpoint streams are owned by the pipeline threads once the
/// session is registered: the command source reads `command_stream`,
/// the response sink writes `response_stream`. Everything mutable
/// lives behind the session-lock so the control plane can poke at
/// locality and the pending slot without touching the endpoints.
#[derive(Debug)]
pub struct Session {
    id: u64,
    command_stream: UnixStream,
    response_stream: UnixStream,
    state: Mutex<SessionState>,
}

#[derive(Debug)]
pub struct SessionState {
    /// The TPM locality commands for this session execute under.
    /// Mutated only by the control plane; applied by the broker on
    /// the next dispatch.
    pub locality: u8,
    /// The single in-flight command slot.
    pub pending: Pending,
}

/// Where this session's one allowed in-flight command currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// No command outstanding; the command endpoint is watched.
    Idle,
    /// A command sits in the broker's input queue. `cancelled` marks
    /// it for drop-and-synthesize instead of execution.
    Queued { cancelled: bool },
    /// The command is on the TPM right now.
    Active,
    /// Teardown for this session is travelling down the pipeline.
    Closing,
}

impl Session {
    pub fn new(id: u64, command_stream: UnixStream, response_stream: UnixStream) -> Self {
        Session {
            id,
            command_stream,
            response_stream,
            state: Mutex::new(SessionState { locality: 0, pending: Pending::Idle }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command_stream(&self) -> &UnixStream {
        &self.command_stream
    }

    pub fn response_stream(&self) -> &UnixStream {
        &self.response_stream
    }

    /// Take the session-lock. We unwrap to propagate poisoning as
    /// an unwind.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// A session with this id is already registered.
    DuplicateId,
    /// The registry is at its connection ceiling.
    Exhausted,
}

impl std::fmt::Display for InsertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{self:?}")?;
        Ok(())
    }
}

impl std::error::Error for InsertError {}

/// The session table. The internal lock protects the map structure
/// only; per-session mutable fields are guarded by each session's
/// own session-lock.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        SessionRegistry { sessions: Mutex::new(HashMap::new()), max_sessions }
    }

    pub fn insert(&self, session: Arc<Session>) -> Result<(), InsertError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.max_sessions {
            return Err(InsertError::Exhausted);
        }
        if sessions.contains_key(&session.id()) {
            return Err(InsertError::DuplicateId);
        }
        sessions.insert(session.id(), session);
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.sessions.lock().unwrap().contains_key(&id)
    }

    pub fn lookup(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(&id).map(Arc::clone)
    }

    /// Identify the session owning a command endpoint that just
    /// became readable.
    pub fn lookup_by_command_fd(&self, fd: RawFd) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        sessions.values().find(|s| s.command_stream().as_raw_fd() == fd).map(Arc::clone)
    }

    /// Atomically unregister a session. The caller's Arc is the last
    /// pipeline reference; the endpoints close when it drops.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().remove(&id)
    }

    /// A point-in-time snapshot of every registered session, used by
    /// the command source to rebuild its readiness set.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().map(Arc::clone).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Empty the table at shutdown, handing every session back so the
    /// caller can close the endpoints.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_session(id: u64) -> anyhow::Result<Arc<Session>> {
        let (cmd, _cmd_client) = UnixStream::pair()?;
        let (resp, _resp_client) = UnixStream::pair()?;
        Ok(Arc::new(Session::new(id, cmd, resp)))
    }

    #[test]
    fn insert_and_lookup() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(4);
        registry.insert(test_session(1)?).expect("insert to succeed");

        assert!(registry.contains(1));
        assert_eq!(registry.lookup(1).expect("lookup to succeed").id(), 1);
        assert!(registry.lookup(2).is_none());
        Ok(())
    }

    #[test]
    fn duplicate_id_rejected() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(4);
        registry.insert(test_session(1)?).expect("insert to succeed");
        assert_eq!(registry.insert(test_session(1)?), Err(InsertError::DuplicateId));
        Ok(())
    }

    #[test]
    fn capacity_enforced() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(2);
        registry.insert(test_session(1)?).expect("insert 1");
        registry.insert(test_session(2)?).expect("insert 2");
        assert_eq!(registry.insert(test_session(3)?), Err(InsertError::Exhausted));

        // capacity frees up on remove
        assert!(registry.remove(1).is_some());
        registry.insert(test_session(3)?).expect("insert 3 after remove");
        Ok(())
    }

    #[test]
    fn lookup_by_command_fd() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(4);
        let session = test_session(9)?;
        let fd = session.command_stream().as_raw_fd();
        registry.insert(Arc::clone(&session))?;

        assert_eq!(registry.lookup_by_command_fd(fd).expect("fd lookup").id(), 9);
        assert!(registry.lookup_by_command_fd(-1).is_none());
        Ok(())
    }

    #[test]
    fn snapshot_and_drain() -> anyhow::Result<()> {
        let registry = SessionRegistry::new(4);
        registry.insert(test_session(1)?)?;
        registry.insert(test_session(2)?)?;

        let mut ids: Vec<u64> = registry.snapshot().iter().map(|s| s.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);

        assert_eq!(registry.drain().len(), 2);
        assert_eq!(registry.len(), 0);
        Ok(())
    }

    #[test]
    fn session_lock_guards_mutable_state() -> anyhow::Result<()> {
        let session = test_session(1)?;
        assert_eq!(session.state().locality, 0);
        assert_eq!(session.state().pending, Pending::Idle);

        session.state().locality = 3;
        session.state().pending = Pending::Queued { cancelled: false };
        assert_eq!(session.state().locality, 3);
        assert_eq!(session.state().pending, Pending::Queued { cancelled: false });
        Ok(())
    }
}
