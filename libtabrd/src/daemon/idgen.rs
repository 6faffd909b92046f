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

use std::{fs, io::Read, path::Path, sync::Mutex};

use anyhow::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

/// Session ids must be unpredictable so one client cannot guess
/// another's id and cancel its commands. StdRng is a CSPRNG; we seed
/// it once at startup from the configured entropy source and draw
/// full 64-bit ids from it.
pub struct SessionIdGen {
    rng: Mutex<StdRng>,
}

impl SessionIdGen {
    pub fn from_entropy_source<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut seed = [0u8; 32];
        let mut entropy = fs::File::open(path)
            .with_context(|| format!("opening entropy source {path:?}"))?;
        entropy
            .read_exact(&mut seed)
            .with_context(|| format!("reading PRNG seed from {path:?}"))?;
        info!("seeded session id generator from {:?}", path);

        Ok(SessionIdGen { rng: Mutex::new(StdRng::from_seed(seed)) })
    }

    #[cfg(test)]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        SessionIdGen { rng: Mutex::new(StdRng::from_seed(seed)) }
    }

    /// Draw the next id. Zero is reserved as "no session" in a few
    /// client libraries, so it is never handed out.
    pub fn next_id(&self) -> u64 {
        let mut rng = self.rng.lock().unwrap();
        loop {
            let id: u64 = rng.gen();
            if id != 0 {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn deterministic_for_fixed_seed() {
        let a = SessionIdGen::from_seed([7u8; 32]);
        let b = SessionIdGen::from_seed([7u8; 32]);
        for _ in 0..32 {
            assert_eq!(a.next_id(), b.next_id());
        }
    }

    #[test]
    fn ids_nonzero_and_distinct() {
        let ids = SessionIdGen::from_seed([0u8; 32]);
        let mut seen = HashSet::new();
        for _ in 0..1024 {
            let id = ids.next_id();
            assert_ne!(id, 0);
            assert!(seen.insert(id), "id {id:#x} repeated");
        }
    }

    #[test]
    fn seeds_from_file() -> anyhow::Result<()> {
        let mut entropy = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut entropy, &[42u8; 64])?;

        let ids = SessionIdGen::from_entropy_source(entropy.path())?;
        assert_ne!(ids.next_id(), 0);
        Ok(())
    }

    #[test]
    fn unreadable_entropy_source_fails() {
        assert!(SessionIdGen::from_entropy_source("/nonexistent/entropy").is_err());
    }
}
