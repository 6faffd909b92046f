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
/// tabrd is a user-space access broker for TPM 2.0 devices. It owns
/// the TPM transport and lets many local clients issue commands
/// concurrently, each over its own session.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libtabrd::Args::parse();

    if args.version() {
        println!("tabrd {VERSION}");
        return Ok(());
    }

    libtabrd::run(args)
}
