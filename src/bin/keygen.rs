// Copyright (c) 2026 Openmesh Network
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Generate a validator/signer key file and print its public key in the
//! un-padded base64 form the trusted-key list uses.

use anyhow::Result;
use base64::Engine;
use openmesh_core::core::keystore::Keystore;

fn main() -> Result<()> {
    let out_dir = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let keystore = Keystore::open(&out_dir)?;

    let encoded =
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(keystore.public_key());
    println!("{encoded}");
    Ok(())
}
