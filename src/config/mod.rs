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
#![warn(missing_docs)]

//! Configuration: a YAML file located by the `--config` flag.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "openmesh-core", version, about = "Openmesh data-oracle node")]
pub struct Flags {
    /// Configuration file name and path.
    #[arg(long, default_value = "./config.yml")]
    pub config: PathBuf,
}

/// Config errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read the configuration")]
    Read,
    #[error("failed to parse the configuration")]
    Parse,
}

/// Node configuration root.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    pub node: NodeSettings,
    /// Metrics HTTP endpoint.
    pub http: HttpConfig,
    /// P2P settings.
    pub p2p: P2pConfig,
    /// BFT engine settings.
    pub bft: BftConfig,
    /// Logger settings.
    pub log: LogConfig,
}

/// Node settings.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (db + keys).
    pub data_dir: String,
}

/// Metrics HTTP config.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    /// Listen address, e.g. 0.0.0.0:9090.
    pub listen_addr: String,
}

/// P2P overlay config.
#[derive(Clone, Debug, Deserialize)]
pub struct P2pConfig {
    /// Listening address (default: 0.0.0.0).
    pub addr: String,
    /// Listening port.
    pub port: u16,
    /// Name used for discovering nodes via mDNS.
    pub group_name: String,
    /// Max number of peers this node connects to.
    pub peer_limit: usize,
    /// Bootstrap peers to dial at startup.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Optional `/p2p/` multiaddr of a peer known to seed release binaries.
    #[serde(default)]
    pub update_seeder: Option<String>,
}

/// BFT engine config.
#[derive(Clone, Debug, Deserialize)]
pub struct BftConfig {
    /// Home directory of the external engine (genesis, engine config, keys).
    pub home_dir: String,
}

/// Logger config.
#[derive(Clone, Debug, Deserialize)]
pub struct LogConfig {
    /// Level filter: trace, debug, info, warn, error.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    #[serde(default)]
    pub json: bool,
    /// Optional log file; stdout when absent.
    #[serde(default)]
    pub file: Option<String>,
}

/// Parse the YAML configuration file.
pub fn load(path: &Path) -> Result<NodeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::Read)?;
    serde_yaml::from_str(&raw).map_err(|_| ConfigError::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
node:
  name: openmesh-node
  data_dir: ./data
http:
  listen_addr: 0.0.0.0:9090
p2p:
  addr: 0.0.0.0
  port: 4001
  group_name: openmesh
  peer_limit: 32
  bootstrap:
    - /ip4/127.0.0.1/tcp/4002/p2p/12D3KooWPYkNZrwQo5yESaXbBQ64f3GyFaUPFynPUoE7PfJ4xL4u
bft:
  home_dir: ./bft-home
log:
  level: info
"#;

    #[test]
    fn sample_config_parses() {
        let cfg: NodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.node.name, "openmesh-node");
        assert_eq!(cfg.p2p.port, 4001);
        assert_eq!(cfg.p2p.peer_limit, 32);
        assert_eq!(cfg.p2p.bootstrap.len(), 1);
        assert_eq!(cfg.p2p.update_seeder, None);
        assert!(!cfg.log.json);
        assert_eq!(cfg.log.file, None);
    }

    #[test]
    fn missing_sections_fail_to_parse() {
        assert!(serde_yaml::from_str::<NodeConfig>("node:\n  name: x\n").is_err());
    }
}
