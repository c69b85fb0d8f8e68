//! On-disk process configuration: listen address, worker topology, and
//! where to find the route script.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen: SocketAddr,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Path to a route script file, read once at startup and shared as its
    /// text contents across every worker thread.
    pub route_script: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    IoUring,
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub cpu_affinity: bool,
    #[serde(default = "default_entries")]
    pub entries: u32,
    #[serde(default)]
    pub runtime_type: Option<RuntimeType>,
}

fn default_workers() -> usize {
    1
}

fn default_entries() -> u32 {
    1024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { workers: default_workers(), cpu_affinity: false, entries: default_entries(), runtime_type: None }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = monoroute_core::util::file_read(path).await?;
        Self::from_slice(&content)
    }

    /// Accepts either JSON or TOML, sniffed from the first non-whitespace
    /// byte.
    pub fn from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
        let is_json = match content.iter().find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t') {
            Some(first) => *first == b'{',
            None => false,
        };
        if is_json {
            serde_json::from_slice::<T>(content).map_err(Into::into)
        } else {
            toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into)
        }
    }
}
