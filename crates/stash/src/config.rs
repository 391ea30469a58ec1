//! Application configuration, usually read from a TOML file.
//!
//! ```toml
//! key_codec = "simple"
//!
//! [backend]
//! kind = "json"
//! path = "state.json"
//! sync_interval_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stash_encoding::{Coder, KeyCodec, ValueCodec};
use stash_etcd::NodeConfig;

use crate::error::{StashError, StashResult};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StashConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    /// `binary` or `simple`. Defaults per backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_codec: Option<String>,
    /// `json` or `cbor`. Defaults per backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codec: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Memory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_capacity: Option<usize>,
    },
    Json {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sync_interval_ms: Option<u64>,
    },
    Etcd {
        #[serde(default)]
        endpoints: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node: Option<NodeSettings>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Memory {
            event_capacity: None,
        }
    }
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory { .. } => "memory",
            Self::Json { .. } => "json",
            Self::Etcd { .. } => "etcd",
        }
    }

    fn default_codecs(&self) -> (KeyCodec, ValueCodec) {
        match self {
            Self::Memory { .. } => (KeyCodec::binary(), ValueCodec::Cbor),
            Self::Json { .. } | Self::Etcd { .. } => (KeyCodec::simple(), ValueCodec::Json),
        }
    }
}

/// A local etcd member to start before connecting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub load_balancer: String,
    pub cluster_token: String,
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_port: Option<u16>,
}

impl NodeSettings {
    pub fn to_node_config(&self) -> NodeConfig {
        let mut node = NodeConfig::new(&self.load_balancer, &self.cluster_token, &self.data_dir);
        if let Some(binary) = &self.binary {
            node.binary = binary.clone();
        }
        if let Some(ms) = self.startup_timeout_ms {
            node.startup_timeout = Duration::from_millis(ms);
        }
        if let Some(port) = self.client_port {
            node.client_port = port;
        }
        if let Some(port) = self.peer_port {
            node.peer_port = port;
        }
        node
    }
}

impl StashConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendConfig::Json {
                path: path.into(),
                sync_interval_ms: None,
            },
            ..Self::default()
        }
    }

    pub fn etcd<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backend: BackendConfig::Etcd {
                endpoints: endpoints.into_iter().map(Into::into).collect(),
                request_timeout_ms: None,
                node: None,
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> StashResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> StashResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// The coder for this configuration: backend defaults, then overrides.
    pub fn coder(&self) -> StashResult<Coder> {
        let (mut keys, mut values) = self.backend.default_codecs();
        if let Some(name) = &self.key_codec {
            keys = KeyCodec::from_str(name)?;
        }
        if let Some(name) = &self.value_codec {
            values = ValueCodec::from_str(name)?;
        }
        if matches!(self.backend, BackendConfig::Json { .. }) && values != ValueCodec::Json {
            return Err(StashError::Config(format!(
                "the json backend stores JSON values, not {}",
                values.name()
            )));
        }
        Ok(Coder::new(keys, values))
    }
}
