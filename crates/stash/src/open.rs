use std::sync::Arc;
use std::time::Duration;

use stash_core::{default_logger, Connection, Logger};
use stash_etcd::EtcdConfig;
use stash_jsondb::JsonDbConfig;
use stash_memory::MemoryConfig;

use crate::config::{BackendConfig, StashConfig};
use crate::error::StashResult;

/// Build a [`Connection`] for `config`, logging through `tracing`.
pub async fn open(config: &StashConfig) -> StashResult<Connection> {
    open_with_logger(config, default_logger()).await
}

pub async fn open_with_logger(config: &StashConfig, logger: Arc<dyn Logger>) -> StashResult<Connection> {
    let coder = config.coder()?;
    logger.debug(format_args!(
        "opening {} store ({:?})",
        config.backend.name(),
        coder
    ));
    let conn = match &config.backend {
        BackendConfig::Memory { event_capacity } => {
            let mut memory = MemoryConfig::new().coder(coder).logger(logger);
            if let Some(capacity) = event_capacity {
                memory = memory.event_capacity(*capacity);
            }
            memory.connect()?
        }
        BackendConfig::Json {
            path,
            sync_interval_ms,
        } => {
            let mut json = JsonDbConfig::new().file(path).coder(coder).logger(logger);
            if let Some(ms) = sync_interval_ms {
                json = json.sync_interval(Duration::from_millis(*ms));
            }
            json.connect()?
        }
        BackendConfig::Etcd {
            endpoints,
            request_timeout_ms,
            node,
        } => {
            let mut etcd = EtcdConfig::new()
                .endpoints(endpoints.iter().cloned())
                .coder(coder)
                .logger(logger);
            if let Some(ms) = request_timeout_ms {
                etcd = etcd.request_timeout(Duration::from_millis(*ms));
            }
            if let Some(node) = node {
                etcd = etcd.node(node.to_node_config());
            }
            etcd.connect().await?
        }
    };
    Ok(conn)
}
