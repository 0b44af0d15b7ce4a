//! Tokio host for mpchat-core: serialized inbox, timers, config, logging and the durable store.

pub mod config;
pub mod logging;
pub mod service;
pub mod sled_store;

use anyhow::Context;
use mpchat_core::{PeerIdentity, SessionCoordinator, Transport};
use tokio::task::JoinHandle;

pub use config::Config;
pub use service::{EventSink, ServiceError, ServiceHandle};
pub use sled_store::SledStore;

/// Install logging, open the durable store from `config` and spawn the service on the current runtime.
pub fn start<T>(
    config: &Config,
    local: PeerIdentity,
    transport: T,
) -> anyhow::Result<(ServiceHandle, EventSink, JoinHandle<()>)>
where
    T: Transport + Send + 'static,
{
    logging::init(&config.log_filter);
    let dir = config.data_dir();
    let store = SledStore::open(&dir)
        .with_context(|| format!("cannot start service with data dir {}", dir.display()))?;
    let coordinator = SessionCoordinator::with_settings(local, transport, store, config.settings());
    tracing::info!(service = %config.service_id, data_dir = %dir.display(), "starting chat service");
    Ok(service::spawn(coordinator))
}
