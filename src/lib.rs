#[cfg(feature = "api")]
pub mod api;

pub mod config;
pub mod observer;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, observer::Observer, statistics::Statistics};

use service::{Service, ServiceOptions, log::MemoryLog};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "courier-rs.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests use the courier-server crate and
/// start the broker directly, a function is opened to replace the main
/// function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();
    let service = Service::new(ServiceOptions {
        handler: Observer::new(config.clone(), statistics.clone()),
        log: Arc::new(MemoryLog::new()),
        limits: config.limits(),
        ice_servers: config.ice_servers.clone(),
    });

    #[cfg(feature = "api")]
    {
        api::start_server(config, service, statistics).await?;
    }

    // The broker is non-blocking after it starts and has to be kept from
    // exiting immediately if the api server is not enabled.
    #[cfg(not(feature = "api"))]
    {
        let _ = (service, statistics);
        std::future::pending::<()>().await;
    }

    Ok(())
}
