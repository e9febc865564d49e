#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use courier_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.auth.keys.is_empty() {
        log::warn!(
            "No developer keys are configured, every connect will be rejected, it's just a program without any tenants :-)"
        );
    }

    courier_server::startup(config).await
}
