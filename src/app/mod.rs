use crate::config::Config;
use crate::context::IntegrationContext;
use crate::driver::Driver;
use crate::identifier;
use crate::store::FileConfigurationService;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Hosting entry point for a driver binary: loads configuration, serves the
/// integration API and stops on Ctrl-C.
pub async fn run(driver: Arc<dyn Driver>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    run_with_config(config, driver).await
}

pub async fn run_with_config(
    config: Config,
    driver: Arc<dyn Driver>,
) -> Result<(), Box<dyn std::error::Error>> {
    identifier::configure_prefixing(config.protocol.disable_entity_id_prefixing);
    if identifier::prefixing_disabled() {
        tracing::warn!("entity id prefixing disabled");
    }

    let store = FileConfigurationService::new(
        &config.storage.config_home,
        config.storage.driver_metadata_path.clone(),
    );
    tracing::info!(path = %store.configuration_path().display(), "using configuration store");

    let stop = CancellationToken::new();
    let context = Arc::new(IntegrationContext::new(
        driver,
        Arc::new(store),
        config.protocol.clone(),
        stop.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        res = crate::server::start(config.server.clone(), context, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            stop.cancel();
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    }
}
