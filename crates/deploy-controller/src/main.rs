//! Deploy Controller
//!
//! REST API plus the registry watcher and the deployment sync loops

use anyhow::{Context, Result};
use deploy_controller::build_trigger::{BuildTrigger, ForgeClient};
use deploy_controller::cluster::{ClusterApi, KubeClient};
use deploy_controller::mock::{MockBuilds, MockCluster, MockRegistry};
use deploy_controller::registry_client::{HttpRegistry, RegistryApi};
use deploy_controller::{
    create_router, sync, tracker, AppState, Backends, Config, Controller, ControllerSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Deploy Controller");

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  API address: {}", config.api_address());
    info!("  Registry URL: {}", config.registry_url);
    info!("  Forge URL: {}", config.forge_url);
    info!("  Namespace: {}", config.namespace);
    info!("  Mock mode: {}", config.mock_mode);

    let backends = if config.mock_mode {
        mock_backends()
    } else {
        http_backends(&config)?
    };

    let controller = Arc::new(Controller::new(ControllerSettings::from(&config), backends));

    let app = create_router(AppState {
        controller: Arc::clone(&controller),
    });

    let api_addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .context("Failed to bind to address")?;
    info!("API server listening on {}", api_addr);

    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {:#}", e);
        }
    });

    let watch_task = tokio::spawn(tracker::watch(
        Arc::clone(&controller),
        Duration::from_secs(config.registry_poll_interval_secs),
    ));

    let sync_task = tokio::spawn(sync::run(
        Arc::clone(&controller),
        Duration::from_secs(config.sync_interval_secs),
    ));

    info!("Deploy Controller is running");

    // Wait for any task to complete (they should run forever)
    tokio::select! {
        _ = api_task => {
            error!("API task terminated unexpectedly");
        }
        _ = watch_task => {
            error!("Registry watcher terminated unexpectedly");
        }
        _ = sync_task => {
            error!("Deployment sync terminated unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down Deploy Controller");

    Ok(())
}

fn mock_backends() -> Backends {
    info!("Using in-memory registry, cluster and build service");

    Backends {
        registry: Arc::new(MockRegistry::new()),
        cluster: Some(Arc::new(MockCluster::new())),
        builds: Arc::new(MockBuilds::new()),
    }
}

fn http_backends(config: &Config) -> Result<Backends> {
    let client = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()
        .context("Failed to build HTTP client")?;

    let registry: Arc<dyn RegistryApi> =
        Arc::new(HttpRegistry::new(config.registry_api_base(), client.clone()));
    let builds: Arc<dyn BuildTrigger> = Arc::new(ForgeClient::new(config.forge_url.clone(), client));

    // Without a cluster client the API keeps serving read-only endpoints
    let cluster: Option<Arc<dyn ClusterApi>> = match KubeClient::in_cluster(config.http_timeout())
    {
        Ok(kube) => Some(Arc::new(kube)),
        Err(e) => {
            warn!("Running outside cluster: {:#}", e);
            None
        }
    };

    Ok(Backends {
        registry,
        cluster,
        builds,
    })
}
