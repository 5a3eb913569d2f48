use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portico::{
    adapters::{ConsulRegistry, GatewayHandler, HttpClientAdapter, OAuthTokenChecker},
    config::models::GatewayConfig,
    core::{
        BalanceFactory, BreakerRegistry, InstanceCache,
        auth::{AuthFilter, PermitMatcher},
        load_balancer::Balance,
    },
    ports::{http_client::HttpClient, registry::ServiceRegistration, registry::ServiceRegistry},
    tracing_setup,
    utils::ShutdownCoordinator,
};
use uuid::Uuid;

/// Bound on cleanup work once shutdown starts.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    if command == "validate" {
        return validate_config_command(&config_path).await;
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("loading configuration from {config_path}");
    let config: GatewayConfig = portico::config::load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    config.validate().map_err(|e| eyre!(e))?;
    let config = Arc::new(config);

    let shutdown = Arc::new(ShutdownCoordinator::new(SHUTDOWN_DEADLINE));

    let registry: Arc<dyn ServiceRegistry> = Arc::new(
        ConsulRegistry::new(
            &config.registry.address,
            Duration::from_secs(config.registry.watch_wait_secs),
        )
        .context("Failed to create registry client")?,
    );
    let cache = Arc::new(InstanceCache::new(registry.clone(), shutdown.token()));
    let balance: Arc<dyn Balance> = Arc::from(BalanceFactory::create_strategy(&config.load_balance));
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let token_checker = Arc::new(OAuthTokenChecker::new(
        cache.clone(),
        balance.clone(),
        http_client.clone(),
        config.auth.token_service.clone(),
        config.auth.check_token_path.clone(),
    ));
    let auth = Arc::new(AuthFilter::new(
        PermitMatcher::new(&config.auth.public_paths)
            .context("Failed to compile public path patterns")?,
        token_checker,
    ));
    let breakers = Arc::new(BreakerRegistry::new((&config.breaker).into()));

    let handler = Arc::new(GatewayHandler::new(
        cache,
        balance,
        breakers,
        auth,
        http_client,
        config.health_path.clone(),
        config.fallback_message.clone(),
    ));

    // Register with the external registry before accepting traffic; a
    // process that cannot register must not serve.
    let instance_id = config
        .service
        .instance_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", config.service.name, Uuid::new_v4()));
    let registration = ServiceRegistration {
        instance_id: instance_id.clone(),
        service_name: config.service.name.clone(),
        host: config.service.host.clone(),
        port: config.service.port,
        health_check_path: config.service.health_check_path.clone(),
        weight: config.service.weight,
        metadata: config.service.metadata.clone(),
        tags: config.service.tags.clone(),
        check_interval: config.service.check_interval.clone(),
        deregister_after: config.service.deregister_after.clone(),
    };
    registry
        .register(&registration)
        .await
        .with_context(|| format!("Failed to register service '{}'", config.service.name))?;

    let signal_coordinator = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = signal_coordinator.run_signal_handler().await {
            tracing::error!(error = %err, "signal handler failed");
        }
    });

    let app = Router::new()
        .fallback(dispatch)
        .with_state(handler);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(listen_addr = %config.listen_addr, "gateway listening");

    let serve_token = shutdown.token();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(serve_token.cancelled_owned())
    .await
    .context("Server error")?;

    // Best-effort deregistration, bounded so a dead registry cannot hang
    // the exit.
    shutdown
        .bounded_cleanup(async {
            if let Err(err) = registry.deregister(&instance_id).await {
                tracing::warn!(%instance_id, error = %err, "deregistration failed");
            }
        })
        .await;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn dispatch(
    State(handler): State<Arc<GatewayHandler>>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    handler.handle_request(req, Some(client_addr)).await
}

async fn validate_config_command(config_path: &str) -> Result<()> {
    let config: GatewayConfig = portico::config::load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    config.validate().map_err(|e| eyre!(e))?;
    println!("Configuration {config_path} is valid");
    Ok(())
}
