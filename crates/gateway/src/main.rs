use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use aoc_gateway::cli::{Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = aoc_gateway::cli::load_config()?;
            match run_server(Arc::new(config)).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    tracing::error!(error = %e, "agentcore exited with error");
                    let code = if e.downcast_ref::<ConfigInvalid>().is_some() { 2 } else { 3 };
                    std::process::exit(code);
                }
            }
        }
        Some(Command::Doctor) => {
            let (config, config_path) = aoc_gateway::cli::load_config()?;
            let passed = aoc_gateway::cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = aoc_gateway::cli::load_config()?;
            let valid = aoc_gateway::cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(2);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = aoc_gateway::cli::load_config()?;
            aoc_gateway::cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentcore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Marker error so `main` can map a config-validation failure in
/// `run_server` to exit code 2 (the CLI/Env contract) rather than the
/// generic storage-unavailable code 3.
#[derive(Debug)]
struct ConfigInvalid;

impl std::fmt::Display for ConfigInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config invalid")
    }
}
impl std::error::Error for ConfigInvalid {}

/// Initialize structured JSON tracing.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aoc_gateway=debug")))
        .json()
        .init();
}

/// Start the gateway server with the given configuration.
async fn run_server(config: Arc<aoc_domain::config::Config>) -> anyhow::Result<()> {
    tracing::info!("agentcore starting");

    let issues = config.validate();
    if issues.iter().any(|i| i.severity == aoc_domain::config::ConfigSeverity::Error) {
        for issue in &issues {
            tracing::error!("config: {issue}");
        }
        return Err(anyhow::Error::new(ConfigInvalid));
    }

    let state = aoc_gateway::bootstrap::build_app_state(config.clone())
        .await
        .context("building application state")?;
    aoc_gateway::bootstrap::spawn_background_tasks(&state);

    let cors_layer = build_cors_layer(&config.server.cors);

    let max_concurrent = std::env::var("AOC_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    let governor_layer = config.server.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second)
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");

        tracing::info!(
            requests_per_second = rl.requests_per_second,
            burst_size = rl.burst_size,
            "per-IP rate limiting enabled"
        );

        GovernorLayer { config: Arc::new(gov_config) }
    });
    if governor_layer.is_none() {
        tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
    }

    let router = aoc_gateway::api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = match governor_layer {
        Some(gov) => router.layer(gov).with_state(state),
        None => router.with_state(state),
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "agentcore listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may carry a trailing `:*` wildcard for the port segment (e.g.
/// `http://localhost:*`), expanded into a predicate matching any port on
/// that host. A literal `"*"` allows all origins (not recommended for
/// production).
fn build_cors_layer(cors: &aoc_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if let Some(prefix) = origin.strip_suffix('*') {
            wildcard_prefixes.push(prefix.to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
