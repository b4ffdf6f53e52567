use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use bn_coordinator::bootstrap::{build_app_state, spawn_background_tasks};
use bn_coordinator::cli::{self, Cli, Command, ConfigCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            let valid = cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("bnode {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_server(config: Arc<bn_domain::config::Config>) -> anyhow::Result<()> {
    let state_dir = std::path::PathBuf::from(
        std::env::var("BN_STATE_DIR").unwrap_or_else(|_| "./state".into()),
    );

    let state = build_app_state(config.clone(), state_dir)
        .await
        .context("building coordinator state")?;
    spawn_background_tasks(&state);

    let cors = build_cors_layer(&config.server.cors.allowed_origins);
    let app = bn_coordinator::api::router(state.clone())
        .with_state(state)
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing server.host/server.port into a socket address")?;

    tracing::info!(%addr, "bnode coordinator listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server loop exited")?;

    Ok(())
}

/// Env-filter controlled, JSON output suitable for ingestion by a log
/// pipeline.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .init();
}

/// Build the CORS layer from the configured allow-list. `"*"` in the list
/// means "allow any origin"; anything else is parsed as a literal origin.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();

    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(origins)
}
