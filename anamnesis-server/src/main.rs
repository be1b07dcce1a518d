use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use anamnesis_core::AnamnesisConfig;
use anamnesis_server::http::HttpState;
use anamnesis_server::{app, http};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "anamnesis.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = match AnamnesisConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if args.health {
        if config.database.backend == "postgres" {
            let pool = match anamnesis_core::db::create_pool(&config.database).await {
                Ok(p) => p,
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            };
            match anamnesis_core::db::health_check(&pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL health check failed: {}", e);
                    std::process::exit(1);
                }
            }
        } else {
            println!("✅ backend '{}' needs no health check", config.database.backend);
        }
        println!("✅ Anamnesis health check passed");
        return Ok(());
    }

    let app = match app::build(&config).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(backend = app.backend, "Anamnesis pipeline ready");

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    if config.http.enabled {
        let state = Arc::new(HttpState {
            service: app.service.clone(),
            backend: app.backend,
            pool: app.pool.clone(),
        });
        http::start_http_server(state, &config.http.host, config.http.port, tx.subscribe())
            .await?;
    } else {
        tracing::warn!("http.enabled is false; nothing to serve, waiting for shutdown");
        let _ = tx.subscribe().recv().await;
    }

    tracing::info!("Anamnesis server stopped");
    Ok(())
}
