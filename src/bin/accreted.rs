use std::sync::Arc;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use accrete::{GraphStore, PostgresGraphStore, bootstrap_with_store, create_api_router};

#[derive(CommandLine, Default, PartialEq, Eq)]
struct Args {
    #[arrrg(optional, "Path to the bootstrap document")]
    config: Option<String>,
    #[arrrg(optional, "PostgreSQL URL for durable graph storage")]
    database: Option<String>,
    #[arrrg(optional, "Host to bind the HTTP server")]
    host: Option<String>,
    #[arrrg(optional, "Port to bind the HTTP server")]
    port: Option<u16>,
    #[arrrg(flag, "Enable verbose logging")]
    verbose: bool,
}

const HELP_TEXT: &str = r#"accreted - accrete daemon

USAGE:
    accreted [OPTIONS]

OPTIONS:
    --config <PATH>      Path to the bootstrap document [default: accrete.yaml]
    --database <URL>     PostgreSQL URL for durable graph storage
    --host <HOST>        Host to bind the HTTP server [default: 127.0.0.1]
    --port <PORT>        Port to bind the HTTP server [default: 8080]
    --verbose            Enable verbose logging

DESCRIPTION:
    Loads the bootstrap document, starts the periodic update engine, and
    serves the management API under /api/v1/

    The server supports graceful shutdown via Ctrl+C.

API ENDPOINTS:
    Entity Management:
      POST   /api/v1/entity          Register a new entity
      GET    /api/v1/entity          List registered entity ids
      GET    /api/v1/entity/{id}     Inspect an entity and its iQueries
      DELETE /api/v1/entity/{id}     Unregister an entity

    Patterns and Status:
      GET    /api/v1/pattern         List registered pattern names
      GET    /api/v1/status          Engine counters"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (args, free) = Args::from_command_line("USAGE: accreted [OPTIONS]");

    if !free.is_empty() && free[0] == "help" {
        println!("{}", HELP_TEXT);
        return Ok(());
    }

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config_path = args.config.unwrap_or_else(|| "accrete.yaml".to_string());
    let document = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read {}: {}", config_path, e))?;

    let store: Option<Arc<dyn GraphStore>> = match &args.database {
        Some(url) => Some(Arc::new(PostgresGraphStore::connect(url).await?)),
        None => None,
    };

    let mut bootstrap = bootstrap_with_store(&document, store).await?;
    let engine = Arc::clone(&bootstrap.engine);

    // Without an attached operator interface, pending prompts are logged and
    // the asking iQuery falls back to its next handler.
    for (name, mut inbox) in bootstrap.operator_inboxes.drain(..) {
        tokio::spawn(async move {
            while let Some(prompt) = inbox.recv().await {
                warn!(
                    handler = %name,
                    entity = %prompt.entity_id,
                    "operator prompt pending with no interface attached: {}",
                    prompt.prompt,
                );
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    let app = Router::new().nest("/api/v1", create_api_router(Arc::clone(&engine)));

    let host = args.host.unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args.port.unwrap_or(8080);
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    println!("🚀 accreted started successfully!");
    println!("📡 Server listening on: http://{}", addr);
    println!("📜 Bootstrap document: {}", config_path);
    println!("🧠 Entities registered: {}", engine.len());
    println!("💡 Use Ctrl+C for graceful shutdown");
    println!();

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                eprintln!("❌ Server error: {}", e);
                std::process::exit(1);
            }
        }
        () = shutdown_signal => {
            println!();
            println!("🛑 Shutdown signal received, stopping gracefully...");
            let _ = shutdown_tx.send(true);
            let _ = runner.await;
            println!("👋 accreted stopped after {} cycles", engine.cycles_completed());
        }
    }

    Ok(())
}
