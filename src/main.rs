//! IBKR Proxy Server
//!
//! Keeps one session open to Interactive Brokers TWS/Gateway and exposes
//! it to browser clients over REST.

use std::sync::{Arc, Mutex};

use clap::Parser;
use ibkr_proxy::gateway::TwsConnector;
use ibkr_proxy::{build_state, web, Args, ProxyConfig};

fn print_banner() {
    println!("========================================");
    println!("   IBKR Proxy Server");
    println!("   Interactive Brokers REST bridge");
    println!("   Version {}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
}

fn print_endpoints(addr: &str) {
    println!();
    println!("API Endpoints:");
    println!("  Health Check:     GET  http://{addr}/health");
    println!("  Accounts:         GET  http://{addr}/accounts");
    println!("  Positions:        GET  http://{addr}/positions/{{account_id}}");
    println!("  Search:           GET  http://{addr}/search?symbol=AAPL");
    println!("  Load Data:        GET  http://{addr}/loadData?conId=265598&interval=1%20min&limit=100");
    println!("  Load More Data:   GET  http://{addr}/loadMoreData?conId=265598&interval=1%20min&endTime=1700000000&limit=100");
    println!("  Symbol Info:      GET  http://{addr}/getSymbolInfo?conId=265598");
    println!("  Dynamic Call:     GET  http://{addr}/dynamic/{{method}}?param=value");
    println!();
    println!("Press Ctrl+C to stop the server...");
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ProxyConfig::try_from(Args::parse())?;
    print_banner();

    let state = build_state(&config, Arc::new(TwsConnector));
    let session = Arc::clone(&state.session);

    println!("Connecting to IB TWS/Gateway at {}...", config.endpoint());
    match session.connect().await {
        Ok(()) => {
            println!("Successfully connected to IB!");
            let accounts = session.router().managed_accounts();
            if !accounts.is_empty() {
                println!("Managed accounts: {}", accounts.join(", "));
            }
        }
        Err(e) => {
            // Requests retry the connection on demand.
            tracing::error!(error = %e, "initial connection to IB gateway failed");
            eprintln!("Failed to connect to IB TWS/Gateway: {e}");
            eprintln!("Make sure TWS or IB Gateway is running and API connections are enabled.");
            eprintln!("The proxy will keep retrying when requests arrive.");
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let shutdown_tx = Mutex::new(Some(shutdown_tx));
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down gracefully...");
        let mut slot = shutdown_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = slot.take() {
            let _ = tx.send(());
        }
    })?;

    let app = web::create_router(state);
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    print_endpoints(&addr);
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await?;

    println!("Shutting down...");
    session.disconnect().await;
    println!("Shutdown complete. Goodbye!");
    Ok(())
}
