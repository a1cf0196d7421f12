/// guestgate - captive-portal authorization service for short-term-rental
/// networks
use guestgate::config::ServerConfig;
use guestgate::context::AppContext;
use guestgate::error::PortalResult;
use guestgate::jobs::JobScheduler;
use guestgate::server;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> PortalResult<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guestgate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    // Load configuration
    let config = ServerConfig::from_env()?;

    // Create application context
    let ctx = Arc::new(AppContext::new(config).await?);

    // Seed the first admin account when configured
    ctx.bootstrap().await?;

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx)));
    Arc::clone(&scheduler).start();

    // Serve until interrupted, then stop the background loops. The retry
    // queue is durable, so in-flight controller operations survive the
    // restart.
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let result = server::serve((*ctx).clone(), shutdown).await;

    scheduler.shutdown();
    result
}

fn print_banner() {
    println!(
        r#"
                      _              _
   __ _ _  _ ___  ___| |_ __ _  __ _| |_ ___
  / _` | || / -_)(_-<|  _/ _` |/ _` |  _/ -_)
  \__, |\_,_\___|/__/ \__\__, |\__,_|\__\___|
  |___/                  |___/

        Guest network authorization portal v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
