use std::sync::Arc;

use anyhow::Context;
use role_gate::config::{OnboardingConfig, ServerConfig};
use role_gate::onboarding::{Onboarding, OnboardingRouteState, onboarding_routes, spawn_sweep_ticker};
use role_gate::platform::{HttpPlatform, Platform};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Configuration problems are fatal at startup.
    let config = OnboardingConfig::from_env().context("Invalid onboarding configuration")?;
    let server = ServerConfig::from_env().context("Invalid server configuration")?;

    eprintln!("🚪 Role Gate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Options: {}", config.catalog.len());
    eprintln!("   Marker group: {}", config.marker_group);
    eprintln!("   Sweep: every {}s", config.sweep_interval.as_secs());
    eprintln!("   Adapter: {}", server.platform_url);
    eprintln!("   Event API: http://0.0.0.0:{}/api", server.port);

    let platform: Arc<dyn Platform> = Arc::new(HttpPlatform::new(
        server.platform_url.clone(),
        server.platform_token.clone(),
    ));
    let onboarding = Arc::new(Onboarding::new(Arc::new(config), Arc::clone(&platform)));

    // ── Entry point ─────────────────────────────────────────────────────
    match onboarding.publish_entry_point().await {
        Ok(true) => {}
        Ok(false) => eprintln!("   Entry point: disabled (no onboarding channel)"),
        Err(e) => tracing::warn!(error = %e, "Failed to publish onboarding entry point"),
    }

    // ── Reconciliation sweep ────────────────────────────────────────────
    let (_sweep_handle, _sweep_shutdown) = spawn_sweep_ticker(Arc::clone(&onboarding));

    // ── Event API ───────────────────────────────────────────────────────
    let app = onboarding_routes(OnboardingRouteState { onboarding });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server.port))?;
    tracing::info!(port = server.port, platform = platform.name(), "Event API started");
    axum::serve(listener, app).await?;

    Ok(())
}
