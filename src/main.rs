use std::sync::Arc;

use analysis_dispatcher::config::{DispatcherConfig, EmailConfig};
use analysis_dispatcher::dispatcher::JobDispatcher;
use analysis_dispatcher::notify::SmtpEmailSender;
use analysis_dispatcher::routes::dispatcher_routes;
use analysis_dispatcher::store::FileJobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // lettre's rustls transport needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env();
    let email_config = EmailConfig::from_env()?;

    eprintln!("Analysis dispatcher v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Store: {}", config.store_root.display());
    eprintln!(
        "   SMTP: {}:{} (from {})",
        email_config.smtp_host, email_config.smtp_port, email_config.from_address
    );

    let store = Arc::new(FileJobStore::open(&config.store_root).await?);
    let sender = Arc::new(SmtpEmailSender::new(email_config, config.email_timeout));
    let dispatcher = Arc::new(JobDispatcher::new(store, sender, &config));

    let app = dispatcher_routes(dispatcher);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Dispatcher listening");
    axum::serve(listener, app).await?;

    Ok(())
}
