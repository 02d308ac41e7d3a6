//! pushgate-server binary: loads configuration, registers every
//! configured provider, and serves the admission/feedback/metrics HTTP
//! API until terminated.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use pushgate_config::AppConfig;
use pushgate_core::logging::init_logging;
use pushgate_server::adapter::Adapter;
use pushgate_server::adapters::apns::ApnsAdapter;
use pushgate_server::adapters::email::{EmailAdapter, EmailAdapterConfig};
use pushgate_server::adapters::fcm::FcmAdapter;
use pushgate_server::adapters::telegram::TelegramAdapter;
use pushgate_server::adapters::webhook::WebhookAdapter;
use pushgate_server::adapters::webpush::WebPushAdapter;
use pushgate_server::api::{router, AppState};
use pushgate_server::feedback::FeedbackBuffer;
use pushgate_server::registry::Registry;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("pushgate-server");

    let config = AppConfig::load().context("loading configuration")?;
    info!(addr = %config.api_addr, "starting pushgate-server");

    let registry = Arc::new(Registry::new(config.queue_redis_url.clone(), config.queue_key_prefix.clone()));
    let feedback = Arc::new(FeedbackBuffer::new());
    let metrics_handle = pushgate_server::metrics::install();
    let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();

    if let Some(apns) = &config.apns {
        if let Some(path) = &apns.certificate_path {
            let pem = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            let adapter: Arc<dyn Adapter> = Arc::new(ApnsAdapter::production(pem));
            register(&registry, &mut adapters, adapter, apns.workers, None, feedback.clone()).await?;
        }
        if let Some(path) = &apns.sandbox_certificate_path {
            let pem = std::fs::read(path).with_context(|| format!("reading {path}"))?;
            let adapter: Arc<dyn Adapter> = Arc::new(ApnsAdapter::sandbox(pem));
            register(&registry, &mut adapters, adapter, apns.workers, None, feedback.clone()).await?;
        }
    }

    if let Some(fcm) = &config.fcm {
        let adapter: Arc<dyn Adapter> = Arc::new(FcmAdapter::new(&fcm.credentials_file)?);
        register(&registry, &mut adapters, adapter, fcm.workers, None, feedback.clone()).await?;
    }

    if let Some(wp) = &config.webpush {
        let adapter: Arc<dyn Adapter> = Arc::new(WebPushAdapter::new(
            wp.vapid_public_key.clone(),
            wp.vapid_private_key.clone(),
        ));
        register(&registry, &mut adapters, adapter, wp.workers, None, feedback.clone()).await?;
    }

    if let Some(tg) = &config.telegram {
        let adapter: Arc<dyn Adapter> = Arc::new(TelegramAdapter::new(tg.bot_token.clone()));
        register(&registry, &mut adapters, adapter, tg.workers, tg.squash, feedback.clone()).await?;
    }

    if let Some(wh) = &config.webhook {
        if wh.workers > 0 {
            let adapter: Arc<dyn Adapter> = Arc::new(WebhookAdapter);
            register(&registry, &mut adapters, adapter, wh.workers, None, feedback.clone()).await?;
        }
    }

    if let Some(email) = &config.email {
        let adapter: Arc<dyn Adapter> = Arc::new(EmailAdapter::new(EmailAdapterConfig {
            host: email.host.clone(),
            port: email.port,
            username: email.username.clone(),
            password: email.password.clone(),
            tls: email.tls,
            tls_insecure: email.tls_insecure,
            plain_auth: email.plain_auth,
        }));
        register(&registry, &mut adapters, adapter, 1, email.squash, feedback.clone()).await?;
    }

    if adapters.is_empty() {
        error!("no providers configured; set at least one provider's credentials");
    }

    let state = Arc::new(AppState {
        registry: registry.clone(),
        adapters,
        feedback,
        metrics_handle,
    });
    let app = router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(config.api_addr).await?;
    info!(addr = %config.api_addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down services");
    registry.shutdown_all().await;

    Ok(())
}

async fn register(
    registry: &Arc<Registry>,
    adapters: &mut HashMap<String, Arc<dyn Adapter>>,
    adapter: Arc<dyn Adapter>,
    workers: usize,
    squash: Option<pushgate_config::SquashConfig>,
    feedback: Arc<FeedbackBuffer>,
) -> Result<()> {
    let id = adapter.id().to_string();
    registry
        .add_service(adapter.clone(), workers, squash, feedback)
        .await
        .with_context(|| format!("registering service {id}"))?;
    adapters.insert(id, adapter);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
