use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lead_engine::config::Config;
use lead_engine::content::{ContentIntelligence, TemplateContent};
use lead_engine::db::Database;
use lead_engine::db_storage::PgLeadStore;
use lead_engine::engine::{Collaborators, LeadEngine};
use lead_engine::handlers::{self, AppState};
use lead_engine::outbound::{HttpOutboundSender, LoggingSender, OutboundSender};
use lead_engine::services::{CompanyIntel, HttpCompanyIntel, HttpContentIntelligence};
use lead_engine::store::{LeadStore, MemoryLeadStore};
use lead_engine::webhook_handler::{self, EventDeduper};

/// Builds the external collaborators, falling back to the template writer and
/// the dry-run sender when a service is not configured.
fn build_collaborators(config: &Config) -> anyhow::Result<Collaborators> {
    let intel: Option<Arc<dyn CompanyIntel>> = match config.company_intel_url {
        Some(ref url) => {
            let client = HttpCompanyIntel::new(
                url.clone(),
                config.company_intel_key.clone(),
                config.engine.enrichment_timeout,
            )?;
            tracing::info!("✓ Company intel client initialized: {}", url);
            Some(Arc::new(client))
        }
        None => {
            tracing::warn!("COMPANY_INTEL_URL not set, scoring uses rules only");
            None
        }
    };

    let content: Arc<dyn ContentIntelligence> = match config.content_api_url {
        Some(ref url) => {
            let client = HttpContentIntelligence::new(
                url.clone(),
                config.content_api_key.clone(),
                config.content_model.clone(),
                config.engine.content_timeout,
            )?;
            tracing::info!("✓ Content Intelligence client initialized: {}", url);
            Arc::new(client)
        }
        None => {
            tracing::warn!("CONTENT_API_URL not set, auto-responses use templates");
            Arc::new(TemplateContent)
        }
    };

    let sender: Arc<dyn OutboundSender> = match config.outbound_relay_url {
        Some(ref url) => {
            let client =
                HttpOutboundSender::new(url.clone(), config.outbound_relay_token.clone())?;
            tracing::info!("✓ Outbound relay client initialized: {}", url);
            Arc::new(client)
        }
        None => {
            tracing::warn!("OUTBOUND_RELAY_URL not set, responses are logged (dry run)");
            Arc::new(LoggingSender)
        }
    };

    Ok(Collaborators {
        intel,
        content,
        sender,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_engine=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Lead store: PostgreSQL when configured, memory otherwise
    let store: Arc<dyn LeadStore> = match config.database_url {
        Some(ref url) => {
            let db = Database::new(url).await?;
            tracing::info!("Database connection established");
            Arc::new(PgLeadStore::new(db.pool))
        }
        None => Arc::new(MemoryLeadStore::new()),
    };

    let collaborators = build_collaborators(&config)?;
    let engine = LeadEngine::new(store, config.engine.clone(), collaborators);
    tracing::info!("Lead engine initialized");

    // Build application state
    let app_state = Arc::new(AppState {
        engine,
        config: config.clone(),
        webhook_events: EventDeduper::new(Duration::from_secs(600)),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = Router::new()
        // Intake
        .route("/api/v1/intake/:channel", post(handlers::intake))
        .route(
            "/api/v1/webhooks/:channel",
            post(webhook_handler::channel_webhook),
        )
        // Read API
        .route("/api/v1/leads", get(handlers::list_leads))
        .route("/api/v1/leads/:id", get(handlers::get_lead))
        .route("/api/v1/metrics", get(handlers::get_metrics))
        // Commands
        .route("/api/v1/leads/:id/rescore", post(handlers::rescore_lead))
        .route("/api/v1/leads/:id/claim", post(handlers::claim_lead))
        .route("/api/v1/leads/:id/qualify", post(handlers::qualify_lead))
        .route(
            "/api/v1/leads/:id/disqualify",
            post(handlers::disqualify_lead),
        )
        .route("/api/v1/leads/:id/convert", post(handlers::convert_lead))
        .route("/api/v1/leads/:id/respond", post(handlers::respond_to_lead))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Build final app with health check (bypasses rate limiting)
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
