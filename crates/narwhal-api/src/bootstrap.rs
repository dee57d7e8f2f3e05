//! Process startup: storage, broker and external tools.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use narwhal_broker::{StreamBroker, default_streams, ensure_streams};
use narwhal_core::clock::Clock;
use narwhal_core::error::DomainError;
use narwhal_store::PgDatabase;
use narwhal_transcode::verify_tool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::NarwhalConfig;
use crate::error::AppError;
use crate::routes;
use crate::state::{AppState, Persistence};

const MAX_DB_CONNECTIONS: u32 = 10;

/// Connects storage and the broker, checks the transcoding tools and wires
/// every service.
///
/// Without `DATABASE_URL` all state is process-local.
///
/// # Errors
///
/// Returns the database, migration or broker failure, or
/// `AppError::Domain` if ffmpeg or ffprobe cannot be executed.
pub async fn bootstrap(config: &NarwhalConfig, clock: Arc<dyn Clock>) -> Result<AppState, AppError> {
    let persistence = match &config.database_url {
        Some(url) => {
            let db = PgDatabase::connect(url, MAX_DB_CONNECTIONS).await?;
            db.migrate().await?;
            info!("database connected and migrated");
            Persistence::Postgres(db)
        }
        None => {
            warn!("DATABASE_URL not set, state will not survive a restart");
            Persistence::memory()
        }
    };

    let broker: Arc<dyn StreamBroker> = narwhal_broker::connect(&config.broker).await?;
    ensure_streams(broker.as_ref(), default_streams()).await?;
    info!(url = %config.broker.url, "broker streams ready");

    check_tool(&config.ffmpeg_path).await?;
    check_tool(&config.ffprobe_path).await?;

    Ok(AppState::new(config, &persistence, broker, clock))
}

async fn check_tool(path: &Path) -> Result<(), AppError> {
    let banner = verify_tool(path).await.map_err(DomainError::from)?;
    info!(tool = %path.display(), %banner, "transcoding tool available");
    Ok(())
}

/// The HTTP application with request tracing and permissive CORS.
pub fn app(state: AppState) -> Router {
    routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
