use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tracing::info;

use salesnote_ai::{LlmClient, OpenAiClient};
use salesnote_core::config::AppConfig;
use salesnote_db::{connect, migrations, DbPool};
use salesnote_gateway::outbound::HttpOutbound;
use salesnote_gateway::{ChatTransport, GatewayRunner, NoopTransport, WsTransport};
use salesnote_orchestrator::{OutputWorker, TurnOrchestrator};

use crate::chat::{ChatService, NoopDirectory};
use crate::records_api::ApiState;
use crate::{health, oauth, records_api};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub output_worker: OutputWorker,
    pub gateway_runner: Arc<GatewayRunner>,
    pub router: Router,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!("starting application bootstrap");

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!("database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!("database migrations applied");

    let llm: Arc<dyn LlmClient> =
        Arc::new(OpenAiClient::new(config.llm.clone(), config.prompts.clone()));

    let output_worker = OutputWorker::start(db_pool.clone(), llm.clone(), &config.worker);

    let orchestrator =
        Arc::new(TurnOrchestrator::new(llm.clone(), config.messages.clone()));

    let send_endpoint = format!(
        "{}/open-apis/im/v1/messages?receive_id_type=chat_id",
        config.oauth.base_url.trim_end_matches('/')
    );
    let outbound = Arc::new(HttpOutbound::new(&config.gateway, send_endpoint));

    let chat_service = Arc::new(ChatService::new(
        db_pool.clone(),
        orchestrator,
        output_worker.queue(),
        outbound.clone(),
        Arc::new(NoopDirectory),
        config.messages.clone(),
    ));

    let transport: Arc<dyn ChatTransport> = if config.gateway.ws_url.is_empty() {
        info!("gateway ws_url not configured, chat intake disabled");
        Arc::new(NoopTransport)
    } else {
        Arc::new(WsTransport::new(config.gateway.ws_url.clone()))
    };
    let gateway_runner = Arc::new(GatewayRunner::new(
        transport,
        chat_service,
        outbound,
        config.messages.clone(),
    ));

    let api_state = ApiState { db_pool: db_pool.clone(), server: config.server.clone() };
    let oauth_state = oauth::OauthState {
        api: api_state.clone(),
        http: reqwest::Client::new(),
        base_url: config.oauth.base_url.clone(),
        app_id: config.gateway.app_id.clone(),
        app_secret: config.gateway.app_secret.clone(),
    };
    let router = health::router(db_pool.clone())
        .merge(records_api::router(api_state))
        .merge(oauth::router(oauth_state));

    Ok(Application { config, db_pool, output_worker, gateway_runner, router })
}
