pub mod background;
pub mod chat;
pub mod handlers;
pub mod request_adapter;
pub mod storage_traits;
pub mod streaming;
pub(crate) mod util;

use std::sync::Arc;

use axum::Router;

use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::logging::{DatabaseLogger, LedgerWriter};
use crate::providers::{HttpProviderClient, ProviderClient};
use crate::routing::{CredentialPool, ModelResolver};
use crate::server::chat::ChatService;
use crate::usage::TokenAccountant;

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// 以同一个 SQLite 存储组装各组件，上游客户端可替换
    pub fn new(config: Settings, store: Arc<DatabaseLogger>, client: Arc<dyn ProviderClient>) -> Self {
        let ttl = config.api.model_cache_ttl();
        let resolver = Arc::new(ModelResolver::new(store.clone(), ttl));
        let pool = Arc::new(CredentialPool::new(store.clone(), ttl));
        let ledger = LedgerWriter::new(store, config.logging.key_log_strategy);
        let chat = ChatService::new(
            &config,
            resolver,
            pool,
            client,
            Arc::new(TokenAccountant::new()),
            ledger,
        );
        Self {
            config,
            chat: Arc::new(chat),
        }
    }
}

pub fn router(app_state: AppState) -> Router {
    let mut app = handlers::routes().with_state(Arc::new(app_state));

    // CORS（便于前端联调；生产应收敛来源）
    use axum::http::{Method, header};
    use tower_http::cors::{AllowOrigin, CorsLayer};
    use tower_http::trace::TraceLayer;
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(AllowOrigin::mirror_request());
    app = app.layer(cors).layer(TraceLayer::new_for_http());

    app
}

pub async fn create_app(config: Settings) -> AppResult<Router> {
    let store = Arc::new(DatabaseLogger::new(&config.logging.database_path).await?);
    let client = Arc::new(HttpProviderClient::new(&config.http)?);
    tracing::info!(
        database = %config.logging.database_path,
        retry = config.api.retry,
        corps = config.corps.len(),
        "gateway components ready"
    );
    Ok(router(AppState::new(config, store, client)))
}
