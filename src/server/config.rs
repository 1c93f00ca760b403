use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::server::{
    content::ContentCatalog,
    handlers::chat::{active_session, clear_history, send_message},
    services::{
        auth::AuthService, chat_database::ChatDatabaseService, coordinator::ChatCoordinator,
        model_router::ModelRouter, modelscope::ModelScopeService, ollama::OllamaService,
        perception::PerceptionService, phase::PhaseManager,
    },
};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub ollama: OllamaSettings,
    pub modelscope: ModelScopeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OllamaSettings {
    pub base_url: String,
    pub chat_model: String,
    pub classifier_model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelScopeSettings {
    pub api_key: Secret<String>,
    pub base_url: String,
    pub model: String,
}

impl Settings {
    /// Defaults overridable through `XINYI__`-prefixed environment variables,
    /// e.g. `XINYI__MODELSCOPE__API_KEY`.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("port", 8000)?
            .set_default("database_url", "sqlite://xinyi.db")?
            .set_default("ollama.base_url", "http://localhost:11434")?
            .set_default("ollama.chat_model", "Ethanwhh/Qwen3-4B-xinyi")?
            .set_default("ollama.classifier_model", "Ethanwhh/Qwen3-4B-xinyi")?
            .set_default("modelscope.api_key", "")?
            .set_default("modelscope.base_url", "https://api-inference.modelscope.cn/v1")?
            .set_default("modelscope.model", "Qwen/Qwen3-Next-80B-A3B-Instruct")?
            .add_source(Environment::with_prefix("XINYI").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<ChatDatabaseService>,
    pub auth: Arc<AuthService>,
    pub coordinator: Arc<ChatCoordinator>,
    pub catalog: Arc<ContentCatalog>,
}

/// Builds every service once and wires the router. All services are
/// stateless and shared; session state lives in the database.
pub async fn configure_app(pool: SqlitePool, settings: &Settings) -> Result<Router> {
    let catalog = Arc::new(ContentCatalog::default());

    let db = Arc::new(ChatDatabaseService::new(pool));
    db.migrate().await?;

    let auth = Arc::new(AuthService::new(db.clone()));

    let local = Arc::new(OllamaService::new(
        settings.ollama.base_url.clone(),
        settings.ollama.chat_model.clone(),
    ));
    let classifier = Arc::new(OllamaService::new(
        settings.ollama.base_url.clone(),
        settings.ollama.classifier_model.clone(),
    ));
    let remote = Arc::new(ModelScopeService::new(
        settings.modelscope.api_key.clone(),
        settings.modelscope.base_url.clone(),
        settings.modelscope.model.clone(),
    ));

    let perception = Arc::new(PerceptionService::new(classifier, catalog.clone())?);
    let phases = PhaseManager::new(catalog.solution_triggers.clone());
    let router = ModelRouter::new(local, remote);

    let coordinator = Arc::new(ChatCoordinator::new(
        db.clone(),
        perception,
        phases,
        router,
        catalog.clone(),
    ));

    let state = AppState {
        db,
        auth,
        coordinator,
        catalog,
    };

    Ok(app_router(state))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/send", post(send_message))
        .route("/api/chat/active", get(active_session))
        .route("/api/chat/clear", delete(clear_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
