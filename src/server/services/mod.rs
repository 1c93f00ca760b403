pub mod auth;
pub mod chat_database;
pub mod coordinator;
pub mod gateway;
pub mod model_router;
pub mod modelscope;
pub mod ollama;
pub mod perception;
pub mod phase;
