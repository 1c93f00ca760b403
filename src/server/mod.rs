pub mod config;
pub mod content;
pub mod handlers;
pub mod models;
pub mod services;
