pub mod auth;
pub mod config;
pub mod error;
pub mod forms;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod router;
pub mod server;
pub mod session;
pub mod state;
pub mod storage;
pub mod templates;
