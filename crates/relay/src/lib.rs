// parley-relay: realtime room server.

pub mod api;
pub mod app;
pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod messages;
pub mod metrics;
pub mod rooms;
pub mod session;
pub mod state;
pub mod store;
pub mod ws;

pub use app::build_router;
pub use config::ServerConfig;
pub use state::AppState;
