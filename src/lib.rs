//! Payment reconciliation core: connected accounts, revenue splits,
//! subscription and transaction ledgers, and webhook ingestion.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod processor;
pub mod repos;
pub mod routes;
pub mod services;
pub mod state;
pub mod stripe;
pub mod webhooks;

pub use routes::router as build_router;
pub use state::AppState;
