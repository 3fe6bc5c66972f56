pub mod achievements;
pub mod app;
pub mod auth;
pub mod blobs;
pub mod classify;
pub mod error;
pub mod geofence;
pub mod ledger;
pub mod limiter;
pub mod models;
pub mod store;
