pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod negotiation;
pub mod pricing;
pub mod reconcile;
#[cfg(feature = "postgres")]
pub mod schema;
pub mod service;
pub mod store;
pub mod ws;
