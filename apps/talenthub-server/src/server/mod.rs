pub(crate) mod auth;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod domain;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod mailer;
pub(crate) mod metrics;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod storage;
#[cfg(test)]
mod tests;
pub(crate) mod types;
pub(crate) mod user_repository;

pub use core::AppConfig;
pub use errors::init_tracing;
pub use router::build_router;
