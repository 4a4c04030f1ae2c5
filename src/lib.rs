//! Lead Lifecycle & Auto-Response Engine Library
//!
//! Captures inbound sales inquiries from every channel, scores them, sends a
//! personalized first response inside the SLA, and tracks each lead through
//! review to qualification or conversion into an Account and Deal.
//!
//! # Modules
//!
//! - `intake`: Payload normalization, deduplication and intake rate limiting.
//! - `scoring`: Deterministic lead scoring with optional company intel.
//! - `content`: Content Intelligence capability and template fallback.
//! - `dispatcher`: SLA-bound auto-response dispatch.
//! - `outbound`: Delivery relay client.
//! - `lifecycle`: Status transition table and guarded transitions.
//! - `conversion`: Account/Deal creation for qualified leads.
//! - `metrics`: Pipeline metrics over a store snapshot.
//! - `engine`: Orchestration of all of the above.
//! - `store`: The `LeadStore` contract and in-memory implementation.
//! - `db` / `db_storage`: PostgreSQL pool, migrations and `PgLeadStore`.
//! - `services`: HTTP clients for company intel and Content Intelligence.
//! - `cache_validator`: Checksummed TTL cache.
//! - `circuit_breaker`: Circuit breakers for HTTP collaborators.
//! - `locks`: Keyed async locks.
//! - `handlers` / `webhook_handler` / `webhook_models`: HTTP surface.
//! - `config`: Configuration management.
//! - `errors`: Error handling types.
//! - `models`: Core data models.

pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod content;
pub mod conversion;
pub mod db;
pub mod db_storage;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod intake;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod models;
pub mod outbound;
pub mod scoring;
pub mod services;
pub mod store;
pub mod webhook_handler;
pub mod webhook_models;
