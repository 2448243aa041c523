//! Offline caching and resilience agent.
//!
//! The [`Agent`] sits between an application's pages and the network. It
//! answers requests from versioned cache stores, queues writes made while
//! offline and replays them when connectivity returns, and synthesizes
//! fallback responses when nothing else can answer.

pub mod agent;
pub mod cache;
pub mod clients;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod fallback;
pub mod http;
pub mod interceptor;
pub mod lifecycle;
pub mod network;
pub mod notify;
pub mod queue;
pub mod strategy;

pub use agent::Agent;
pub use config::Config;
pub use error::AgentError;
pub use http::{Request, Response};
