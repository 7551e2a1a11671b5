//! Analysis dispatcher — job state tracking and email notification engine.

pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod notify;
pub mod routes;
pub mod store;
