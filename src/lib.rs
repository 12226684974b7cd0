//! Inbox relay: multi-source message ingestion and dispatch.

pub mod channels;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod status;
pub mod store;
