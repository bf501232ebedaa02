//! modelfetch Core - Resumable Download Engine
//!
//! This crate provides the resumable download subsystem: a transfer
//! engine that streams one download at a time, persists resume state
//! across process restarts, exposes progress/completion as an ordered
//! asynchronous event sequence, and hands completed artifacts to their
//! destination through a durable two-hop move.

mod cache;
mod client;
mod engine;
mod error;

pub use cache::*;
pub use client::*;
pub use engine::*;
pub use error::*;
