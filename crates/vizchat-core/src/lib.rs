//! # vizchat core
//!
//! Shared logic for vizchat: data models for datasets, chat sessions and
//! turns, the in-memory tabular frame, the websocket wire messages, and the
//! storage abstraction.
//!
//! This crate contains no tokio, sqlx, Lua or network dependencies, so the
//! pipeline crate and any alternative front end can share it.

pub mod frame;
pub mod messages;
pub mod models;
pub mod store;
