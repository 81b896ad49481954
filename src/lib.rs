//! # vizchat
//!
//! Ask natural-language questions about a tabular dataset and get charts
//! back: recommended, generated, rendered and, on request, analyzed by an
//! LLM, streamed as chat replies.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────────────────┐
//! │ CLI / ws   │──▶│ Orchestrator │──▶│ Recommender / Refiner         │
//! │ (events)   │◀──│  (replies)   │   │ ─▶ Extraction ─▶ Render      │
//! └────────────┘   └──────┬───────┘   │ Analyzer                      │
//!                         │           └──────────────┬───────────────┘
//!                         ▼                          ▼
//!                   ┌──────────┐              ┌─────────────┐
//!                   │  SQLite  │              │ Lua sandbox │
//!                   └──────────┘              │ frame/np/plt│
//!                                             └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error taxonomy |
//! | [`llm`] | LLM client abstraction and OpenAI provider |
//! | [`dataset`] | CSV loading |
//! | [`enrich`] | Column properties and schema enrichment |
//! | [`schema`] | Read access to enriched schema |
//! | [`lua_runtime`] | Host modules for generated code (`np`, `json`, `frame`) |
//! | [`plot`] | Chart model and SVG/PNG drawing |
//! | [`sandbox`] | Resource-limited execution of generated code |
//! | [`templates`] | Per-kind reference templates |
//! | [`recommend`] | Visualization recommendation and refinement |
//! | [`extract`] | Data extraction stage |
//! | [`render`] | Render stage with bounded retries |
//! | [`analyze`] | Vision analysis of rendered charts |
//! | [`orchestrator`] | Event handling |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`server`] | Websocket chat server |
//! | [`commands`] | CLI commands |

pub mod analyze;
pub mod commands;
pub mod config;
pub mod dataset;
pub mod db;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod llm;
pub mod lua_runtime;
pub mod migrate;
pub mod orchestrator;
pub mod plot;
pub mod recommend;
pub mod render;
pub mod sandbox;
pub mod schema;
pub mod server;
pub mod sqlite_store;
pub mod templates;
