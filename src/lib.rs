//! # structlint
//!
//! Model-assisted defect analysis for structured text files (JSON, CSV, XML,
//! YAML). A strict local parse supplies ground-truth hints; a language model
//! is asked for the full set of defects; its answer is recovered, validated,
//! and mapped back onto exact positions in the original file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌─────────┐
//! │  detect  │──▶│ precheck │──▶│ sampler │──▶│  cache  │──hit──▶ response
//! └──────────┘   └──────────┘   └─────────┘   └────┬────┘
//!                                                  │ miss
//!                                                  ▼
//! ┌───────────┐   ┌──────────┐   ┌──────────┐   ┌────────┐
//! │ normalize │◀──│ recovery │◀──│   llm    │◀──│ prompt │
//! └─────┬─────┘   └──────────┘   └──────────┘   └────────┘
//!       ▼
//!   response ──▶ cache
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`text`] | Char-based line/column arithmetic |
//! | [`detect`] | Format detection |
//! | [`precheck`] | Strict local parsing into hints |
//! | [`sampler`] | Head/tail/error-window sampling and the truncation map |
//! | [`references`] | Per-format reference checklists |
//! | [`prompt`] | Prompt construction |
//! | [`llm`] | Model transport with timeout and retry |
//! | [`recovery`] | JSON extraction, repair and validation of model output |
//! | [`normalize`] | Position verification and confidence scoring |
//! | [`cache`] | Result cache with primary store and in-memory fallback |
//! | [`pipeline`] | The end-to-end analyzer |
//! | [`server`] | HTTP server |
//! | [`db`] | SQLite connection |

pub mod cache;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod precheck;
pub mod prompt;
pub mod recovery;
pub mod references;
pub mod sampler;
pub mod server;
pub mod text;
