//! # Federated Retrieval
//!
//! A connector and retrieval engine that keeps a vector index over several
//! heterogeneously secured document sources and answers natural-language
//! queries from all of them at once.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │  Connectors  │──▶│ Normalizer │──▶│  Indexer  │──▶│ Vector index │
//! │ share, wiki, │   │ text+hash  │   │ idempotent│   │   (SQLite)   │
//! │ portals      │   └────────────┘   └───────────┘   └──────┬───────┘
//! └──────┬───────┘                                           │
//!        │ credentials                                       ▼
//! ┌──────┴───────┐                                   ┌──────────────┐
//! │Session store │──────────────────────────────────▶│Query planner │
//! └──────────────┘          eligible sources         │  and merger  │
//!                                                    └──────┬───────┘
//!                                          ┌────────────────┤
//!                                          ▼                ▼
//!                                     ┌─────────┐     ┌──────────┐
//!                                     │   CLI   │     │   HTTP   │
//!                                     │ (fedr)  │     │   API    │
//!                                     └─────────┘     └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy shared by connectors, indexer and planner |
//! | [`session`] | In-memory credential session store and SSO handshake |
//! | [`connector`] | Connector trait and the four source implementations |
//! | [`extract`] | Text extraction from PDF and OOXML files |
//! | [`normalize`] | Raw content to normalized documents |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index and sync-state persistence |
//! | [`indexer`] | Incremental, idempotent indexing passes |
//! | [`snippet`] | Query-aware snippet extraction |
//! | [`planner`] | Federated query planning and score merging |
//! | [`completion`] | Answer generation over retrieved passages |
//! | [`engine`] | The retrieval API used by the CLI and the server |
//! | [`sources`] | Source overview |
//! | [`server`] | HTTP retrieval API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod completion;
pub mod config;
pub mod connector;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod index;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod planner;
pub mod server;
pub mod session;
pub mod snippet;
pub mod sources;
