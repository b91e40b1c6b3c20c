//! # Doc Spider
//!
//! Resumable ingestion of documents from a file store into a vector index.
//!
//! Every source file is a record in a SQLite ledger with a lifecycle status.
//! A run streams eligible records, downloads them, extracts plain text by
//! format, splits the text into overlapping passages and writes those
//! passages, with the parent file's metadata, to a Weaviate collection that
//! embeds them server-side.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌─────────┐   ┌──────────┐
//! │  Ledger  │──▶│  Fetch  │──▶│ Extract │──▶│  Chunk  │──▶│  Writer  │
//! │ (SQLite) │   │ (HTTP)  │   │doc/pdf/ │   │         │   │(Weaviate)│
//! └────▲─────┘   └─────────┘   │  xlsx   │   └─────────┘   └────┬─────┘
//!      │                       └─────────┘                      │
//!      └──────────────── status advanced / error ───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! spider init                       # create the ledger database
//! spider register files.jsonl       # register storage objects
//! spider wait-ready                 # block until the index takes writes
//! spider run                        # fetch, extract, chunk, index
//! spider status                     # per-status counts
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration |
//! | [`error`] | Error kinds |
//! | [`models`] | File records, statuses, index entries |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`ledger`] | Status ledger, claims, site directory |
//! | [`register`] | Manifest registration |
//! | [`fetch`] | Content fetcher |
//! | [`extract`] | Format parser dispatch |
//! | [`chunk`] | Text chunking |
//! | [`stats`] | Run statistics |
//! | [`index`] | Vector index backends |
//! | [`writer`] | Vector index writer |
//! | [`readiness`] | Readiness gates |
//! | [`pipeline`] | Run orchestration |

pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod index;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod readiness;
pub mod register;
pub mod stats;
pub mod writer;
