//! # Record Cache
//!
//! A harvesting cache for metadata repositories.
//!
//! Record Cache polls a remote repository on a schedule, stores every
//! record it fetches in a time-bucketed content store indexed by SQLite, and
//! serves large, filtered record lists back in resumable parts.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │  Remote    │──▶│ Updater                  │──▶│ SQLite index │
//! │ repository │   │ workers ─▶ commit queue  │   │ + content    │
//! └────────────┘   │            ─▶ committer  │   │   store      │
//!                  └──────────────────────────┘   └──────┬───────┘
//!                                                        │
//!                                   ┌────────────────────┤
//!                                   ▼                    ▼
//!                            ┌────────────┐       ┌────────────┐
//!                            │ Responder  │──────▶│  Sessions  │
//!                            │  (verbs)   │       │ (parts)    │
//!                            └────────────┘       └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rcache init                       # create database
//! rcache update                     # run one harvesting cycle
//! rcache run                        # keep harvesting until Ctrl-C
//! rcache list-records --prefix oai_dc --set physics
//! rcache stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Client-facing protocol errors |
//! | [`store`] | Time-bucketed content store |
//! | [`index`] | SQLite index operations |
//! | [`queue`] | Queue snapshots for processing rounds |
//! | [`record`] | Record header parsing and validation |
//! | [`setspec`] | Set hierarchy helpers |
//! | [`source`] | Remote repository contract |
//! | [`source_fs`] | Directory-backed repository |
//! | [`round`] | Shared state of one processing round |
//! | [`worker`] | Fetch workers |
//! | [`committer`] | Commit queue and committer |
//! | [`updater`] | Harvesting scheduler |
//! | [`provider`] | List result providers |
//! | [`session`] | Paginated list sessions |
//! | [`session_manager`] | Session registry and reaper |
//! | [`cache`] | Read facade over index and store |
//! | [`responder`] | Protocol verbs |
//! | [`stats`] | Cache statistics |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod commands;
pub mod committer;
pub mod config;
pub mod db;
pub mod error;
pub mod index;
pub mod migrate;
pub mod models;
pub mod provider;
pub mod queue;
pub mod record;
pub mod responder;
pub mod round;
pub mod session;
pub mod session_manager;
pub mod setspec;
pub mod source;
pub mod source_fs;
pub mod stats;
pub mod store;
pub mod updater;
pub mod worker;
