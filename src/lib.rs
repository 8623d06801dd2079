//! # wp-relocate
//!
//! Moves the images referenced by WordPress-era content off the legacy media
//! host and onto a locally controlled asset tree.
//!
//! The relocation runs as four stages. Each stage writes a JSON artifact that
//! the next one reads, so any stage can be re-run on its own.
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌───────────┐
//! │ Content  │──▶│ Extract  │──▶│  Fetch   │──▶│ Redirects │
//! │ (SQLite) │   │ Classify │   │ (HTTP)   │   │ nginx/ap. │
//! └────┬─────┘   └──────────┘   └────┬─────┘   └───────────┘
//!      │                             │
//!      └────────── Rewrite ◀─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wprl init                 # create the redirect table
//! wprl analyze              # extract + classify references
//! wprl fetch                # download assets into the local tree
//! wprl redirects            # persist rules, render proxy configs
//! wprl rewrite --dry-run    # preview content updates
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Pulling image references out of content |
//! | [`classify`] | Categorizing references |
//! | [`fetch`] | Resolving, downloading, and storing assets |
//! | [`redirect`] | Redirect rules and proxy config rendering |
//! | [`content`] | Content store access |
//! | [`rewrite`] | Rewriting content to relocated URLs |
//! | [`artifacts`] | Stage artifacts on disk |
//! | [`pipeline`] | Stage orchestration |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Run statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod content;
pub mod db;
pub mod extract;
pub mod fetch;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod redirect;
pub mod rewrite;
pub mod stats;
