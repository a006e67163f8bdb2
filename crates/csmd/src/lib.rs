//! csm engine - process sampling, session registry and poll scheduling
//!
//! This crate drives the session state machine from `csm-core`:
//! - `sampler` - reads the process table and filters to the target command
//! - `registry` - session state owner (actor) and subscriber broadcast
//! - `poller` - fixed-interval scheduler feeding samples to the registry
//! - `config` - TOML configuration
//! - `tmux` - terminal label lookup and pane activation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           csmd                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐  ApplySample  ┌──────────────────────┐  │
//! │  │  PollScheduler  │──────────────▶│    RegistryActor     │  │
//! │  │ (interval task) │               │ (session state owner)│  │
//! │  └────────┬────────┘               └──────────┬───────────┘  │
//! │           │ spawn_blocking     Acknowledge ▲  │ Snapshot     │
//! │           ▼                                │  ▼              │
//! │  ┌─────────────────┐               ┌───────┴──────────────┐  │
//! │  │  ProcessSource  │               │  RegistryHandle /    │  │
//! │  │   (ps/sysinfo)  │               │  broadcast receivers │  │
//! │  └─────────────────┘               └──────────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod poller;
pub mod registry;
pub mod sampler;
pub mod tmux;
