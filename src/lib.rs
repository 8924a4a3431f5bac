//! # Tunnelgate
//!
//! Intercept and packet-routing engine for zero-trust tunnel clients.
//!
//! Tunnelgate sits between a host network interface and a tunnel backend.
//! Services register intercept rules (protocols, addresses, port ranges);
//! client traffic to a covered destination is terminated by an embedded IP
//! stack and turned into backend connections through a small callback API.
//!
//! ## Architecture
//!
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Tunnel Backend                          │
//! │        dial · write · close · close_write · host callbacks      │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                 Engine (single loop thread)                     │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ InterceptRegistry│  │   IoTable    │  │  EngineHandle    │   │
//! │  │ (newest first)   │  │ (I/O ctx)    │  │  (cross-thread)  │   │
//! │  └──────────────────┘  └──────────────┘  └──────────────────┘   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │             Embedded IP stack: TCP handler · UDP handler        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │           Network interface driver (TUN device, routes)         │
//! └─────────────────────────────────────────────────────────────────┘

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow stylistic lints that don't affect correctness
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]      // Many functions can't be const due to trait bounds
#![allow(clippy::doc_markdown)]              // ASCII diagrams in docs
#![allow(clippy::cast_possible_truncation)]  // Header fields are narrower than usize
#![allow(clippy::cast_possible_wrap)]        // Intentional for sequence arithmetic
#![allow(clippy::similar_names)]             // src/dst, seq/ack are intentionally named
#![allow(clippy::significant_drop_tightening)] // Lock ordering is intentional
#![allow(clippy::option_if_let_else)]        // More readable in context
#![allow(clippy::use_self)]                  // Explicit type names in matches
#![allow(clippy::redundant_pub_crate)]       // Explicit visibility
#![allow(clippy::cognitive_complexity)]      // Complex state machines
#![allow(clippy::too_many_lines)]            // Complete implementations
#![allow(clippy::future_not_send)]           // Engine loop is single-threaded
#![allow(clippy::match_same_arms)]           // Explicit arm per variant is clearer
#![allow(clippy::return_self_not_must_use)]  // Builder methods don't need must_use
#![allow(clippy::ignored_unit_patterns)]     // Ok(_) vs Ok(()) is stylistic

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod intercept;
pub mod netif;
pub mod stack;
pub mod types;

pub use config::Config;
pub use error::{Error, FatalError, Result};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build version: `git describe` output when built from a checkout, the
/// package version otherwise.
pub fn version() -> &'static str {
    option_env!("GIT_VERSION").unwrap_or(VERSION)
}

/// Build date as `YYYY-MM-DD`.
pub fn build_date() -> &'static str {
    option_env!("BUILD_DATE").unwrap_or("unknown")
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{
        CallbackOverrides, ConfigType, DialRequest, HostContext, IoContext, TunnelCallbacks, WriteAck,
    };
    pub use crate::config::{Config, EngineConfig};
    pub use crate::engine::{dispatch_default, Engine, EngineHandle, EngineThread, IpStats};
    pub use crate::error::{Error, FatalError, Result};
    pub use crate::intercept::{Intercept, InterceptAddress, PortRange};
    pub use crate::netif::{NetifDriver, PacketReader, PacketSink, TunConfig, TunDriver};
    pub use crate::types::*;
}
