//! # StayTerm Server Library
//!
//! Persistent shell sessions for remote terminals. A client that loses its
//! connection keeps its shell; reconnecting with the same client id picks the
//! session up where it was left.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        stayterm-server                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────┐   register   ┌────────────────────────┐  │
//! │  │  IPC service   │ ───────────▶ │    SessionRegistry     │  │
//! │  └────────────────┘              └────────────────────────┘  │
//! │                                      ▲            ▲          │
//! │  ┌────────────────┐   handshake      │            │          │
//! │  │   Dispatcher   │ ─────────────────┘            │          │
//! │  └────────────────┘                               │          │
//! │          │ one task per session                   │          │
//! │          ▼                                        │          │
//! │  ┌────────────────────────────────────────────────┴───────┐  │
//! │  │  SessionMultiplexer:  PtySession ◀──▶ FramedConnection │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Dispatcher, SessionRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let registry = SessionRegistry::new();
//!
//!     let handle = Dispatcher::bind(&config, registry).await?.spawn();
//!     tokio::signal::ctrl_c().await?;
//!     handle.halt().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`ipc`]: Local client registration and control socket
//! - [`network`]: Reconnectable framed connections
//! - [`server`]: TCP acceptor, handshake and halt sequence
//! - [`session`]: Registry, PTY spawning and the per-session loop

pub mod config;
pub mod ipc;
pub mod network;
pub mod server;
pub mod session;

pub use config::Config;
pub use network::{Connection, ConnectionError, FramedConnection};
pub use server::{Dispatcher, DispatcherHandle, DispatcherSettings, HandshakeError};
pub use session::{
    PtySession, SessionError, SessionMultiplexer, SessionRegistry, SpawnCredential,
};
