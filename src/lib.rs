//! uba-core: the host/helper runtime for a distributed build-execution
//! fabric — framing and crypto for the wire protocol, content-addressed
//! storage with a proxy relay, process scheduling and caching, a trace
//! stream for the visualizer, and the coordinator glue that talks to
//! whatever provisions helper capacity.
//!
//! # Architecture
//!
//! 1. **Transport**: [`framing`] (connection pool, send/recv frames) and
//!    [`crypto`] (optional AES-128-CTR body encryption) underpin
//!    [`network`]'s client/server handshake and request dispatch.
//! 2. **Storage**: [`cas`] is the content-addressed blob store; [`proxy`]
//!    relays fetches for helpers in the same zone so the host doesn't see
//!    every request.
//! 3. **Execution**: [`session`] tracks processes, root-path
//!    virtualization, and the append-only directory/name tables;
//!    [`scheduler`] decides where each process runs; [`cache`] answers
//!    "has this exact input set run before".
//! 4. **Observability and glue**: [`trace`] records the event timeline;
//!    [`coordinator`] asks for more helpers and reports capacity signals;
//!    [`config`] loads the dotted-path settings table both binaries share.
//!
//! ```rust
//! use uba_core::config::UbaConfig;
//!
//! let config = UbaConfig::default();
//! assert!(config.scheduler.max_local_processors > 0);
//! ```

pub mod cache;
pub mod cas;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod network;
pub mod proxy;
pub mod scheduler;
pub mod session;
pub mod trace;

pub use config::{ConfigBuilder, UbaConfig};
pub use error::{UbaError, UbaResult};
