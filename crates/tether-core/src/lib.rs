//! Tether core.
//!
//! Sans-IO implementation of host/remote mirror sessions: everything that
//! decides *what* crosses the wire and *when*, with no sockets, threads or
//! clocks of its own.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - [`resolver`]: depth-first topological sort with stable tie-breaking
//! - [`asset`], [`module`], [`store`]: named resources, generated code
//!   modules, package bundles and the store that owns them
//! - [`session`]: identity, status, command queue and mirror registry
//! - [`mirror`]: paired objects and the property/event sync engine
//! - [`keepalive`], [`connection`]: heartbeat-driven lifetimes and channel
//!   liveness
//!
//! State machines take time as input and return actions. Drivers (see the
//! `tether-server` crate) execute the actions against real I/O, and tests
//! execute them against a simulated remote.
//!
//! # Threading
//!
//! Sessions, mirrors and the asset store are single-threaded (`Rc`,
//! `RefCell`). One event loop owns them; I/O threads hand bytes to that loop
//! and never touch session state directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod asset;
pub mod channel;
pub mod codegen;
pub mod connection;
pub mod env;
pub mod error;
pub mod keepalive;
pub mod mirror;
pub mod module;
pub mod resolver;
pub mod session;
pub mod store;

pub use asset::{Asset, AssetKind, AssetSource, NoFetcher, ResourceFetcher};
pub use channel::{Channel, MemoryChannel};
pub use codegen::{CodeGenerator, GeneratedCode, MirrorClassGenerator};
pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::{AssetError, ConnectionError, MirrorError, ResolveError, SessionError};
pub use keepalive::KeepAlive;
pub use mirror::{
    Action, Attribute, HandlerId, Mirror, MirrorClass, MirrorEvent, Origin, SyncMode, ValueKind, WeakMirror,
};
pub use module::{Bundle, Module};
pub use resolver::{Dependent, MissingDependency, Resolution, resolve};
pub use session::{
    EvalCallback, RoundtripCallback, RuntimeHandle, RuntimeLauncher, Session, SessionAction, SessionConfig,
    SessionId, SessionStatus, SessionTask,
};
pub use store::{AssetStore, ClassRegistration, SharedStore, default_store};
