//! Tether wire protocol.
//!
//! Every message crossing the host/remote boundary is a [`Command`]: a verb
//! plus positional arguments. On the wire a command is a single line of UTF-8
//! holding a JSON array, verb first:
//!
//! ```text
//! ["DEFINE-JS","app.widgets","tether.define(...)"]
//! ["SET_PROP","Slider_3","value",0.5]
//! ["INIT-DONE"]
//! ```
//!
//! JSON string escaping keeps arbitrary source text on one line, so the
//! transport only has to split on `\n`.
//!
//! # Unknown verbs
//!
//! A well formed line with a verb this crate does not know decodes to
//! [`Command::Unknown`] rather than an error. Receivers log and drop it; the
//! channel stays open. Only structurally broken lines produce a
//! [`ProtocolError`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod errors;

pub use command::{CloseCode, Command, DefineKind, DiagnosticLevel, Verb};
pub use errors::{ProtocolError, Result};

/// Maximum accepted length of one encoded command line (16 MiB).
pub const MAX_LINE_LEN: usize = 16 * 1024 * 1024;
