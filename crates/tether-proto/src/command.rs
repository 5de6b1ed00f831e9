//! Command type and its line encoding.

use std::fmt;

use serde_json::{Map, Value};

use crate::{
    MAX_LINE_LEN,
    errors::{ProtocolError, Result},
};

/// Kind of body carried by a `DEFINE-<KIND>` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefineKind {
    /// Plain script asset, loaded as-is
    Js,
    /// Module code that the remote loader evaluates and registers
    JsEval,
    /// Style sheet text
    Css,
    /// Opaque binary, base64 encoded
    Data,
}

impl DefineKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Js => "JS",
            Self::JsEval => "JS-EVAL",
            Self::Css => "CSS",
            Self::Data => "DATA",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "JS" => Some(Self::Js),
            "JS-EVAL" => Some(Self::JsEval),
            "CSS" => Some(Self::Css),
            "DATA" => Some(Self::Data),
            _ => None,
        }
    }
}

/// Severity of a diagnostic passthrough command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticLevel {
    /// `PRINT`: plain console output
    Print,
    /// `INFO`
    Info,
    /// `WARN`
    Warn,
    /// `ERROR`
    Error,
}

/// Close codes carried by `CLOSE` and by channel close requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// Normal closure
    Normal,
    /// Endpoint going away
    GoingAway,
    /// Protocol error
    ProtocolError,
    /// Could not accept the data or associate the channel
    Unacceptable,
}

impl CloseCode {
    /// Numeric code as used by websocket-style transports.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::Unacceptable => 1003,
        }
    }

    /// Parse a numeric close code. Unknown codes map to `None`.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::Unacceptable),
            _ => None,
        }
    }
}

/// Verbs known to this protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `DEFINE-<KIND>`
    Define(DefineKind),
    /// `INIT-DONE`
    InitDone,
    /// `EXEC`
    Exec,
    /// `INSTANTIATE`
    Instantiate,
    /// `DISPOSE`
    Dispose,
    /// `DISPOSE_ACK`
    DisposeAck,
    /// `SET_PROP`
    SetProp,
    /// `SET_EVENT_TYPES`
    SetEventTypes,
    /// `EVENT`
    Event,
    /// `PING`
    Ping,
    /// `PONG`
    Pong,
    /// `HELLO`
    Hello,
    /// `PRINT`, `INFO`, `WARN`, `ERROR`
    Diagnostic(DiagnosticLevel),
    /// `CLOSE`
    Close,
    /// `INVOKE`
    Invoke,
    /// `EVALANDRETURN`
    EvalAndReturn,
    /// `EVALRESULT`
    EvalResult,
}

impl Verb {
    /// Wire spelling of this verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Define(DefineKind::Js) => "DEFINE-JS",
            Self::Define(DefineKind::JsEval) => "DEFINE-JS-EVAL",
            Self::Define(DefineKind::Css) => "DEFINE-CSS",
            Self::Define(DefineKind::Data) => "DEFINE-DATA",
            Self::InitDone => "INIT-DONE",
            Self::Exec => "EXEC",
            Self::Instantiate => "INSTANTIATE",
            Self::Dispose => "DISPOSE",
            Self::DisposeAck => "DISPOSE_ACK",
            Self::SetProp => "SET_PROP",
            Self::SetEventTypes => "SET_EVENT_TYPES",
            Self::Event => "EVENT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Hello => "HELLO",
            Self::Diagnostic(DiagnosticLevel::Print) => "PRINT",
            Self::Diagnostic(DiagnosticLevel::Info) => "INFO",
            Self::Diagnostic(DiagnosticLevel::Warn) => "WARN",
            Self::Diagnostic(DiagnosticLevel::Error) => "ERROR",
            Self::Close => "CLOSE",
            Self::Invoke => "INVOKE",
            Self::EvalAndReturn => "EVALANDRETURN",
            Self::EvalResult => "EVALRESULT",
        }
    }

    /// Parse a wire verb. `None` for verbs this version does not know.
    pub fn parse(verb: &str) -> Option<Self> {
        if let Some(suffix) = verb.strip_prefix("DEFINE-") {
            return DefineKind::from_suffix(suffix).map(Self::Define);
        }
        let verb = match verb {
            "INIT-DONE" => Self::InitDone,
            "EXEC" => Self::Exec,
            "INSTANTIATE" => Self::Instantiate,
            "DISPOSE" => Self::Dispose,
            "DISPOSE_ACK" => Self::DisposeAck,
            "SET_PROP" => Self::SetProp,
            "SET_EVENT_TYPES" => Self::SetEventTypes,
            "EVENT" => Self::Event,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "HELLO" => Self::Hello,
            "PRINT" => Self::Diagnostic(DiagnosticLevel::Print),
            "INFO" => Self::Diagnostic(DiagnosticLevel::Info),
            "WARN" => Self::Diagnostic(DiagnosticLevel::Warn),
            "ERROR" => Self::Diagnostic(DiagnosticLevel::Error),
            "CLOSE" => Self::Close,
            "INVOKE" => Self::Invoke,
            "EVALANDRETURN" => Self::EvalAndReturn,
            "EVALRESULT" => Self::EvalResult,
            _ => return None,
        };
        Some(verb)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol command.
///
/// Direction is a convention, not enforced here: the host never sends
/// `HELLO`, `INVOKE` or `EVALRESULT`, the remote never sends `DEFINE-*`.
/// Receivers decide what they accept.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Deliver a module, bundle or asset body before anything references it
    Define {
        /// Body kind
        kind: DefineKind,
        /// Asset or module name
        name: String,
        /// Body text (base64 for [`DefineKind::Data`])
        source: String,
    },
    /// End of the queued-command flush after attach
    InitDone,
    /// Evaluate code for side effect; no reply
    Exec {
        /// Code to evaluate
        code: String,
    },
    /// Construct the other half of a mirror object
    Instantiate {
        /// Mirror id
        id: String,
        /// Class name as declared by its module
        class: String,
        /// Initial (normalized) property values
        props: Map<String, Value>,
        /// Event types the host currently handles for this object
        event_types: Vec<String>,
    },
    /// Dispose a mirror object
    Dispose {
        /// Mirror id
        id: String,
    },
    /// Acknowledge a `DISPOSE`
    DisposeAck {
        /// Mirror id
        id: String,
    },
    /// Property mutation
    SetProp {
        /// Mirror id
        id: String,
        /// Attribute name
        name: String,
        /// New value
        value: Value,
    },
    /// Sender's active event-type set for an object
    SetEventTypes {
        /// Mirror id
        id: String,
        /// Event types with at least one live handler
        types: Vec<String>,
    },
    /// Event emitted on an object
    Event {
        /// Mirror id
        id: String,
        /// Event type
        kind: String,
        /// Event payload
        payload: Value,
    },
    /// Heartbeat request carrying the sender's cycle counter
    Ping {
        /// Cycle counter
        count: u64,
    },
    /// Heartbeat reply echoing the counter of the ping it answers
    Pong {
        /// Cycle counter
        count: u64,
    },
    /// First command of a remote peer: which app, and which pending session
    Hello {
        /// Application name
        app: String,
        /// Pending session to attach to; `None` asks for a fresh session
        session_id: Option<String>,
    },
    /// Diagnostic passthrough
    Diagnostic {
        /// Severity
        level: DiagnosticLevel,
        /// Message text
        text: String,
    },
    /// Notice that the sender is about to close the channel
    Close {
        /// Numeric close code
        code: u16,
        /// Human-readable reason
        reason: String,
    },
    /// Remote call of a host action on a mirror object
    Invoke {
        /// Mirror id
        id: String,
        /// Action name
        action: String,
        /// Positional arguments
        args: Vec<Value>,
    },
    /// Evaluate code remotely and reply with `EVALRESULT`
    EvalAndReturn {
        /// Code to evaluate
        code: String,
        /// Correlation id echoed by the reply
        eval_id: u64,
    },
    /// Result of an `EVALANDRETURN`
    EvalResult {
        /// Evaluated value
        value: Value,
        /// Correlation id of the request
        eval_id: u64,
    },
    /// Well formed command with a verb this version does not know
    Unknown {
        /// Verb as received
        verb: String,
        /// Raw arguments
        args: Vec<Value>,
    },
}

impl Command {
    /// Shorthand for `DEFINE-<kind> name source`.
    pub fn define(kind: DefineKind, name: impl Into<String>, source: impl Into<String>) -> Self {
        Self::Define { kind, name: name.into(), source: source.into() }
    }

    /// Shorthand for `EXEC code`.
    pub fn exec(code: impl Into<String>) -> Self {
        Self::Exec { code: code.into() }
    }

    /// Verb of this command. `None` for [`Command::Unknown`].
    pub fn verb(&self) -> Option<Verb> {
        let verb = match self {
            Self::Define { kind, .. } => Verb::Define(*kind),
            Self::InitDone => Verb::InitDone,
            Self::Exec { .. } => Verb::Exec,
            Self::Instantiate { .. } => Verb::Instantiate,
            Self::Dispose { .. } => Verb::Dispose,
            Self::DisposeAck { .. } => Verb::DisposeAck,
            Self::SetProp { .. } => Verb::SetProp,
            Self::SetEventTypes { .. } => Verb::SetEventTypes,
            Self::Event { .. } => Verb::Event,
            Self::Ping { .. } => Verb::Ping,
            Self::Pong { .. } => Verb::Pong,
            Self::Hello { .. } => Verb::Hello,
            Self::Diagnostic { level, .. } => Verb::Diagnostic(*level),
            Self::Close { .. } => Verb::Close,
            Self::Invoke { .. } => Verb::Invoke,
            Self::EvalAndReturn { .. } => Verb::EvalAndReturn,
            Self::EvalResult { .. } => Verb::EvalResult,
            Self::Unknown { .. } => return None,
        };
        Some(verb)
    }

    /// Verb spelling, including unknown verbs as received.
    pub fn verb_str(&self) -> &str {
        match self {
            Self::Unknown { verb, .. } => verb,
            other => other.verb().map_or("", Verb::as_str),
        }
    }

    /// Encode as one line of JSON (no trailing newline).
    pub fn encode(&self) -> String {
        let mut items = vec![Value::String(self.verb_str().to_string())];
        match self {
            Self::Define { name, source, .. } => {
                items.push(Value::from(name.as_str()));
                items.push(Value::from(source.as_str()));
            },
            Self::InitDone => {},
            Self::Exec { code } => items.push(Value::from(code.as_str())),
            Self::Instantiate { id, class, props, event_types } => {
                items.push(Value::from(id.as_str()));
                items.push(Value::from(class.as_str()));
                items.push(Value::Object(props.clone()));
                items.push(string_list(event_types));
            },
            Self::Dispose { id } | Self::DisposeAck { id } => items.push(Value::from(id.as_str())),
            Self::SetProp { id, name, value } => {
                items.push(Value::from(id.as_str()));
                items.push(Value::from(name.as_str()));
                items.push(value.clone());
            },
            Self::SetEventTypes { id, types } => {
                items.push(Value::from(id.as_str()));
                items.push(string_list(types));
            },
            Self::Event { id, kind, payload } => {
                items.push(Value::from(id.as_str()));
                items.push(Value::from(kind.as_str()));
                items.push(payload.clone());
            },
            Self::Ping { count } | Self::Pong { count } => items.push(Value::from(*count)),
            Self::Hello { app, session_id } => {
                items.push(Value::from(app.as_str()));
                if let Some(id) = session_id {
                    items.push(Value::from(id.as_str()));
                }
            },
            Self::Diagnostic { text, .. } => items.push(Value::from(text.as_str())),
            Self::Close { code, reason } => {
                items.push(Value::from(*code));
                items.push(Value::from(reason.as_str()));
            },
            Self::Invoke { id, action, args } => {
                items.push(Value::from(id.as_str()));
                items.push(Value::from(action.as_str()));
                items.push(Value::Array(args.clone()));
            },
            Self::EvalAndReturn { code, eval_id } => {
                items.push(Value::from(code.as_str()));
                items.push(Value::from(*eval_id));
            },
            Self::EvalResult { value, eval_id } => {
                items.push(value.clone());
                items.push(Value::from(*eval_id));
            },
            Self::Unknown { args, .. } => items.extend(args.iter().cloned()),
        }
        Value::Array(items).to_string()
    }

    /// Decode one line. Surrounding whitespace (including a trailing `\r`)
    /// is ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::LineTooLong` if the line exceeds [`MAX_LINE_LEN`]
    /// - `ProtocolError::Json` / `NotAnArray` / `MissingVerb` for broken lines
    /// - `ProtocolError::Arity` / `InvalidArgument` for a known verb with bad
    ///   arguments
    pub fn decode(line: &str) -> Result<Self> {
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong { size: line.len(), max: MAX_LINE_LEN });
        }

        let Value::Array(mut items) = serde_json::from_str::<Value>(line.trim())? else {
            return Err(ProtocolError::NotAnArray);
        };
        if items.is_empty() {
            return Err(ProtocolError::MissingVerb);
        }
        let Value::String(verb_str) = items.remove(0) else {
            return Err(ProtocolError::MissingVerb);
        };

        let Some(verb) = Verb::parse(&verb_str) else {
            return Ok(Self::Unknown { verb: verb_str, args: items });
        };

        let mut args = Args { verb: verb.as_str(), items };
        let command = match verb {
            Verb::Define(kind) => {
                args.arity(2, "2")?;
                Self::Define { kind, name: args.string(0)?, source: args.string(1)? }
            },
            Verb::InitDone => {
                args.arity(0, "0")?;
                Self::InitDone
            },
            Verb::Exec => {
                args.arity(1, "1")?;
                Self::Exec { code: args.string(0)? }
            },
            Verb::Instantiate => {
                args.arity(4, "4")?;
                Self::Instantiate {
                    id: args.string(0)?,
                    class: args.string(1)?,
                    props: args.object(2)?,
                    event_types: args.string_list(3)?,
                }
            },
            Verb::Dispose => {
                args.arity(1, "1")?;
                Self::Dispose { id: args.string(0)? }
            },
            Verb::DisposeAck => {
                args.arity(1, "1")?;
                Self::DisposeAck { id: args.string(0)? }
            },
            Verb::SetProp => {
                args.arity(3, "3")?;
                Self::SetProp { id: args.string(0)?, name: args.string(1)?, value: args.take(2) }
            },
            Verb::SetEventTypes => {
                args.arity(2, "2")?;
                Self::SetEventTypes { id: args.string(0)?, types: args.string_list(1)? }
            },
            Verb::Event => {
                args.arity(3, "3")?;
                Self::Event { id: args.string(0)?, kind: args.string(1)?, payload: args.take(2) }
            },
            Verb::Ping => {
                args.arity(1, "1")?;
                Self::Ping { count: args.u64(0)? }
            },
            Verb::Pong => {
                args.arity(1, "1")?;
                Self::Pong { count: args.u64(0)? }
            },
            Verb::Hello => {
                let session_id = match args.items.len() {
                    1 => None,
                    2 => Some(args.string(1)?),
                    got => {
                        return Err(ProtocolError::Arity { verb: args.verb, expected: "1-2", got });
                    },
                };
                Self::Hello { app: args.string(0)?, session_id }
            },
            Verb::Diagnostic(level) => {
                // Remote consoles sometimes pass several values; join them.
                if args.items.is_empty() {
                    return Err(ProtocolError::Arity { verb: args.verb, expected: "1+", got: 0 });
                }
                let text =
                    args.items.iter().map(display_value).collect::<Vec<_>>().join(" ");
                Self::Diagnostic { level, text }
            },
            Verb::Close => {
                args.arity(2, "2")?;
                let code = args.u64(0)?;
                let code = u16::try_from(code).map_err(|_| ProtocolError::InvalidArgument {
                    verb: args.verb,
                    index: 0,
                    expected: "close code",
                })?;
                Self::Close { code, reason: args.string(1)? }
            },
            Verb::Invoke => {
                args.arity(3, "3")?;
                Self::Invoke { id: args.string(0)?, action: args.string(1)?, args: args.list(2)? }
            },
            Verb::EvalAndReturn => {
                args.arity(2, "2")?;
                Self::EvalAndReturn { code: args.string(0)?, eval_id: args.u64(1)? }
            },
            Verb::EvalResult => {
                args.arity(2, "2")?;
                Self::EvalResult { eval_id: args.u64(1)?, value: args.take(0) }
            },
        };

        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn string_list(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| Value::from(s.as_str())).collect())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Positional argument accessor with verb-aware errors.
struct Args {
    verb: &'static str,
    items: Vec<Value>,
}

impl Args {
    fn arity(&self, expected: usize, label: &'static str) -> Result<()> {
        if self.items.len() == expected {
            Ok(())
        } else {
            Err(ProtocolError::Arity { verb: self.verb, expected: label, got: self.items.len() })
        }
    }

    fn invalid(&self, index: usize, expected: &'static str) -> ProtocolError {
        ProtocolError::InvalidArgument { verb: self.verb, index, expected }
    }

    fn string(&self, index: usize) -> Result<String> {
        match self.items.get(index) {
            Some(Value::String(s)) => Ok(s.clone()),
            _ => Err(self.invalid(index, "a string")),
        }
    }

    fn u64(&self, index: usize) -> Result<u64> {
        self.items.get(index).and_then(Value::as_u64).ok_or_else(|| self.invalid(index, "a count"))
    }

    fn object(&self, index: usize) -> Result<Map<String, Value>> {
        match self.items.get(index) {
            Some(Value::Object(map)) => Ok(map.clone()),
            _ => Err(self.invalid(index, "an object")),
        }
    }

    fn list(&mut self, index: usize) -> Result<Vec<Value>> {
        if let Some(Value::Array(items)) = self.items.get_mut(index) {
            return Ok(std::mem::take(items));
        }
        Err(self.invalid(index, "a list"))
    }

    fn string_list(&self, index: usize) -> Result<Vec<String>> {
        let Some(Value::Array(items)) = self.items.get(index) else {
            return Err(self.invalid(index, "a list of strings"));
        };
        items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(self.invalid(index, "a list of strings")),
            })
            .collect()
    }

    fn take(&mut self, index: usize) -> Value {
        self.items.get_mut(index).map(Value::take).unwrap_or(Value::Null)
    }
}
