//! Logical message types carried by the cosim wire protocol.

use serde_json::{Map, Value};

/// Correlates a Request with its eventual Success/Failure.
pub type MessageId = u64;

/// First element of every wire payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request = 0,
    Success = 1,
    Failure = 2,
}

impl MessageType {
    /// Parses the numeric wire tag.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Request),
            1 => Some(Self::Success),
            2 => Some(Self::Failure),
            _ => None,
        }
    }

    /// Returns the numeric wire tag.
    pub fn tag(self) -> u64 {
        self as u64
    }
}

/// A remote method invocation: `[method, args, kwargs]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Method name (e.g. `"step"`, `"set_data"`)
    pub method: String,

    /// Positional arguments
    pub args: Vec<Value>,

    /// Keyword arguments
    pub kwargs: Map<String, Value>,
}

impl Call {
    /// Creates a call with positional arguments only.
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs: Map::new(),
        }
    }

    /// Attaches keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Returns the positional argument at `idx`, or `Null` when absent.
    pub fn arg(&self, idx: usize) -> Value {
        self.args.get(idx).cloned().unwrap_or(Value::Null)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request { id: MessageId, call: Call },
    Success { id: MessageId, value: Value },
    Failure { id: MessageId, error: String },
}

impl Message {
    /// Returns the message id.
    pub fn id(&self) -> MessageId {
        match self {
            Message::Request { id, .. } | Message::Success { id, .. } | Message::Failure { id, .. } => *id,
        }
    }

    /// Returns the message type.
    pub fn kind(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::Success { .. } => MessageType::Success,
            Message::Failure { .. } => MessageType::Failure,
        }
    }
}
