use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Fill {
    Grey,
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Dot,
    Ring,
}

/// Operator-visible state of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub severity: Severity,
    pub fill: Fill,
    pub shape: Shape,
    pub text: String,
}

impl NodeStatus {
    fn new(severity: Severity, fill: Fill, shape: Shape, text: impl Into<String>) -> Self {
        Self {
            severity,
            fill,
            shape,
            text: text.into(),
        }
    }

    pub fn connecting() -> Self {
        Self::new(Severity::Info, Fill::Grey, Shape::Ring, "connecting")
    }

    pub fn connected() -> Self {
        Self::new(Severity::Info, Fill::Green, Shape::Dot, "connected")
    }

    pub fn ok() -> Self {
        Self::new(Severity::Info, Fill::Green, Shape::Dot, "ok")
    }

    /// Green status echoing a value that just went to or came from the device.
    pub fn value(text: impl Into<String>) -> Self {
        Self::new(Severity::Info, Fill::Green, Shape::Dot, text)
    }

    pub fn not_connected() -> Self {
        Self::new(Severity::Warn, Fill::Red, Shape::Ring, "not connected")
    }

    /// A write that arrived before the pin was configured.
    pub fn unconfigured(value: impl AsRef<str>) -> Self {
        Self::new(
            Severity::Warn,
            Fill::Grey,
            Shape::Ring,
            format!("N/C: {}", value.as_ref()),
        )
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(Severity::Error, Fill::Red, Shape::Ring, text)
    }

    /// Persistent warning for a node that was never started.
    pub fn misconfigured(text: impl Into<String>) -> Self {
        Self::new(Severity::Warn, Fill::Red, Shape::Dot, text)
    }

    pub fn closed() -> Self {
        Self::new(Severity::Info, Fill::Grey, Shape::Ring, "closed")
    }
}

/// A value forwarded to the host from an input pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEvent {
    pub topic: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl OutboundEvent {
    pub fn now(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            ts: OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .ok(),
        }
    }
}

/// Everything a node reports to its host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum NodeSignal {
    Status { node: String, status: NodeStatus },
    Event {
        node: String,
        #[serde(flatten)]
        event: OutboundEvent,
    },
    Error { node: String, message: String },
    Warn { node: String, message: String },
}

impl NodeSignal {
    pub fn node(&self) -> &str {
        match self {
            NodeSignal::Status { node, .. }
            | NodeSignal::Event { node, .. }
            | NodeSignal::Error { node, .. }
            | NodeSignal::Warn { node, .. } => node,
        }
    }
}

pub type SignalSink = mpsc::UnboundedSender<NodeSignal>;

/// Sends signals on behalf of one node. A host that stopped listening is
/// not an error for the node.
#[derive(Debug, Clone)]
pub struct Reporter {
    node: String,
    sink: SignalSink,
}

impl Reporter {
    pub fn new(node: impl Into<String>, sink: SignalSink) -> Self {
        Self {
            node: node.into(),
            sink,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn status(&self, status: NodeStatus) {
        let _ = self.sink.send(NodeSignal::Status {
            node: self.node.clone(),
            status,
        });
    }

    pub fn event(&self, event: OutboundEvent) {
        let _ = self.sink.send(NodeSignal::Event {
            node: self.node.clone(),
            event,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.sink.send(NodeSignal::Error {
            node: self.node.clone(),
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let _ = self.sink.send(NodeSignal::Warn {
            node: self.node.clone(),
            message: message.into(),
        });
    }
}
