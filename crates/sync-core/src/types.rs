//! Operation model shared by the queue, the store and the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier of a queued operation.
///
/// The same string is used in memory, in the durable store and as the
/// correlation id on the persistent channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one running client instance sharing the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the operation does to its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Application-defined operation, identified by name.
    Custom(String),
}

/// How the operation reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// One HTTP request, one response.
    RequestResponse,
    /// Sent over the always-open channel, reply correlated by operation id.
    PersistentChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Lifecycle of an operation inside the queue.
///
/// ```text
/// Created ──► Claimed ──► Dispatching ──► Resolved
///    ▲                        │
///    │                        ├──► Retrying ──(deadline)──► eligible again
///    └──── (auth/deferred) ───┤
///                             └──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Claimed,
    Dispatching,
    Resolved,
    Retrying,
    Aborted,
}

impl OperationState {
    /// Returns true once the operation has left the queue for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Resolved | OperationState::Aborted)
    }
}

/// An operation as submitted by the entity layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Entity the operation acts on, if any.
    pub target: Option<String>,
    /// Operations that must resolve before this one may dispatch.
    #[serde(default)]
    pub depends: Vec<OperationId>,
    pub kind: OperationKind,
    pub transport: TransportKind,
    pub method: HttpMethod,
    /// Relative to the service base URL, or absolute.
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl OperationDescriptor {
    /// A request/response operation with no target, dependencies or headers.
    pub fn request(kind: OperationKind, method: HttpMethod, endpoint: impl Into<String>) -> Self {
        Self {
            target: None,
            depends: Vec::new(),
            kind,
            transport: TransportKind::RequestResponse,
            method,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn depends_on(mut self, id: OperationId) -> Self {
        self.depends.push(id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn over(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

/// A pending mutation destined for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub target: Option<String>,
    #[serde(default)]
    pub depends: Vec<OperationId>,
    pub kind: OperationKind,
    pub transport: TransportKind,
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Insertion counter; breaks ties between equal `created_at` values.
    pub sequence: u64,
    pub owner_instance_id: InstanceId,
    /// Transient failures consumed so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl Operation {
    /// Materializes a descriptor into an owned operation.
    pub fn from_descriptor(
        descriptor: OperationDescriptor,
        owner: InstanceId,
        created_at: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            id: OperationId::new(),
            target: descriptor.target,
            depends: descriptor.depends,
            kind: descriptor.kind,
            transport: descriptor.transport,
            method: descriptor.method,
            endpoint: descriptor.endpoint,
            headers: descriptor.headers,
            payload: descriptor.payload,
            created_at,
            sequence,
            owner_instance_id: owner,
            retry_count: 0,
        }
    }

    /// Durable ordering key: creation time, then insertion order.
    pub fn order_key(&self) -> (i64, u64) {
        (self.created_at.timestamp_millis(), self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn operation_ids_are_unique_and_transparent() {
        let a = OperationId::new();
        let b = OperationId::new();
        assert_ne!(a, b);

        let json = serde_json::to_string(&OperationId::from_string("op-1")).unwrap();
        assert_eq!(json, "\"op-1\"");
    }

    #[test]
    fn operation_kind_serializes_custom_name() {
        let json = serde_json::to_value(OperationKind::Custom("mark_read".into())).unwrap();
        assert_eq!(json["kind"], "custom");
        assert_eq!(json["name"], "mark_read");

        let back: OperationKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, OperationKind::Custom("mark_read".into()));
    }

    #[test]
    fn order_key_breaks_timestamp_ties_by_sequence() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let owner = InstanceId::from_string("tab-1");
        let desc = OperationDescriptor::request(OperationKind::Create, HttpMethod::Post, "x");

        let first = Operation::from_descriptor(desc.clone(), owner.clone(), at, 1);
        let second = Operation::from_descriptor(desc, owner, at, 2);

        assert!(first.order_key() < second.order_key());
    }

    #[test]
    fn descriptor_builder_collects_dependencies() {
        let parent = OperationId::from_string("create-conversation-1");
        let desc = OperationDescriptor::request(
            OperationKind::Create,
            HttpMethod::Post,
            "conversations/1/messages",
        )
        .with_target("message-1")
        .depends_on(parent.clone())
        .over(TransportKind::PersistentChannel);

        assert_eq!(desc.depends, vec![parent]);
        assert_eq!(desc.target.as_deref(), Some("message-1"));
        assert_eq!(desc.transport, TransportKind::PersistentChannel);
    }

    #[test]
    fn terminal_states() {
        assert!(OperationState::Resolved.is_terminal());
        assert!(OperationState::Aborted.is_terminal());
        assert!(!OperationState::Retrying.is_terminal());
        assert!(!OperationState::Dispatching.is_terminal());
    }
}
