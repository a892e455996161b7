use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

/// The kind of mutation applied to a resource.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Connect,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown operation: {0}")]
pub struct UnknownOperation(pub String);

/// The user that issued a mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub username: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Allowed,
    Blocked,
}

/// The identity fields that policy and alert rules are evaluated against.
pub trait Subject {
    fn kind(&self) -> &str;
    fn namespace(&self) -> &str;
    fn name(&self) -> &str;
    fn operation(&self) -> Operation;
}

/// A mutation observed by the admission webhook or read from an audit log,
/// before any policy has been applied to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    /// When the mutation was received. Defaults to the time the event is built.
    pub timestamp: Option<DateTime<Utc>>,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub operation: Operation,
    pub actor: Actor,
    pub old_object: Option<Value>,
    pub new_object: Option<Value>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// An immutable record of one resource mutation.
///
/// `patch` is only set when both the old and new objects are known. Create
/// events never carry an old object and Delete events never carry a new one.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub resource_kind: String,
    pub namespace: String,
    pub name: String,
    pub operation: Operation,
    pub actor: Actor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_object: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<json_patch::Patch>,

    #[serde(rename = "sourceIP", default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    pub decision: Decision,
}

// === impl Operation ===

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Connect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Connect => "Connect",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

// === impl Mutation ===

impl Subject for Mutation {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn operation(&self) -> Operation {
        self.operation
    }
}

// === impl ChangeEvent ===

impl ChangeEvent {
    pub fn new(mutation: Mutation, decision: Decision) -> Self {
        let Mutation {
            timestamp,
            kind,
            namespace,
            name,
            operation,
            actor,
            mut old_object,
            mut new_object,
            source_ip,
            user_agent,
        } = mutation;

        match operation {
            Operation::Create => old_object = None,
            Operation::Delete => new_object = None,
            Operation::Update | Operation::Connect => {}
        }

        let patch = match (&old_object, &new_object) {
            (Some(old), Some(new)) => Some(json_patch::diff(old, new)),
            _ => None,
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: timestamp.unwrap_or_else(Utc::now),
            resource_kind: kind,
            namespace,
            name,
            operation,
            actor,
            old_object,
            new_object,
            patch,
            source_ip,
            user_agent,
            decision,
        }
    }
}

impl Subject for ChangeEvent {
    fn kind(&self) -> &str {
        &self.resource_kind
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn operation(&self) -> Operation {
        self.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mk_mutation(op: Operation, old: Option<Value>, new: Option<Value>) -> Mutation {
        Mutation {
            timestamp: None,
            kind: "Deployment".to_string(),
            namespace: "prod".to_string(),
            name: "web".to_string(),
            operation: op,
            actor: Actor {
                username: "alice".to_string(),
                groups: vec!["system:authenticated".to_string()],
            },
            old_object: old,
            new_object: new,
            source_ip: None,
            user_agent: None,
        }
    }

    #[test]
    fn operation_names_are_case_sensitive() {
        assert_eq!("Delete".parse::<Operation>(), Ok(Operation::Delete));
        assert_eq!(
            "DELETE".parse::<Operation>(),
            Err(UnknownOperation("DELETE".to_string()))
        );
        for op in Operation::ALL {
            assert_eq!(op.to_string().parse::<Operation>(), Ok(op));
        }
    }

    #[test]
    fn create_has_no_patch() {
        let ev = ChangeEvent::new(
            mk_mutation(
                Operation::Create,
                Some(json!({"stale": true})),
                Some(json!({"spec": {"replicas": 1}})),
            ),
            Decision::Allowed,
        );
        assert!(ev.old_object.is_none());
        assert!(ev.new_object.is_some());
        assert!(ev.patch.is_none());
    }

    #[test]
    fn delete_drops_new_object() {
        let ev = ChangeEvent::new(
            mk_mutation(
                Operation::Delete,
                Some(json!({"spec": {"replicas": 1}})),
                Some(json!({"kind": "Status"})),
            ),
            Decision::Allowed,
        );
        assert!(ev.new_object.is_none());
        assert!(ev.patch.is_none());
    }

    #[test]
    fn update_patch_reproduces_new_object() {
        let pairs = [
            (json!({}), json!({})),
            (
                json!({"spec": {"replicas": 1, "paused": true}}),
                json!({"spec": {"replicas": 3}}),
            ),
            (
                json!({"metadata": {"labels": {"a/b": "1", "c~d": "2"}}}),
                json!({"metadata": {"labels": {"a/b": "2"}, "annotations": {"x": "y"}}}),
            ),
            (
                json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}}),
                json!({"spec": {"containers": [{"name": "b", "image": "nginx"}]}}),
            ),
            (json!({"data": null}), json!({"data": [1, 2, {"nested": [true]}]})),
        ];

        for (old, new) in pairs {
            let ev = ChangeEvent::new(
                mk_mutation(Operation::Update, Some(old.clone()), Some(new.clone())),
                Decision::Allowed,
            );
            let patch = ev.patch.expect("update must carry a patch");
            let mut doc = old;
            json_patch::patch(&mut doc, &patch.0).expect("patch must apply");
            assert_eq!(doc, new);
        }
    }

    #[test]
    fn serializes_camel_case() {
        let ev = ChangeEvent::new(
            mk_mutation(Operation::Update, Some(json!({"a": 1})), Some(json!({"a": 2}))),
            Decision::Allowed,
        );
        let value = serde_json::to_value(&ev).unwrap();
        assert_eq!(value["resourceKind"], "Deployment");
        assert_eq!(value["operation"], "Update");
        assert_eq!(value["decision"], "Allowed");
        assert_eq!(value["actor"]["username"], "alice");
        assert_eq!(value["patch"][0]["op"], "replace");

        let decoded: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.id, ev.id);
    }
}
