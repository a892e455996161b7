use chrono::{DateTime, Utc};
use kubetrail_controller_core::{Actor, Mutation, Operation};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// The subset of a Kubernetes `audit.k8s.io/v1` Event that describes a
/// mutation.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(rename = "auditID", default)]
    pub audit_id: String,

    pub stage: Stage,

    pub verb: String,

    #[serde(default)]
    pub user: UserInfo,

    #[serde(rename = "sourceIPs", default)]
    pub source_ips: Vec<String>,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub object_ref: Option<ObjectRef>,

    #[serde(default)]
    pub response_status: Option<ResponseStatus>,

    #[serde(default)]
    pub request_object: Option<Value>,

    #[serde(default)]
    pub response_object: Option<Value>,

    #[serde(default)]
    pub request_received_timestamp: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
pub enum Stage {
    RequestReceived,
    ResponseStarted,
    ResponseComplete,
    Panic,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub resource: String,

    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub subresource: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResponseStatus {
    #[serde(default)]
    pub code: Option<u16>,
}

/// Why an entry does not describe a completed mutation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Skip {
    #[error("stage {0:?} is not ResponseComplete")]
    Stage(Stage),

    #[error("verb {0:?} does not mutate")]
    Verb(String),

    #[error("request failed with status {0}")]
    Failed(u16),

    #[error("entry has no object reference")]
    NoObject,
}

// === impl AuditEntry ===

impl AuditEntry {
    pub fn into_mutation(self) -> Result<Mutation, Skip> {
        if self.stage != Stage::ResponseComplete {
            return Err(Skip::Stage(self.stage));
        }

        let operation = match self.verb.as_str() {
            "create" => Operation::Create,
            "update" | "patch" => Operation::Update,
            "delete" | "deletecollection" => Operation::Delete,
            "connect" => Operation::Connect,
            verb => return Err(Skip::Verb(verb.to_string())),
        };

        if let Some(code) = self.response_status.and_then(|s| s.code) {
            if code >= 400 {
                return Err(Skip::Failed(code));
            }
        }

        let object_ref = self.object_ref.ok_or(Skip::NoObject)?;

        // A Status response describes the outcome, not the object.
        let response_object = self.response_object.filter(|o| !is_status(o));
        let object = response_object.or(self.request_object);

        let kind = object
            .as_ref()
            .and_then(|o| o.get("kind"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(object_ref.resource);
        let name = object_ref
            .name
            .or_else(|| metadata_str(object.as_ref(), "name"))
            .unwrap_or_default();
        let namespace = object_ref
            .namespace
            .or_else(|| metadata_str(object.as_ref(), "namespace"))
            .unwrap_or_default();

        Ok(Mutation {
            timestamp: self.request_received_timestamp,
            kind,
            namespace,
            name,
            operation,
            actor: Actor {
                username: self.user.username,
                groups: self.user.groups,
            },
            old_object: None,
            new_object: object,
            source_ip: self.source_ips.into_iter().next(),
            user_agent: self.user_agent,
        })
    }
}

fn is_status(object: &Value) -> bool {
    object.get("kind").and_then(Value::as_str) == Some("Status")
}

fn metadata_str(object: Option<&Value>, field: &str) -> Option<String> {
    object?
        .get("metadata")?
        .get(field)?
        .as_str()
        .map(str::to_string)
}

/// Splits a push body into entries. The body may be a single entry, an array
/// of entries, or an `EventList` as sent by the API server's webhook backend.
pub fn split_batch(body: &[u8]) -> serde_json::Result<Vec<Value>> {
    match serde_json::from_slice(body)? {
        Value::Array(entries) => Ok(entries),
        Value::Object(mut obj) => match obj.remove("items") {
            Some(Value::Array(entries)) => Ok(entries),
            Some(items) => {
                obj.insert("items".to_string(), items);
                Ok(vec![Value::Object(obj)])
            }
            None => Ok(vec![Value::Object(obj)]),
        },
        other => Ok(vec![other]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn mk_entry(value: Value) -> AuditEntry {
        serde_json::from_value(value).unwrap()
    }

    fn create_web() -> Value {
        json!({
            "kind": "Event",
            "apiVersion": "audit.k8s.io/v1",
            "level": "RequestResponse",
            "auditID": "0b1e",
            "stage": "ResponseComplete",
            "requestURI": "/apis/apps/v1/namespaces/prod/deployments",
            "verb": "create",
            "user": {"username": "alice", "groups": ["dev", "system:authenticated"]},
            "sourceIPs": ["10.0.0.7", "10.0.0.1"],
            "userAgent": "kubectl/v1.33.0",
            "objectRef": {
                "resource": "deployments",
                "namespace": "prod",
                "name": "web",
                "apiGroup": "apps",
                "apiVersion": "v1"
            },
            "responseStatus": {"metadata": {}, "code": 201},
            "requestObject": {"kind": "Deployment", "metadata": {"name": "web"}},
            "responseObject": {
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "prod", "uid": "u1"}
            },
            "requestReceivedTimestamp": "2024-05-01T12:00:00.123456Z",
            "stageTimestamp": "2024-05-01T12:00:00.223456Z"
        })
    }

    #[test]
    fn converts_create() {
        let m = mk_entry(create_web()).into_mutation().unwrap();
        assert_eq!(m.operation, Operation::Create);
        assert_eq!(m.kind, "Deployment");
        assert_eq!(m.namespace, "prod");
        assert_eq!(m.name, "web");
        assert_eq!(m.actor.username, "alice");
        assert_eq!(m.actor.groups, ["dev", "system:authenticated"]);
        assert_eq!(m.source_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(m.user_agent.as_deref(), Some("kubectl/v1.33.0"));
        assert_eq!(m.new_object.unwrap()["metadata"]["uid"], "u1");
        assert_eq!(m.old_object, None);
        assert_eq!(
            m.timestamp.unwrap().to_rfc3339(),
            "2024-05-01T12:00:00.123456+00:00"
        );
    }

    #[test]
    fn maps_verbs() {
        for (verb, op) in [
            ("update", Operation::Update),
            ("patch", Operation::Update),
            ("delete", Operation::Delete),
            ("deletecollection", Operation::Delete),
            ("connect", Operation::Connect),
        ] {
            let mut entry = create_web();
            entry["verb"] = json!(verb);
            assert_eq!(mk_entry(entry).into_mutation().unwrap().operation, op);
        }

        for verb in ["get", "list", "watch"] {
            let mut entry = create_web();
            entry["verb"] = json!(verb);
            assert_eq!(
                mk_entry(entry).into_mutation().unwrap_err(),
                Skip::Verb(verb.to_string())
            );
        }
    }

    #[test]
    fn skips_incomplete_and_failed() {
        let mut entry = create_web();
        entry["stage"] = json!("RequestReceived");
        assert_eq!(
            mk_entry(entry).into_mutation().unwrap_err(),
            Skip::Stage(Stage::RequestReceived)
        );

        let mut entry = create_web();
        entry["responseStatus"]["code"] = json!(409);
        assert_eq!(
            mk_entry(entry).into_mutation().unwrap_err(),
            Skip::Failed(409)
        );

        let mut entry = create_web();
        entry.as_object_mut().unwrap().remove("objectRef");
        assert_eq!(mk_entry(entry).into_mutation().unwrap_err(), Skip::NoObject);
    }

    #[test]
    fn falls_back_to_resource_without_objects() {
        let m = mk_entry(json!({
            "stage": "ResponseComplete",
            "verb": "delete",
            "user": {"username": "bob"},
            "objectRef": {"resource": "configmaps", "namespace": "kube-system", "name": "foo"},
            "responseObject": {"kind": "Status", "status": "Success"}
        }))
        .into_mutation()
        .unwrap();
        assert_eq!(m.kind, "configmaps");
        assert_eq!(m.namespace, "kube-system");
        assert_eq!(m.name, "foo");
        assert_eq!(m.new_object, None);
        assert_eq!(m.timestamp, None);
    }

    #[test]
    fn splits_batches() {
        let single = serde_json::to_vec(&create_web()).unwrap();
        assert_eq!(split_batch(&single).unwrap().len(), 1);

        let array = serde_json::to_vec(&json!([create_web(), create_web()])).unwrap();
        assert_eq!(split_batch(&array).unwrap().len(), 2);

        let list = serde_json::to_vec(&json!({
            "kind": "EventList",
            "apiVersion": "audit.k8s.io/v1",
            "items": [create_web(), {"bogus": true}, create_web()]
        }))
        .unwrap();
        assert_eq!(split_batch(&list).unwrap().len(), 3);

        assert!(split_batch(b"not json").is_err());
    }
}
