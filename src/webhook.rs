//! Webhook payload normalization
//!
//! GitLab (and GitHub-style) hooks deliver several body shapes. They are all
//! folded into one [`WebhookEvent`] so the filters and command templates never
//! have to care which platform sent the request.

use serde::Serialize;
use serde_json::Value;

/// Unified representation of one inbound webhook body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    #[serde(flatten)]
    pub data: EventData,
    /// The raw body, kept for template lookups the normalized shape lacks.
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    Push(PushData),
    Issue(ObjectData),
    MergeRequest(ObjectData),
    Unknown(UnknownData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Issue,
    MergeRequest,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Issue => "issue",
            EventKind::MergeRequest => "merge_request",
            EventKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefEntity {
    Tag,
    Branch,
    Unknown,
}

impl PushAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushAction::Create => "create",
            PushAction::Update => "update",
            PushAction::Delete => "delete",
        }
    }
}

impl RefEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefEntity::Tag => "tag",
            RefEntity::Branch => "branch",
            RefEntity::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushData {
    pub action: PushAction,
    pub entity: RefEntity,
    /// `"{action}-{entity}"`, e.g. `create-tag`
    pub event: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
    /// Commit the ref points at after the push; `None` once the ref is deleted.
    pub treeish: Option<String>,
    pub user_id: Value,
}

/// Issue and merge request hooks share this shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectData {
    pub object: Value,
    pub state: Value,
    pub user_id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownData {
    pub object: Value,
}

impl WebhookEvent {
    pub fn kind(&self) -> EventKind {
        match self.data {
            EventData::Push(_) => EventKind::Push,
            EventData::Issue(_) => EventKind::Issue,
            EventData::MergeRequest(_) => EventKind::MergeRequest,
            EventData::Unknown(_) => EventKind::Unknown,
        }
    }

    pub fn push(&self) -> Option<&PushData> {
        match &self.data {
            EventData::Push(push) => Some(push),
            _ => None,
        }
    }

    /// Short ref name (branch or tag) for push events.
    pub fn ref_name(&self) -> Option<&str> {
        self.push().and_then(|p| p.ref_name.as_deref())
    }
}

/// A `refs/<namespace>/<name>` path split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefName {
    Branch(String),
    Tag(String),
    Other,
}

impl RefName {
    pub fn short_name(&self) -> Option<&str> {
        match self {
            RefName::Branch(name) | RefName::Tag(name) => Some(name),
            RefName::Other => None,
        }
    }
}

/// Parse a git ref path. Everything after the namespace segment is the name,
/// so `refs/heads/feature/login` is the branch `feature/login`.
pub fn parse_ref(reference: &str) -> RefName {
    let segments: Vec<&str> = reference.split('/').collect();
    if segments.len() < 3 {
        return RefName::Other;
    }
    let name = segments[2..].join("/");
    if name.is_empty() {
        return RefName::Other;
    }
    match segments[1] {
        "heads" => RefName::Branch(name),
        "tags" => RefName::Tag(name),
        _ => RefName::Other,
    }
}

/// Returns true for the all-zero commit id GitLab sends on ref creation and
/// deletion. A missing field is not the sentinel.
fn is_empty_commit(value: Option<&Value>) -> bool {
    match value {
        None => false,
        Some(Value::Null) => true,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.trim().chars().all(|c| c == '0'),
        Some(_) => false,
    }
}

fn is_present(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
}

fn commit_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Normalize a raw webhook body. Never fails: unrecognized shapes become
/// [`EventKind::Unknown`] carrying the body verbatim.
pub fn normalize(body: &Value) -> WebhookEvent {
    let data = match body.get("object_kind").and_then(Value::as_str) {
        Some(kind @ ("issue" | "merge_request")) => {
            let object = body.get("object_attributes").cloned().unwrap_or(Value::Null);
            let data = ObjectData {
                state: object.get("state").cloned().unwrap_or(Value::Null),
                user_id: object.get("author_id").cloned().unwrap_or(Value::Null),
                object,
            };
            if kind == "issue" {
                EventData::Issue(data)
            } else {
                EventData::MergeRequest(data)
            }
        }
        _ => match body.get("ref").and_then(Value::as_str) {
            Some(reference) if !reference.is_empty() && is_present(body.get("repository")) => {
                EventData::Push(normalize_push(body, reference))
            }
            _ => EventData::Unknown(UnknownData {
                object: body.clone(),
            }),
        },
    };

    WebhookEvent {
        data,
        payload: body.clone(),
    }
}

fn normalize_push(body: &Value, reference: &str) -> PushData {
    let before_empty = is_empty_commit(body.get("before"));
    let after_empty = is_empty_commit(body.get("after"));

    // Both sentinels at once should not happen; treat it as a deletion.
    let action = if after_empty {
        PushAction::Delete
    } else if before_empty {
        PushAction::Create
    } else {
        PushAction::Update
    };

    let (entity, branch, tag) = match parse_ref(reference) {
        RefName::Branch(name) => (RefEntity::Branch, Some(name), None),
        RefName::Tag(name) => (RefEntity::Tag, None, Some(name)),
        RefName::Other => (RefEntity::Unknown, None, None),
    };

    let event = format!("{}-{}", action.as_str(), entity.as_str());

    PushData {
        action,
        entity,
        event,
        ref_name: branch.clone().or_else(|| tag.clone()),
        branch,
        tag,
        treeish: if after_empty {
            None
        } else {
            commit_id(body.get("after"))
        },
        user_id: body.get("user_id").cloned().unwrap_or(Value::Null),
    }
}
