use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A named operation set a connector may implement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Generic items: list/get/create/update/delete/search
    Data,
    /// Channels and messages
    Communication,
    /// Projects and issues
    Project,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Data => "data",
            Capability::Communication => "communication",
            Capability::Project => "project",
        };
        f.write_str(name)
    }
}

pub type CapabilitySet = BTreeSet<Capability>;

/// Paging and provider-specific query parameters for list operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Passed through to the provider as query parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Filter {
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// One page of provider items.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
    pub total: Option<u64>,
}

impl Page {
    pub fn of(items: Vec<Value>) -> Self {
        let total = Some(items.len() as u64);
        Self {
            items,
            next_cursor: None,
            total,
        }
    }
}

/// Body of a mutating operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub body: Value,
    /// Forwarded to providers that deduplicate retried mutations
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl Payload {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Issue statistics for one project.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProjectSummary {
    pub project: Value,
    pub total_issues: usize,
    pub open_issues: usize,
    pub closed_issues: usize,
    /// Percentage of closed issues, 0 when the project has none
    pub completion_rate: f64,
}

/// An operation together with its arguments. Each belongs to exactly one capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    List {
        #[serde(default)]
        filter: Filter,
    },
    Get { id: String },
    Create { payload: Payload },
    Update { id: String, payload: Payload },
    Delete { id: String },
    Search {
        query: String,
        #[serde(default)]
        filter: Filter,
    },

    ListChannels,
    GetChannel { channel_id: String },
    ListMessages {
        channel_id: String,
        #[serde(default)]
        filter: Filter,
    },
    SendMessage { channel_id: String, payload: Payload },
    GetMessage { message_id: String },
    SearchMessages { query: String },

    ListProjects,
    GetProject { project_id: String },
    ListIssues {
        project_id: String,
        #[serde(default)]
        filter: Filter,
    },
    CreateIssue { project_id: String, payload: Payload },
    GetIssue { issue_id: String },
    UpdateIssue { issue_id: String, payload: Payload },
    ProjectSummary { project_id: String },
}

impl Operation {
    pub fn capability(&self) -> Capability {
        match self {
            Operation::List { .. }
            | Operation::Get { .. }
            | Operation::Create { .. }
            | Operation::Update { .. }
            | Operation::Delete { .. }
            | Operation::Search { .. } => Capability::Data,
            Operation::ListChannels
            | Operation::GetChannel { .. }
            | Operation::ListMessages { .. }
            | Operation::SendMessage { .. }
            | Operation::GetMessage { .. }
            | Operation::SearchMessages { .. } => Capability::Communication,
            Operation::ListProjects
            | Operation::GetProject { .. }
            | Operation::ListIssues { .. }
            | Operation::CreateIssue { .. }
            | Operation::GetIssue { .. }
            | Operation::UpdateIssue { .. }
            | Operation::ProjectSummary { .. } => Capability::Project,
        }
    }

    /// Read-only operations may be retried once on a transient provider error.
    /// Mutations never are.
    pub fn is_read_only(&self) -> bool {
        !matches!(
            self,
            Operation::Create { .. }
                | Operation::Update { .. }
                | Operation::Delete { .. }
                | Operation::SendMessage { .. }
                | Operation::CreateIssue { .. }
                | Operation::UpdateIssue { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::List { .. } => "list",
            Operation::Get { .. } => "get",
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Search { .. } => "search",
            Operation::ListChannels => "list_channels",
            Operation::GetChannel { .. } => "get_channel",
            Operation::ListMessages { .. } => "list_messages",
            Operation::SendMessage { .. } => "send_message",
            Operation::GetMessage { .. } => "get_message",
            Operation::SearchMessages { .. } => "search_messages",
            Operation::ListProjects => "list_projects",
            Operation::GetProject { .. } => "get_project",
            Operation::ListIssues { .. } => "list_issues",
            Operation::CreateIssue { .. } => "create_issue",
            Operation::GetIssue { .. } => "get_issue",
            Operation::UpdateIssue { .. } => "update_issue",
            Operation::ProjectSummary { .. } => "project_summary",
        }
    }
}

/// Normalized result of an operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Page(Page),
    Item(Value),
    Deleted,
    Summary(ProjectSummary),
}

impl OperationOutput {
    pub fn into_page(self) -> Option<Page> {
        match self {
            OperationOutput::Page(page) => Some(page),
            _ => None,
        }
    }

    pub fn into_item(self) -> Option<Value> {
        match self {
            OperationOutput::Item(item) => Some(item),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutations_are_not_read_only() {
        let payload = Payload::new(json!({"title": "x"}));
        assert!(!Operation::Create { payload: payload.clone() }.is_read_only());
        assert!(!Operation::SendMessage {
            channel_id: "c1".to_string(),
            payload: payload.clone()
        }
        .is_read_only());
        assert!(!Operation::Delete { id: "1".to_string() }.is_read_only());
        assert!(!Operation::UpdateIssue {
            issue_id: "PROJ-1".to_string(),
            payload: payload.clone()
        }
        .is_read_only());
        assert!(Operation::GetIssue { issue_id: "PROJ-1".to_string() }.is_read_only());
        assert!(Operation::GetMessage { message_id: "m1".to_string() }.is_read_only());

        assert!(Operation::Search {
            query: "q".to_string(),
            filter: Filter::default()
        }
        .is_read_only());
        assert!(Operation::SearchMessages { query: "q".to_string() }.is_read_only());
        assert!(Operation::ProjectSummary { project_id: "p".to_string() }.is_read_only());
    }

    #[test]
    fn test_capability_of_operation() {
        assert_eq!(Operation::Get { id: "1".to_string() }.capability(), Capability::Data);
        assert_eq!(Operation::ListChannels.capability(), Capability::Communication);
        assert_eq!(
            Operation::CreateIssue {
                project_id: "p".to_string(),
                payload: Payload::default()
            }
            .capability(),
            Capability::Project
        );
    }

    #[test]
    fn test_operation_deserialization() {
        let op: Operation = serde_json::from_value(json!({
            "op": "create_issue",
            "project_id": "PROJ",
            "payload": {"body": {"summary": "Broken"}, "idempotency_key": "k-1"}
        }))
        .unwrap();
        assert_eq!(op.name(), "create_issue");
        match op {
            Operation::CreateIssue { payload, .. } => {
                assert_eq!(payload.idempotency_key.as_deref(), Some("k-1"))
            }
            other => panic!("unexpected operation {:?}", other),
        }

        let op: Operation = serde_json::from_value(json!({"op": "list_channels"})).unwrap();
        assert_eq!(op, Operation::ListChannels);
    }
}
