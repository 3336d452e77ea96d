use crate::error::ProviderError;
use crate::types::{Capability, CapabilitySet, Filter, Operation, Page, Payload, ProjectSummary};
use async_trait::async_trait;
use serde_json::Value;
use tokenhub::credentials::AccessToken;

/// A provider connector bound to one account.
///
/// A connector declares which capability interfaces it satisfies through the
/// `as_*` accessors; the dispatcher checks the capability before calling into it.
/// Connectors must not hold on to the [`AccessToken`] between calls: every call
/// receives a freshly validated one.
///
/// # Example
/// ```no_run
/// use connector_manager::{
///     Connector, DataConnector, Filter, Page, Payload, ProviderError,
/// };
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use tokenhub::credentials::AccessToken;
///
/// struct NotesConnector {
///     account_id: String,
/// }
///
/// impl Connector for NotesConnector {
///     fn provider(&self) -> &str {
///         "notes"
///     }
///
///     fn account_id(&self) -> &str {
///         &self.account_id
///     }
///
///     fn as_data(&self) -> Option<&dyn DataConnector> {
///         Some(self)
///     }
/// }
///
/// #[async_trait]
/// impl DataConnector for NotesConnector {
///     async fn list(&self, token: &AccessToken, filter: &Filter) -> Result<Page, ProviderError> {
///         // GET /notes with token.secret() as bearer
///         Ok(Page::default())
///     }
///     // ...
/// #   async fn get(&self, _: &AccessToken, _: &str) -> Result<Value, ProviderError> { unimplemented!() }
/// #   async fn create(&self, _: &AccessToken, _: &Payload) -> Result<Value, ProviderError> { unimplemented!() }
/// #   async fn update(&self, _: &AccessToken, _: &str, _: &Payload) -> Result<Value, ProviderError> { unimplemented!() }
/// #   async fn delete(&self, _: &AccessToken, _: &str) -> Result<(), ProviderError> { unimplemented!() }
/// #   async fn search(&self, _: &AccessToken, _: &str, _: &Filter) -> Result<Page, ProviderError> { unimplemented!() }
/// }
/// ```
pub trait Connector: Send + Sync {
    /// Provider identifier, e.g. "jira"
    fn provider(&self) -> &str;

    fn account_id(&self) -> &str;

    fn as_data(&self) -> Option<&dyn DataConnector> {
        None
    }

    fn as_communication(&self) -> Option<&dyn CommunicationConnector> {
        None
    }

    fn as_project(&self) -> Option<&dyn ProjectConnector> {
        None
    }

    /// OAuth scopes the operation needs. An operation whose scopes were not
    /// granted fails with `AuthenticationRequired` before reaching the provider.
    fn required_scopes(&self, _operation: &Operation) -> Vec<String> {
        Vec::new()
    }

    /// Capabilities this instance actually implements.
    fn capabilities(&self) -> CapabilitySet {
        let mut capabilities = CapabilitySet::new();
        if self.as_data().is_some() {
            capabilities.insert(Capability::Data);
        }
        if self.as_communication().is_some() {
            capabilities.insert(Capability::Communication);
        }
        if self.as_project().is_some() {
            capabilities.insert(Capability::Project);
        }
        capabilities
    }
}

/// Generic item storage: files, documents, records.
#[async_trait]
pub trait DataConnector: Send + Sync {
    async fn list(&self, token: &AccessToken, filter: &Filter) -> Result<Page, ProviderError>;

    async fn get(&self, token: &AccessToken, id: &str) -> Result<Value, ProviderError>;

    async fn create(&self, token: &AccessToken, payload: &Payload) -> Result<Value, ProviderError>;

    async fn update(
        &self,
        token: &AccessToken,
        id: &str,
        payload: &Payload,
    ) -> Result<Value, ProviderError>;

    async fn delete(&self, token: &AccessToken, id: &str) -> Result<(), ProviderError>;

    async fn search(
        &self,
        token: &AccessToken,
        query: &str,
        filter: &Filter,
    ) -> Result<Page, ProviderError>;
}

/// Channels and messages.
#[async_trait]
pub trait CommunicationConnector: Send + Sync {
    async fn list_channels(&self, token: &AccessToken) -> Result<Page, ProviderError>;

    async fn get_channel(&self, token: &AccessToken, channel_id: &str) -> Result<Value, ProviderError>;

    async fn list_messages(
        &self,
        token: &AccessToken,
        channel_id: &str,
        filter: &Filter,
    ) -> Result<Page, ProviderError>;

    async fn send_message(
        &self,
        token: &AccessToken,
        channel_id: &str,
        payload: &Payload,
    ) -> Result<Value, ProviderError>;

    async fn get_message(&self, token: &AccessToken, message_id: &str) -> Result<Value, ProviderError>;

    /// Searches message text across every channel, case-insensitively.
    ///
    /// Providers with a native search endpoint should override this; the default
    /// reads the first page of every channel.
    async fn search_messages(&self, token: &AccessToken, query: &str) -> Result<Page, ProviderError> {
        let needle = query.to_lowercase();
        let channels = self.list_channels(token).await?;

        let mut matches = Vec::new();
        for channel in &channels.items {
            let Some(channel_id) = channel.get("id").and_then(id_string) else {
                continue;
            };
            let messages = self
                .list_messages(token, &channel_id, &Filter::default())
                .await?;
            matches.extend(messages.items.into_iter().filter(|message| {
                message
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| text.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            }));
        }

        Ok(Page::of(matches))
    }
}

/// Projects and issues.
#[async_trait]
pub trait ProjectConnector: Send + Sync {
    async fn list_projects(&self, token: &AccessToken) -> Result<Page, ProviderError>;

    async fn get_project(&self, token: &AccessToken, project_id: &str) -> Result<Value, ProviderError>;

    async fn list_issues(
        &self,
        token: &AccessToken,
        project_id: &str,
        filter: &Filter,
    ) -> Result<Page, ProviderError>;

    async fn create_issue(
        &self,
        token: &AccessToken,
        project_id: &str,
        payload: &Payload,
    ) -> Result<Value, ProviderError>;

    async fn get_issue(&self, token: &AccessToken, issue_id: &str) -> Result<Value, ProviderError>;

    async fn update_issue(
        &self,
        token: &AccessToken,
        issue_id: &str,
        payload: &Payload,
    ) -> Result<Value, ProviderError>;

    /// Issue counts and completion rate. An issue is closed when its `status`
    /// field is `"closed"`.
    async fn project_summary(
        &self,
        token: &AccessToken,
        project_id: &str,
    ) -> Result<ProjectSummary, ProviderError> {
        let project = self.get_project(token, project_id).await?;
        let issues = self
            .list_issues(token, project_id, &Filter::default())
            .await?;

        let total_issues = issues.items.len();
        let closed_issues = issues
            .items
            .iter()
            .filter(|issue| issue.get("status").and_then(Value::as_str) == Some("closed"))
            .count();
        let completion_rate = if total_issues > 0 {
            closed_issues as f64 / total_issues as f64 * 100.0
        } else {
            0.0
        };

        Ok(ProjectSummary {
            project,
            total_issues,
            open_issues: total_issues - closed_issues,
            closed_issues,
            completion_rate,
        })
    }
}

/// Ids arrive as strings or numbers depending on the provider.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
