//! Operation dispatcher - the single entry point for provider operations.
//!
//! `invoke(account, provider, operation)`:
//! 1. Resolve the provider and check the operation's capability
//! 2. Obtain a valid token from the lifecycle manager (may refresh)
//! 3. Check the token's granted scopes against the operation
//! 4. Call the connector with a timeout; retry reads once on transient errors
//! 5. Normalize provider errors into [`DispatchError`]

use crate::connector::{CommunicationConnector, DataConnector, ProjectConnector};
use crate::error::{DispatchError, ProviderError};
use crate::registry::ConnectorRegistry;
use crate::types::{Capability, Operation, OperationOutput};
use crate::Connector;
use std::sync::Arc;
use tokenhub::config::DispatchConfig;
use tokenhub::credentials::AccessToken;
use tokenhub::lifecycle::TokenLifecycleManager;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct OperationDispatcher {
    tokens: Arc<TokenLifecycleManager>,
    registry: Arc<ConnectorRegistry>,
    config: DispatchConfig,
}

impl OperationDispatcher {
    pub fn new(
        tokens: Arc<TokenLifecycleManager>,
        registry: Arc<ConnectorRegistry>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            tokens,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn tokens(&self) -> &TokenLifecycleManager {
        &self.tokens
    }

    /// Runs `operation` against `provider` on behalf of `account_id`.
    ///
    /// Token errors are returned unchanged: the lifecycle manager has already
    /// retried what can be retried.
    pub async fn invoke(
        &self,
        account_id: &str,
        provider: &str,
        operation: Operation,
    ) -> Result<OperationOutput, DispatchError> {
        let request_id = Uuid::new_v4();
        let capability = operation.capability();

        let descriptor = self
            .registry
            .descriptor(provider)
            .ok_or_else(|| DispatchError::UnknownProvider(provider.to_string()))?;
        if !descriptor.supports(capability) {
            return Err(DispatchError::CapabilityNotSupported {
                provider: provider.to_string(),
                capability,
            });
        }

        let token = self.tokens.get_valid_token(account_id, provider).await?;

        let connector = descriptor.construct(account_id);
        let target = Target::resolve(connector.as_ref(), capability).ok_or_else(|| {
            DispatchError::CapabilityNotSupported {
                provider: provider.to_string(),
                capability,
            }
        })?;

        let required = connector.required_scopes(&operation);
        let missing = token.missing_scopes(required.iter().map(String::as_str));
        if !missing.is_empty() {
            info!(
                %request_id,
                %account_id,
                %provider,
                operation = operation.name(),
                missing = ?missing,
                "Operation needs scopes that were not granted"
            );
            return Err(DispatchError::AuthenticationRequired {
                account_id: account_id.to_string(),
                provider: provider.to_string(),
                reason: format!("missing scopes: {}", missing.join(", ")),
            });
        }

        let max_attempts = if operation.is_read_only() {
            1 + self.config.read_retries
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.config.data_timeout(),
                target.execute(&token, &operation),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::transient(format!(
                    "no response within {}s",
                    self.config.data_timeout_seconds
                ))),
            };

            match outcome {
                Ok(output) => {
                    debug!(
                        %request_id,
                        %account_id,
                        %provider,
                        operation = operation.name(),
                        attempt,
                        "Operation completed"
                    );
                    return Ok(output);
                }
                Err(ProviderError::Transient {
                    message,
                    retry_after,
                }) if attempt < max_attempts => {
                    let delay = self.config.retry_delay(retry_after);
                    warn!(
                        %request_id,
                        %account_id,
                        %provider,
                        operation = operation.name(),
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient provider error, retrying read"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        %request_id,
                        %account_id,
                        %provider,
                        operation = operation.name(),
                        attempt,
                        error = %e,
                        "Operation failed"
                    );
                    return Err(DispatchError::from_provider(account_id, provider, e));
                }
            }
        }
    }
}

/// The capability interface an operation runs against.
enum Target<'a> {
    Data(&'a dyn DataConnector),
    Communication(&'a dyn CommunicationConnector),
    Project(&'a dyn ProjectConnector),
}

impl<'a> Target<'a> {
    fn resolve(connector: &'a dyn Connector, capability: Capability) -> Option<Self> {
        match capability {
            Capability::Data => connector.as_data().map(Target::Data),
            Capability::Communication => connector.as_communication().map(Target::Communication),
            Capability::Project => connector.as_project().map(Target::Project),
        }
    }

    async fn execute(
        &self,
        token: &AccessToken,
        operation: &Operation,
    ) -> Result<OperationOutput, ProviderError> {
        use OperationOutput::{Deleted, Item, Page, Summary};

        match (self, operation) {
            (Target::Data(c), Operation::List { filter }) => c.list(token, filter).await.map(Page),
            (Target::Data(c), Operation::Get { id }) => c.get(token, id).await.map(Item),
            (Target::Data(c), Operation::Create { payload }) => {
                c.create(token, payload).await.map(Item)
            }
            (Target::Data(c), Operation::Update { id, payload }) => {
                c.update(token, id, payload).await.map(Item)
            }
            (Target::Data(c), Operation::Delete { id }) => {
                c.delete(token, id).await.map(|()| Deleted)
            }
            (Target::Data(c), Operation::Search { query, filter }) => {
                c.search(token, query, filter).await.map(Page)
            }

            (Target::Communication(c), Operation::ListChannels) => {
                c.list_channels(token).await.map(Page)
            }
            (Target::Communication(c), Operation::GetChannel { channel_id }) => {
                c.get_channel(token, channel_id).await.map(Item)
            }
            (Target::Communication(c), Operation::ListMessages { channel_id, filter }) => {
                c.list_messages(token, channel_id, filter).await.map(Page)
            }
            (Target::Communication(c), Operation::SendMessage { channel_id, payload }) => {
                c.send_message(token, channel_id, payload).await.map(Item)
            }
            (Target::Communication(c), Operation::GetMessage { message_id }) => {
                c.get_message(token, message_id).await.map(Item)
            }
            (Target::Communication(c), Operation::SearchMessages { query }) => {
                c.search_messages(token, query).await.map(Page)
            }

            (Target::Project(c), Operation::ListProjects) => c.list_projects(token).await.map(Page),
            (Target::Project(c), Operation::GetProject { project_id }) => {
                c.get_project(token, project_id).await.map(Item)
            }
            (Target::Project(c), Operation::ListIssues { project_id, filter }) => {
                c.list_issues(token, project_id, filter).await.map(Page)
            }
            (Target::Project(c), Operation::CreateIssue { project_id, payload }) => {
                c.create_issue(token, project_id, payload).await.map(Item)
            }
            (Target::Project(c), Operation::GetIssue { issue_id }) => {
                c.get_issue(token, issue_id).await.map(Item)
            }
            (Target::Project(c), Operation::UpdateIssue { issue_id, payload }) => {
                c.update_issue(token, issue_id, payload).await.map(Item)
            }
            (Target::Project(c), Operation::ProjectSummary { project_id }) => {
                c.project_summary(token, project_id).await.map(Summary)
            }

            (_, operation) => Err(ProviderError::permanent(format!(
                "{} is not a {} operation",
                operation.name(),
                self.capability()
            ))),
        }
    }

    fn capability(&self) -> Capability {
        match self {
            Target::Data(_) => Capability::Data,
            Target::Communication(_) => Capability::Communication,
            Target::Project(_) => Capability::Project,
        }
    }
}
