//! Generic JSON REST connector (Data capability).
//!
//! Maps the Data operations onto a single collection resource:
//!
//! | Operation | Request                                   |
//! |-----------|-------------------------------------------|
//! | list      | `GET {collection}?cursor=&limit=&...`     |
//! | get       | `GET {collection}/{id}`                   |
//! | create    | `POST {collection}`                       |
//! | update    | `PATCH {collection}/{id}`                 |
//! | delete    | `DELETE {collection}/{id}`                |
//! | search    | `GET {collection}?{search_param}={query}` |
//!
//! Where items and the next-page cursor live in a list response is configured
//! with JSON pointers.

use crate::connector::DataConnector;
use crate::error::ProviderError;
use crate::http::{check_response, classify_transport};
use crate::registry::ConnectorRegistry;
use crate::types::{Capability, Filter, Operation, Page, Payload};
use crate::Connector;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use std::sync::Arc;
use tokenhub::config::RestConnectorConfig;
use tokenhub::credentials::AccessToken;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct RestConnector {
    account_id: String,
    config: Arc<RestConnectorConfig>,
    http_client: Client,
}

impl RestConnector {
    pub fn new(account_id: impl Into<String>, config: Arc<RestConnectorConfig>, http_client: Client) -> Self {
        Self {
            account_id: account_id.into(),
            config,
            http_client,
        }
    }

    /// Registers a REST provider under `config.provider`.
    pub fn register(registry: &mut ConnectorRegistry, config: RestConnectorConfig) -> anyhow::Result<()> {
        // Fail at startup rather than on first call
        Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base_url for REST connector {}", config.provider))?;

        let http_client = Client::builder()
            .user_agent(concat!("tokenhub-connector/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let provider = config.provider.clone();
        let config = Arc::new(config);
        registry.register(provider, [Capability::Data], move |account_id: &str| -> Arc<dyn Connector> {
            Arc::new(RestConnector::new(
                account_id,
                Arc::clone(&config),
                http_client.clone(),
            ))
        });
        Ok(())
    }

    fn collection_url(&self) -> Result<Url, ProviderError> {
        let raw = format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.collection_path
        );
        Url::parse(&raw).map_err(|e| ProviderError::permanent(format!("invalid URL {}: {}", raw, e)))
    }

    fn item_url(&self, id: &str) -> Result<Url, ProviderError> {
        let mut url = self.collection_url()?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::permanent("base URL cannot carry a path"))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    fn paged(&self, request: RequestBuilder, filter: &Filter) -> RequestBuilder {
        let mut query: Vec<(&str, String)> = filter
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        if let Some(cursor) = &filter.cursor {
            query.push((self.config.cursor_param.as_str(), cursor.clone()));
        }
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        request.query(&query)
    }

    fn with_payload(request: RequestBuilder, payload: &Payload) -> RequestBuilder {
        let request = request.json(&payload.body);
        match &payload.idempotency_key {
            Some(key) => request.header(IDEMPOTENCY_HEADER, key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, token: &AccessToken) -> Result<Value, ProviderError> {
        let response = request
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(classify_transport)?;
        let response = check_response(response).await?;

        let body = response.text().await.map_err(classify_transport)?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::permanent(format!("provider returned invalid JSON: {}", e)))
    }

    async fn fetch_page(
        &self,
        token: &AccessToken,
        request: RequestBuilder,
    ) -> Result<Page, ProviderError> {
        let body = self.send(request, token).await?;
        self.extract_page(body)
    }

    fn extract_page(&self, mut body: Value) -> Result<Page, ProviderError> {
        let next_cursor = self
            .config
            .next_cursor_pointer
            .as_deref()
            .and_then(|pointer| body.pointer(pointer))
            .and_then(|cursor| match cursor {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        let items = match body.pointer_mut(&self.config.items_pointer).map(Value::take) {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ProviderError::permanent(format!(
                    "expected an array at '{}', found {}",
                    self.config.items_pointer,
                    json_type(&other)
                )))
            }
            None => {
                return Err(ProviderError::permanent(format!(
                    "list response has nothing at '{}'",
                    self.config.items_pointer
                )))
            }
        };

        Ok(Page {
            total: Some(items.len() as u64),
            items,
            next_cursor,
        })
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Connector for RestConnector {
    fn provider(&self) -> &str {
        &self.config.provider
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn as_data(&self) -> Option<&dyn DataConnector> {
        Some(self)
    }

    fn required_scopes(&self, operation: &Operation) -> Vec<String> {
        if operation.is_read_only() {
            self.config.read_scopes.clone()
        } else {
            self.config.write_scopes.clone()
        }
    }
}

#[async_trait]
impl DataConnector for RestConnector {
    async fn list(&self, token: &AccessToken, filter: &Filter) -> Result<Page, ProviderError> {
        let request = self.http_client.get(self.collection_url()?);
        self.fetch_page(token, self.paged(request, filter)).await
    }

    async fn get(&self, token: &AccessToken, id: &str) -> Result<Value, ProviderError> {
        let request = self.http_client.get(self.item_url(id)?);
        self.send(request, token).await
    }

    async fn create(&self, token: &AccessToken, payload: &Payload) -> Result<Value, ProviderError> {
        let request = self.http_client.post(self.collection_url()?);
        self.send(Self::with_payload(request, payload), token).await
    }

    async fn update(
        &self,
        token: &AccessToken,
        id: &str,
        payload: &Payload,
    ) -> Result<Value, ProviderError> {
        let request = self.http_client.patch(self.item_url(id)?);
        self.send(Self::with_payload(request, payload), token).await
    }

    async fn delete(&self, token: &AccessToken, id: &str) -> Result<(), ProviderError> {
        let request = self.http_client.delete(self.item_url(id)?);
        self.send(request, token).await.map(|_| ())
    }

    async fn search(
        &self,
        token: &AccessToken,
        query: &str,
        filter: &Filter,
    ) -> Result<Page, ProviderError> {
        let request = self
            .http_client
            .get(self.collection_url()?)
            .query(&[(self.config.search_param.as_str(), query)]);
        self.fetch_page(token, self.paged(request, filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn config(base_url: String) -> RestConnectorConfig {
        RestConnectorConfig {
            provider: "notes".to_string(),
            base_url,
            collection_path: "/v1/notes".to_string(),
            search_param: "q".to_string(),
            cursor_param: "cursor".to_string(),
            items_pointer: "/data".to_string(),
            next_cursor_pointer: Some("/meta/next".to_string()),
            read_scopes: vec!["notes.read".to_string()],
            write_scopes: vec!["notes.write".to_string()],
        }
    }

    fn connector(server: &Server) -> RestConnector {
        RestConnector::new("alice", Arc::new(config(server.url())), Client::new())
    }

    fn token() -> AccessToken {
        AccessToken::new("test_token")
    }

    #[tokio::test]
    async fn test_list_with_cursor() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/notes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("cursor".into(), "abc".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
                Matcher::UrlEncoded("folder".into(), "inbox".into()),
            ]))
            .match_header("authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"id":1},{"id":2}],"meta":{"next":"def"}}"#)
            .create_async()
            .await;

        let filter = Filter::default()
            .with_cursor("abc")
            .with_limit(2)
            .with_param("folder", "inbox");
        let page = connector(&server).list(&token(), &filter).await.unwrap();
        mock.assert_async().await;

        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("def"));
    }

    #[tokio::test]
    async fn test_get_escapes_id() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/notes/a%2Fb")
            .with_status(200)
            .with_body(r#"{"id":"a/b","title":"Plan"}"#)
            .create_async()
            .await;

        let item = connector(&server).get(&token(), "a/b").await.unwrap();
        mock.assert_async().await;
        assert_eq!(item["title"], "Plan");
    }

    #[tokio::test]
    async fn test_create_forwards_idempotency_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/notes")
            .match_header("idempotency-key", "req-42")
            .match_body(Matcher::Json(json!({"title": "New"})))
            .with_status(201)
            .with_body(r#"{"id":"n1","title":"New"}"#)
            .create_async()
            .await;

        let payload = Payload::new(json!({"title": "New"})).with_idempotency_key("req-42");
        let created = connector(&server).create(&token(), &payload).await.unwrap();
        mock.assert_async().await;
        assert_eq!(created["id"], "n1");
    }

    #[tokio::test]
    async fn test_delete_with_empty_body() {
        let mut server = Server::new_async().await;
        server
            .mock("DELETE", "/v1/notes/n1")
            .with_status(204)
            .create_async()
            .await;

        connector(&server).delete(&token(), "n1").await.unwrap();
    }

    #[tokio::test]
    async fn test_search_uses_search_param() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/notes")
            .match_query(Matcher::UrlEncoded("q".into(), "quarterly plan".into()))
            .with_status(200)
            .with_body(r#"{"data":[{"id":"n7"}]}"#)
            .create_async()
            .await;

        let page = connector(&server)
            .search(&token(), "quarterly plan", &Filter::default())
            .await
            .unwrap();
        assert_eq!(page.items[0]["id"], "n7");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_error_statuses_classified() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/notes/locked")
            .with_status(429)
            .with_header("retry-after", "4")
            .create_async()
            .await;
        server
            .mock("GET", "/v1/notes/gone")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;
        server
            .mock("GET", "/v1/notes/revoked")
            .with_status(401)
            .create_async()
            .await;

        let connector = connector(&server);
        assert!(matches!(
            connector.get(&token(), "locked").await,
            Err(ProviderError::Transient { retry_after: Some(d), .. }) if d.as_secs() == 4
        ));
        assert!(matches!(
            connector.get(&token(), "gone").await,
            Err(ProviderError::Permanent { status: Some(404), .. })
        ));
        assert!(matches!(
            connector.get(&token(), "revoked").await,
            Err(ProviderError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_unexpected_list_shape() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/notes")
            .with_status(200)
            .with_body(r#"{"data":{"id":1}}"#)
            .create_async()
            .await;

        let err = connector(&server)
            .list(&token(), &Filter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { ref message, .. } if message.contains("an object")));
    }

    #[test]
    fn test_scopes_by_operation() {
        let connector = RestConnector::new(
            "alice",
            Arc::new(config("http://localhost".to_string())),
            Client::new(),
        );
        assert_eq!(
            connector.required_scopes(&Operation::Get { id: "1".to_string() }),
            vec!["notes.read".to_string()]
        );
        assert_eq!(
            connector.required_scopes(&Operation::Delete { id: "1".to_string() }),
            vec!["notes.write".to_string()]
        );
        assert_eq!(connector.capabilities().len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_base_url() {
        let mut registry = ConnectorRegistry::new();
        assert!(RestConnector::register(&mut registry, config("not a url".to_string())).is_err());
        assert!(RestConnector::register(&mut registry, config("http://localhost:9".to_string())).is_ok());
        assert!(registry.descriptor("notes").unwrap().supports(Capability::Data));
    }
}
