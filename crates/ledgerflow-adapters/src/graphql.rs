use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info_span, Instrument};

use crate::{QueryError, QueryService};

#[derive(Debug, Clone)]
pub struct GraphqlClientConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for GraphqlClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://testnet.hedera.api.hgraph.io/v1/graphql".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// POSTs `{query, variables}` to a GraphQL endpoint. No retries: a failed call surfaces
/// straight to the run.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorBody {
    message: String,
}

impl GraphqlResponse {
    fn into_data(self) -> Result<Value, QueryError> {
        if let Some(first) = self.errors.first() {
            return Err(QueryError::Graphql(first.message.clone()));
        }
        match self.data {
            Some(Value::Null) | None => Err(QueryError::NoData),
            Some(data) => Ok(data),
        }
    }
}

impl GraphqlClient {
    pub fn new(config: GraphqlClientConfig) -> Result<Self, QueryError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            api_key: config.api_key.filter(|key| !key.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl QueryService for GraphqlClient {
    async fn execute(&self, document: &str, variables: Value) -> Result<Value, QueryError> {
        let span = info_span!("graphql_query", endpoint = %self.endpoint);
        async move {
            debug!(%variables, "executing graphql query");
            let mut request = self
                .client
                .post(&self.endpoint)
                .json(&json!({ "query": document, "variables": variables }));
            if let Some(key) = &self.api_key {
                request = request.header("x-api-key", key);
            }

            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(QueryError::HttpStatus {
                    status: status.as_u16(),
                    endpoint: self.endpoint.clone(),
                });
            }

            let body: GraphqlResponse = response.json().await?;
            body.into_data()
        }
        .instrument(span)
        .await
    }
}
