//! Remote query collaborator: GraphQL transport, query documents, per-target page sources
//! and batch enrichers.

use async_trait::async_trait;
use ledgerflow_core::{Row, TableName, TimeWindow};
use serde_json::Value;
use thiserror::Error;

mod enrich;
mod graphql;
pub mod queries;
mod sources;

pub use enrich::{
    creation_method_for_amount, IdentityEnricher, NewAccountsEnricher, TransactionHistoryEnricher,
    TransactionTypeRule, TransactionTypeTable,
};
pub use graphql::{GraphqlClient, GraphqlClientConfig};
pub use sources::{NewAccountsSource, TransactionHistorySource};

pub const CRATE_NAME: &str = "ledgerflow-adapters";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("graphql query failed: {0}")]
    Graphql(String),
    #[error("query returned no data")]
    NoData,
    #[error("unexpected response shape: {0}")]
    Shape(String),
    #[error("{0}")]
    Message(String),
}

/// Executes a query document with variables and returns the response `data` object.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, document: &str, variables: Value) -> Result<Value, QueryError>;
}

/// One logical dataset, fetched a page at a time over a window.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn table(&self) -> TableName;

    async fn fetch_page(
        &self,
        window: &TimeWindow,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, QueryError>;
}

/// Post-fetch mapping of a raw batch to rows shaped for the target table.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, window: &TimeWindow, batch: Vec<Row>) -> Result<Vec<Row>, QueryError>;
}

/// Pulls the array under `data[field]` out as rows; a missing or null field is an empty page.
pub fn extract_rows(data: Value, field: &str) -> Result<Vec<Row>, QueryError> {
    let Value::Object(mut data) = data else {
        return Err(QueryError::Shape("response data is not an object".to_string()));
    };
    match data.remove(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(QueryError::Shape(format!("{field} item is not an object: {other}"))),
            })
            .collect(),
        Some(other) => Err(QueryError::Shape(format!("{field} is not an array: {other}"))),
    }
}
