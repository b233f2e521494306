use std::sync::Arc;

use async_trait::async_trait;
use ledgerflow_core::{Row, TableName, TimeWindow};
use serde_json::json;
use tracing::warn;

use crate::{extract_rows, queries, PageSource, QueryError, QueryService};

const TRANSACTION_FIELD: &str = "transaction";

pub struct NewAccountsSource {
    service: Arc<dyn QueryService>,
}

impl NewAccountsSource {
    pub fn new(service: Arc<dyn QueryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl PageSource for NewAccountsSource {
    fn table(&self) -> TableName {
        TableName::NewAccounts
    }

    async fn fetch_page(
        &self,
        window: &TimeWindow,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, QueryError> {
        let variables = json!({
            "startTime": window.start_string(),
            "endTime": window.end_string(),
            "limit": limit,
            "offset": offset,
        });
        let data = self.service.execute(queries::NEW_ACCOUNTS, variables).await?;
        extract_rows(data, TRANSACTION_FIELD)
    }
}

/// Activity of the accounts already present in `new_accounts`. The id set is read once per
/// run by the caller and fixed for every page of that run.
pub struct TransactionHistorySource {
    service: Arc<dyn QueryService>,
    account_ids: Vec<i64>,
}

impl TransactionHistorySource {
    pub fn new(service: Arc<dyn QueryService>, account_ids: Vec<i64>) -> Self {
        Self {
            service,
            account_ids,
        }
    }

    pub fn account_ids(&self) -> &[i64] {
        &self.account_ids
    }
}

#[async_trait]
impl PageSource for TransactionHistorySource {
    fn table(&self) -> TableName {
        TableName::TransactionHistory
    }

    async fn fetch_page(
        &self,
        window: &TimeWindow,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<Row>, QueryError> {
        if self.account_ids.is_empty() {
            warn!(offset, "no known accounts; transaction history has nothing to fetch");
            return Ok(Vec::new());
        }
        let variables = json!({
            "accountIds": self.account_ids,
            "startTime": window.start_string(),
            "endTime": window.end_string(),
            "limit": limit,
            "offset": offset,
        });
        let data = self.service.execute(queries::TRANSACTION_HISTORY, variables).await?;
        extract_rows(data, TRANSACTION_FIELD)
    }
}
