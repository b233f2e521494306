use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use ledgerflow_core::{ns_from_value, ns_to_iso8601, Row, TimeWindow, CONSENSUS_TIMESTAMP};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{extract_rows, queries, Enricher, QueryError, QueryService};

const BUILTIN_TRANSACTION_TYPES: &str = include_str!("../rules/transaction_types.yaml");
const UNKNOWN: &str = "Unknown";

pub struct IdentityEnricher;

#[async_trait]
impl Enricher for IdentityEnricher {
    async fn enrich(&self, _window: &TimeWindow, batch: Vec<Row>) -> Result<Vec<Row>, QueryError> {
        Ok(batch)
    }
}

/// Maps the initial funding transfer of a new account to how it was created.
pub fn creation_method_for_amount(amount: i64) -> &'static str {
    match amount {
        10_000_000_000 => "Faucet",
        100_000_000_000 | 1_000_000_000_000 => "Portal",
        _ => UNKNOWN,
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn integer_from(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn transfer_amount(parent: &Row) -> i64 {
    parent
        .get("crypto_transfer_aggregate")
        .and_then(|v| v.pointer("/aggregate/max/amount"))
        .and_then(integer_from)
        .unwrap_or(0)
}

/// Looks up each account's parent transfer and derives `initial_transfer_amount` and
/// `creation_method`; also normalizes the timestamp and id columns.
pub struct NewAccountsEnricher {
    service: Arc<dyn QueryService>,
}

impl NewAccountsEnricher {
    pub fn new(service: Arc<dyn QueryService>) -> Self {
        Self { service }
    }

    async fn parent_amounts(
        &self,
        window: &TimeWindow,
        tx_ids: Vec<String>,
    ) -> Result<(HashMap<String, i64>, HashMap<String, i64>), QueryError> {
        let mut by_id = HashMap::new();
        let mut by_timestamp = HashMap::new();
        if tx_ids.is_empty() {
            return Ok((by_id, by_timestamp));
        }

        let variables = json!({
            "startTime": window.start_string(),
            "endTime": window.end_string(),
            "txIdList": tx_ids,
        });
        let data = self
            .service
            .execute(queries::ACCOUNT_CREATION_METHOD, variables)
            .await?;
        for parent in extract_rows(data, "transaction")? {
            let amount = transfer_amount(&parent);
            if let Some(id) = parent.get("id").and_then(Value::as_str) {
                by_id.entry(id.to_string()).or_insert(amount);
            }
            if let Some(ns) = parent.get(CONSENSUS_TIMESTAMP).and_then(ns_from_value) {
                by_timestamp.insert(ns.to_string(), amount);
            }
        }
        Ok((by_id, by_timestamp))
    }
}

#[async_trait]
impl Enricher for NewAccountsEnricher {
    async fn enrich(&self, window: &TimeWindow, batch: Vec<Row>) -> Result<Vec<Row>, QueryError> {
        info!(rows = batch.len(), "enriching accounts with creation method");

        let tx_ids: Vec<String> = batch
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (by_id, by_timestamp) = self.parent_amounts(window, tx_ids).await?;
        let created_at = now_rfc3339();

        let enriched = batch
            .into_iter()
            .map(|mut row| {
                let ns = row.get(CONSENSUS_TIMESTAMP).and_then(ns_from_value);
                let amount = row
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|id| by_id.get(id))
                    .or_else(|| ns.and_then(|ns| by_timestamp.get(&ns.to_string())))
                    .copied()
                    .unwrap_or(0);

                if let Some(ns) = ns {
                    row.insert(CONSENSUS_TIMESTAMP.to_string(), Value::from(ns.to_string()));
                    row.insert(
                        "consensus_timestamp_iso8601".to_string(),
                        Value::from(ns_to_iso8601(ns)),
                    );
                }
                if let Some(entity_id) = row.get("entity_id").and_then(integer_from) {
                    row.insert("entity_id".to_string(), Value::from(entity_id));
                }
                row.insert("initial_transfer_amount".to_string(), Value::from(amount));
                row.insert(
                    "creation_method".to_string(),
                    Value::from(creation_method_for_amount(amount)),
                );
                row.insert("created_at".to_string(), Value::from(created_at.clone()));
                row
            })
            .collect::<Vec<_>>();

        debug!(rows = enriched.len(), "enriched accounts");
        Ok(enriched)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TransactionTypesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    transaction_types: Vec<TransactionTypeRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransactionTypeRule {
    pub code: i64,
    pub name: String,
    pub service: String,
}

/// Transaction type code → name and owning network service.
#[derive(Debug, Clone)]
pub struct TransactionTypeTable {
    by_code: BTreeMap<i64, TransactionTypeRule>,
}

impl TransactionTypeTable {
    /// The table shipped in `rules/transaction_types.yaml`.
    pub fn builtin() -> Result<Self, serde_yaml::Error> {
        Self::from_yaml_str(BUILTIN_TRANSACTION_TYPES)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: TransactionTypesFile = serde_yaml::from_str(text)?;
        let by_code = file
            .transaction_types
            .into_iter()
            .map(|rule| (rule.code, rule))
            .collect();
        Ok(Self { by_code })
    }

    pub fn lookup(&self, code: i64) -> Option<&TransactionTypeRule> {
        self.by_code.get(&code)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Adds `transaction_type_name`, `hedera_service` and `inserted_at` to history rows.
pub struct TransactionHistoryEnricher {
    types: TransactionTypeTable,
}

impl TransactionHistoryEnricher {
    pub fn new(types: TransactionTypeTable) -> Self {
        Self { types }
    }
}

#[async_trait]
impl Enricher for TransactionHistoryEnricher {
    async fn enrich(&self, _window: &TimeWindow, batch: Vec<Row>) -> Result<Vec<Row>, QueryError> {
        info!(rows = batch.len(), "enriching transaction history records");
        let inserted_at = now_rfc3339();

        Ok(batch
            .into_iter()
            .map(|mut row| {
                let rule = row
                    .get("type")
                    .and_then(integer_from)
                    .and_then(|code| self.types.lookup(code));
                let (name, service) = rule
                    .map(|r| (r.name.as_str(), r.service.as_str()))
                    .unwrap_or((UNKNOWN, UNKNOWN));
                row.insert("transaction_type_name".to_string(), Value::from(name));
                row.insert("hedera_service".to_string(), Value::from(service));
                row.insert("inserted_at".to_string(), Value::from(inserted_at.clone()));
                row
            })
            .collect())
    }
}
