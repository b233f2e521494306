//! GraphQL documents sent to the ledger query API.
//!
//! Every window filter is half-open: `consensus_timestamp >= startTime AND < endTime`,
//! so consecutive windows never deliver the same row twice.

/// Account-create transactions submitted by the network's treasury payer.
pub const NEW_ACCOUNTS: &str = r#"
query getNewAccounts($startTime: bigint!, $endTime: bigint!, $limit: Int!, $offset: Int!) {
  transaction(
    where: {
      payer_account_id: {_eq: "2"},
      result: {_eq: "22"},
      consensus_timestamp: {_gte: $startTime, _lt: $endTime},
      type: {_eq: "11"},
      nonce: {_gte: 1},
      id: {_neq: "0.0.2@1706812511.019092963"}
    }
    order_by: {consensus_timestamp: asc}
    limit: $limit
    offset: $offset
  ) {
    consensus_timestamp
    consensus_timestamp_iso8601
    id
    entity_id
  }
}"#;

/// Every transaction paid for by one of the given accounts.
pub const TRANSACTION_HISTORY: &str = r#"
query getAccountActivity($accountIds: [bigint!], $startTime: bigint!, $endTime: bigint!, $limit: Int!, $offset: Int!) {
  transaction(
    where: {
      payer_account_id: {_in: $accountIds},
      consensus_timestamp: {_gte: $startTime, _lt: $endTime}
    }
    order_by: {consensus_timestamp: asc}
    limit: $limit
    offset: $offset
  ) {
    consensus_timestamp
    consensus_timestamp_iso8601
    id
    payer_account_id
    type
    result
  }
}"#;

/// Parent transfers of account creations, used to infer how each account was funded.
pub const ACCOUNT_CREATION_METHOD: &str = r#"
query getAccCreationMethod($startTime: bigint!, $endTime: bigint!, $txIdList: [String!]!) {
  transaction(
    where: {
      payer_account_id: {_eq: "2"},
      result: {_eq: "22"},
      consensus_timestamp: {_gte: $startTime, _lt: $endTime},
      type: {_eq: "14"},
      nonce: {_eq: 0},
      id: {_in: $txIdList}
    }
    order_by: {consensus_timestamp: asc}
  ) {
    id
    consensus_timestamp
    consensus_timestamp_iso8601
    crypto_transfer_aggregate {
      aggregate {
        max {
          amount
        }
      }
    }
  }
}"#;
