use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_core::{ColumnMode, ColumnSpec, ColumnType, Row, TableSchema};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row as _};
use tracing::debug;

use crate::{format_timestamp, project_row, TableMetadata, TableRef, Warehouse, WarehouseError};

// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 60_000;

/// Postgres-backed warehouse. Datasets map to schemas; creation times live in table comments.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs DDL and data statements as one unit; any failure rolls every statement back.
    async fn execute_atomically(&self, statements: &[String]) -> Result<(), WarehouseError> {
        let mut tx = self.pool.begin().await?;
        for sql in statements {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_schema(&self, table: &TableRef) -> Result<TableSchema, WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type, is_nullable::text AS is_nullable
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(WarehouseError::TableNotFound(table.clone()));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            let nullable: String = row.try_get("is_nullable")?;
            let kind = column_type_from_sql(&data_type).ok_or_else(|| {
                WarehouseError::Backend(format!(
                    "column {name} of {table} has unsupported type {data_type}"
                ))
            })?;
            columns.push(ColumnSpec {
                name,
                kind,
                mode: if nullable == "YES" {
                    ColumnMode::Nullable
                } else {
                    ColumnMode::Required
                },
            });
        }
        Ok(TableSchema::new(columns))
    }

    async fn comment_created_at(&self, table: &TableRef) -> Result<Option<DateTime<Utc>>, WarehouseError> {
        let comment: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT obj_description(c.oid, 'pg_class')
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(comment.flatten().as_deref().and_then(parse_created_comment))
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

fn sql_type(kind: ColumnType) -> &'static str {
    match kind {
        ColumnType::String => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

fn column_type_from_sql(data_type: &str) -> Option<ColumnType> {
    match data_type {
        "text" | "character varying" => Some(ColumnType::String),
        "bigint" | "integer" | "smallint" => Some(ColumnType::Integer),
        "timestamp with time zone" => Some(ColumnType::Timestamp),
        _ => None,
    }
}

fn parse_created_comment(comment: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(comment.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn comment_sql(table: &TableRef, at: DateTime<Utc>) -> String {
    format!("COMMENT ON TABLE {} IS '{}'", qualified(table), format_timestamp(at))
}

/// `LIKE .. INCLUDING ALL` carries NOT NULL and defaults; `CREATE TABLE AS` would not.
fn clone_statements(source: &TableRef, dest: &TableRef, at: DateTime<Utc>) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            qualified(dest),
            qualified(source)
        ),
        format!("INSERT INTO {} SELECT * FROM {}", qualified(dest), qualified(source)),
        comment_sql(dest, at),
    ]
}

/// The live table is rebuilt from the declared schema, so constraints hold even when the
/// snapshot itself lost them.
fn replace_statements(
    live: &TableRef,
    snapshot: &TableRef,
    schema: &TableSchema,
    at: DateTime<Utc>,
) -> Vec<String> {
    let columns = schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    vec![
        format!("DROP TABLE IF EXISTS {}", qualified(live)),
        create_table_sql(live, schema),
        format!(
            "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
            qualified(live),
            qualified(snapshot)
        ),
        comment_sql(live, at),
    ]
}

fn create_table_sql(table: &TableRef, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(|c| {
            let null = if c.is_required() { " NOT NULL" } else { "" };
            format!("{} {}{}", quote_ident(&c.name), sql_type(c.kind), null)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", qualified(table), columns)
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        if self.table_exists(table).await? {
            return Err(WarehouseError::TableExists(table.clone()));
        }
        self.execute_atomically(&[create_table_sql(table, schema), comment_sql(table, Utc::now())])
            .await
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let schema = self.load_schema(table).await?;
        let projected = rows
            .iter()
            .map(|row| project_row(table, &schema, row))
            .collect::<Result<Vec<_>, _>>()?;

        let rows_per_statement = (MAX_BIND_PARAMS / schema.columns.len().max(1)).max(1);
        let mut tx = self.pool.begin().await?;
        for chunk in projected.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} (", qualified(table)));
            let mut names = builder.separated(", ");
            for column in &schema.columns {
                names.push(quote_ident(&column.name));
            }
            builder.push(") ");
            builder.push_values(chunk, |mut values, row| {
                for column in &schema.columns {
                    let value = row.get(&column.name).unwrap_or(&Value::Null);
                    match column.kind {
                        ColumnType::String => {
                            values.push_bind(value.as_str().map(str::to_string));
                        }
                        ColumnType::Integer => {
                            values.push_bind(value.as_i64());
                        }
                        ColumnType::Timestamp => {
                            values.push_bind(
                                value
                                    .as_str()
                                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                                    .map(|dt| dt.with_timezone(&Utc)),
                            );
                        }
                    }
                }
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(%table, rows = projected.len(), "inserted rows");
        Ok(projected.len())
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, WarehouseError> {
        if !self.table_exists(table).await? {
            return Err(WarehouseError::TableNotFound(table.clone()));
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", qualified(table)))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn clone_table(&self, source: &TableRef, dest: &TableRef) -> Result<(), WarehouseError> {
        if !self.table_exists(source).await? {
            return Err(WarehouseError::TableNotFound(source.clone()));
        }
        if self.table_exists(dest).await? {
            return Err(WarehouseError::TableExists(dest.clone()));
        }
        self.execute_atomically(&clone_statements(source, dest, Utc::now()))
            .await?;
        debug!(%source, %dest, "cloned table");
        Ok(())
    }

    async fn replace_from_snapshot(
        &self,
        live: &TableRef,
        snapshot: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        if !self.table_exists(snapshot).await? {
            return Err(WarehouseError::TableNotFound(snapshot.clone()));
        }
        self.execute_atomically(&replace_statements(live, snapshot, schema, Utc::now()))
            .await?;
        debug!(%live, %snapshot, "replaced table from snapshot");
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn truncate_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        if !self.table_exists(table).await? {
            return Err(WarehouseError::TableNotFound(table.clone()));
        }
        sqlx::query(&format!("TRUNCATE TABLE {}", qualified(table)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_metadata(&self, table: &TableRef) -> Result<Option<TableMetadata>, WarehouseError> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let row_count = self.row_count(table).await?;
        let created_at = self.comment_created_at(table).await?;
        Ok(Some(TableMetadata {
            table: table.clone(),
            row_count,
            created_at,
        }))
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableMetadata>, WarehouseError> {
        let rows = sqlx::query(
            r#"
            SELECT c.relname::text AS name, obj_description(c.oid, 'pg_class') AS comment
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relkind = 'r'
            ORDER BY c.relname
            "#,
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let comment: Option<String> = row.try_get("comment")?;
            let table = TableRef::new(dataset, name);
            let row_count = self.row_count(&table).await?;
            tables.push(TableMetadata {
                table,
                row_count,
                created_at: comment.as_deref().and_then(parse_created_comment),
            });
        }
        Ok(tables)
    }

    async fn scan_rows(&self, table: &TableRef) -> Result<Vec<Row>, WarehouseError> {
        let documents: Vec<String> =
            sqlx::query_scalar(&format!("SELECT to_jsonb(t)::text FROM {} t", qualified(table)))
                .fetch_all(&self.pool)
                .await?;
        documents
            .iter()
            .map(|doc| {
                serde_json::from_str::<Row>(doc)
                    .map_err(|e| WarehouseError::Backend(format!("decoding row of {table}: {e}")))
            })
            .collect()
    }

    async fn numeric_range(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Option<(u64, u64)>, WarehouseError> {
        let col = quote_ident(column);
        let sql = format!(
            "SELECT MIN(CAST({col} AS NUMERIC))::TEXT AS lo, MAX(CAST({col} AS NUMERIC))::TEXT AS hi FROM {}",
            qualified(table)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let lo: Option<String> = row.try_get("lo")?;
        let hi: Option<String> = row.try_get("hi")?;
        match (lo, hi) {
            (Some(lo), Some(hi)) => {
                let parse = |s: &str| {
                    s.parse::<u64>().map_err(|_| {
                        WarehouseError::Backend(format!("{column} of {table} holds non-integer {s}"))
                    })
                };
                Ok(Some((parse(&lo)?, parse(&hi)?)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_core::{job_log_schema, new_accounts_schema};

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("job_log"), "\"job_log\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(
            qualified(&TableRef::new("ledger", "new_accounts")),
            "\"ledger\".\"new_accounts\""
        );
    }

    #[test]
    fn create_statement_carries_nullability() {
        let sql = create_table_sql(&TableRef::new("ledger", "job_log"), &job_log_schema());
        assert!(sql.starts_with("CREATE TABLE \"ledger\".\"job_log\" ("));
        assert!(sql.contains("\"job_id\" TEXT NOT NULL"));
        assert!(sql.contains("\"message\" TEXT,"));
        assert!(sql.contains("\"count_txs_added\" BIGINT"));
        assert!(sql.contains("\"logged_at\" TIMESTAMPTZ)"));
    }

    #[test]
    fn clones_copy_column_constraints() {
        let at = parse_created_comment("2026-02-24T12:00:00Z").unwrap();
        let live = TableRef::new("ledger", "new_accounts");
        let snap = TableRef::new("snapshots", "new_accounts_snapshot_20260224120000000");
        let statements = clone_statements(&live, &snap, at);

        assert_eq!(
            statements[0],
            "CREATE TABLE \"snapshots\".\"new_accounts_snapshot_20260224120000000\" (LIKE \"ledger\".\"new_accounts\" INCLUDING ALL)"
        );
        assert!(statements[1].starts_with("INSERT INTO \"snapshots\"."));
        assert!(statements.iter().all(|sql| !sql.contains(" AS TABLE ")));
    }

    #[test]
    fn replace_rebuilds_live_table_with_required_columns() {
        let at = parse_created_comment("2026-02-24T12:00:00Z").unwrap();
        let live = TableRef::new("ledger", "new_accounts");
        let snap = TableRef::new("snapshots", "new_accounts_snapshot_20260224120000000");
        let statements = replace_statements(&live, &snap, &new_accounts_schema(), at);

        assert_eq!(statements[0], "DROP TABLE IF EXISTS \"ledger\".\"new_accounts\"");
        assert!(statements[1].contains("\"id\" TEXT NOT NULL"));
        assert!(statements[1].contains("\"consensus_timestamp\" TEXT NOT NULL"));
        assert!(statements[2].starts_with(
            "INSERT INTO \"ledger\".\"new_accounts\" (\"consensus_timestamp\", "
        ));
        assert!(statements[2].ends_with(
            "FROM \"snapshots\".\"new_accounts_snapshot_20260224120000000\""
        ));
        assert!(statements[3].starts_with("COMMENT ON TABLE \"ledger\".\"new_accounts\""));
    }

    #[test]
    fn column_types_round_trip_through_sql_names() {
        for kind in [ColumnType::String, ColumnType::Integer, ColumnType::Timestamp] {
            let sql_name = match kind {
                ColumnType::String => "text",
                ColumnType::Integer => "bigint",
                ColumnType::Timestamp => "timestamp with time zone",
            };
            assert_eq!(column_type_from_sql(sql_name), Some(kind));
        }
        assert_eq!(column_type_from_sql("jsonb"), None);
    }

    #[test]
    fn created_comments_parse_as_rfc3339() {
        let at = parse_created_comment("2026-02-24T12:00:00.000000Z").unwrap();
        assert_eq!(format_timestamp(at), "2026-02-24T12:00:00.000000Z");
        assert!(parse_created_comment("hand-written note").is_none());
    }
}
