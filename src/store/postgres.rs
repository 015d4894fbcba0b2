//! PostgreSQL transaction store

use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::TransactionStore;
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{PtxStatus, PtxUpdate, PublicTx, SubStatus, SubStatusAction, TxFilter};

/// Transaction store backed by PostgreSQL.
pub struct PgTxStore {
    pool: PgPool,
}

impl PgTxStore {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS public_transactions (
                id UUID PRIMARY KEY,
                from_addr VARCHAR(42) NOT NULL,
                to_addr VARCHAR(42),
                data BYTEA NOT NULL,
                value TEXT NOT NULL,
                gas_limit TEXT,
                gas_pricing JSONB,
                nonce BIGINT,
                status VARCHAR(20) NOT NULL,
                fueling BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ptx_from_nonce
            ON public_transactions (from_addr, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ptx_status
            ON public_transactions (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ptx_sub_status (
                id BIGSERIAL PRIMARY KEY,
                tx_id UUID NOT NULL,
                sub_status VARCHAR(20) NOT NULL,
                action VARCHAR(30) NOT NULL,
                info JSONB,
                error TEXT,
                metadata JSONB,
                occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sub_status_tx_id
            ON ptx_sub_status (tx_id, occurred_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_tx(row: &sqlx::postgres::PgRow) -> EngineResult<PublicTx> {
        let from_raw: String = row.get("from_addr");
        let from: Address = from_raw
            .parse()
            .map_err(|_| EngineError::Store(format!("corrupt from address {from_raw}")))?;

        let to: Option<Address> = row
            .get::<Option<String>, _>("to_addr")
            .map(|raw| {
                raw.parse()
                    .map_err(|_| EngineError::Store(format!("corrupt to address {raw}")))
            })
            .transpose()?;

        let value_raw: String = row.get("value");
        let value = U256::from_dec_str(&value_raw)
            .map_err(|_| EngineError::Store(format!("corrupt value {value_raw}")))?;

        let gas_limit = row
            .get::<Option<String>, _>("gas_limit")
            .map(|raw| {
                U256::from_dec_str(&raw)
                    .map_err(|_| EngineError::Store(format!("corrupt gas limit {raw}")))
            })
            .transpose()?;

        let gas_pricing = row
            .get::<Option<serde_json::Value>, _>("gas_pricing")
            .map(|raw| {
                serde_json::from_value(raw)
                    .map_err(|err| EngineError::Store(format!("corrupt gas pricing: {err}")))
            })
            .transpose()?;

        let status_raw: String = row.get("status");
        let status = parse_status(&status_raw)?;

        Ok(PublicTx {
            id: row.get("id"),
            from,
            to,
            data: Bytes::from(row.get::<Vec<u8>, _>("data")),
            value,
            gas_limit,
            gas_pricing,
            nonce: row.get::<Option<i64>, _>("nonce").map(|n| n as u64),
            status,
            fueling: row.get("fueling"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

fn parse_status(raw: &str) -> EngineResult<PtxStatus> {
    match raw {
        "pending" => Ok(PtxStatus::Pending),
        "suspended" => Ok(PtxStatus::Suspended),
        "succeeded" => Ok(PtxStatus::Succeeded),
        "failed" => Ok(PtxStatus::Failed),
        other => Err(EngineError::Store(format!("unknown status {other}"))),
    }
}

#[async_trait]
impl TransactionStore for PgTxStore {
    async fn insert_transaction(&self, tx: &PublicTx) -> EngineResult<()> {
        let gas_pricing = tx
            .gas_pricing
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| EngineError::Store(err.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO public_transactions
                (id, from_addr, to_addr, data, value, gas_limit, gas_pricing, nonce, status,
                 fueling, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(tx.id)
        .bind(format!("{:?}", tx.from))
        .bind(tx.to.map(|addr| format!("{addr:?}")))
        .bind(tx.data.to_vec())
        .bind(tx.value.to_string())
        .bind(tx.gas_limit.map(|limit| limit.to_string()))
        .bind(gas_pricing)
        .bind(tx.nonce.map(|nonce| nonce as i64))
        .bind(tx.status.as_str())
        .bind(tx.fueling)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::DuplicateTransactionId { id: tx.id });
        }
        debug!(id = %tx.id, "inserted public transaction");
        Ok(())
    }

    async fn update_transaction(&self, id: Uuid, updates: &PtxUpdate) -> EngineResult<()> {
        let gas_pricing = updates
            .gas_pricing
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| EngineError::Store(err.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE public_transactions
            SET status = COALESCE($2, status),
                nonce = COALESCE($3, nonce),
                gas_limit = COALESCE($4, gas_limit),
                gas_pricing = COALESCE($5, gas_pricing),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(updates.status.map(|status| status.as_str()))
        .bind(updates.nonce.map(|nonce| nonce as i64))
        .bind(updates.gas_limit.map(|limit| limit.to_string()))
        .bind(gas_pricing)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::TransactionNotFound { id });
        }
        Ok(())
    }

    async fn get_transaction_by_id(&self, id: Uuid) -> EngineResult<Option<PublicTx>> {
        let row = sqlx::query("SELECT * FROM public_transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_tx).transpose()
    }

    async fn list_transactions(&self, filter: &TxFilter) -> EngineResult<Vec<PublicTx>> {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT * FROM public_transactions
            WHERE ($1::VARCHAR IS NULL OR from_addr = $1)
              AND (cardinality($2::VARCHAR[]) = 0 OR status = ANY($2))
            ORDER BY created_at ASC, nonce ASC NULLS LAST
            LIMIT $3
            "#,
        )
        .bind(filter.from.map(|from| format!("{from:?}")))
        .bind(&statuses)
        .bind(filter.limit.map(|limit| limit as i64).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_tx).collect()
    }

    async fn update_sub_status(
        &self,
        id: Uuid,
        sub_status: SubStatus,
        action: SubStatusAction,
        info: Option<serde_json::Value>,
        error: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ptx_sub_status (tx_id, sub_status, action, info, error, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(sub_status.as_str())
        .bind(action.as_str())
        .bind(info)
        .bind(error)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
