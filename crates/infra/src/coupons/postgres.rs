//! Postgres-backed coupon pool.
//!
//! Schema: `migrations/0001_coupons.sql`.
//!
//! ## Allocation
//!
//! A claim is one statement:
//!
//! ```sql
//! UPDATE coupon_codes SET allocated_on = NOW(), metadata = $2
//! WHERE id = (SELECT id FROM coupon_codes
//!             WHERE coupon_id = $1 AND allocated_on IS NULL
//!             ORDER BY id LIMIT 1 FOR UPDATE SKIP LOCKED)
//!   AND allocated_on IS NULL
//! RETURNING code
//! ```
//!
//! The row lock keeps concurrent claimers off the same code; `SKIP LOCKED`
//! sends them to the next free row instead of queueing. If every remaining
//! row is locked by in-flight claims the statement returns nothing and the
//! caller sees `Exhausted`.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | EngineError |
//! |------------|---------------|-------------|
//! | Database (unique violation) | `23505` | `Domain(Validation)` |
//! | Database (check violation) | `23514` | `Domain(Validation)` |
//! | anything else | | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use pledgebank_core::{CouponCodeId, CouponId, DomainError, HolderId};
use pledgebank_coupons::{Coupon, CouponCode};

use super::AsyncCouponPool;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct PostgresCouponPool {
    pool: Arc<PgPool>,
}

impl PostgresCouponPool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the bundled schema.
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::raw_sql(include_str!("../../migrations/0001_coupons.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn campaign_name(&self, coupon: CouponId) -> EngineResult<Option<String>> {
        let row = sqlx::query("SELECT campaign_name FROM coupons WHERE id = $1")
            .bind(coupon.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("campaign_name", e))?;

        row.map(|r| r.try_get::<String, _>("campaign_name"))
            .transpose()
            .map_err(|e| map_sqlx_error("campaign_name", e))
    }
}

#[async_trait::async_trait]
impl AsyncCouponPool for PostgresCouponPool {
    #[instrument(skip(self), err)]
    async fn create_coupon(&self, campaign_name: &str, project: Option<HolderId>) -> EngineResult<Coupon> {
        let coupon = Coupon::new(campaign_name, project)?;

        sqlx::query("INSERT INTO coupons (id, campaign_name, project_id) VALUES ($1, $2, $3)")
            .bind(coupon.id().as_uuid())
            .bind(coupon.campaign_name())
            .bind(coupon.project().map(Uuid::from))
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EngineError::from(DomainError::validation("campaign_name has already been taken"))
                } else {
                    map_sqlx_error("create_coupon", e)
                }
            })?;

        Ok(coupon)
    }

    #[instrument(skip(self, codes), fields(coupon_id = %coupon, count = codes.len()), err)]
    async fn provision_codes(&self, coupon: CouponId, codes: &[String]) -> EngineResult<usize> {
        let new_codes = codes
            .iter()
            .map(|code| CouponCode::new(coupon, code.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for code in &new_codes {
            sqlx::query("INSERT INTO coupon_codes (id, coupon_id, code) VALUES ($1, $2, $3)")
                .bind(code.id().as_uuid())
                .bind(coupon.as_uuid())
                .bind(code.code())
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EngineError::from(DomainError::validation(format!(
                            "code '{}' has already been taken",
                            code.code()
                        )))
                    } else if is_foreign_key_violation(&e) {
                        EngineError::from(DomainError::not_found())
                    } else {
                        map_sqlx_error("provision_codes", e)
                    }
                })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(new_codes.len())
    }

    async fn find_by_campaign(&self, campaign_name: &str) -> EngineResult<Option<Coupon>> {
        let row = sqlx::query("SELECT id, campaign_name, project_id FROM coupons WHERE campaign_name = $1")
            .bind(campaign_name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_campaign", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let read = |e| map_sqlx_error("find_by_campaign", e);
        let id: Uuid = row.try_get("id").map_err(read)?;
        let name: String = row.try_get("campaign_name").map_err(read)?;
        let project: Option<Uuid> = row.try_get("project_id").map_err(read)?;

        Ok(Some(Coupon::restore(
            CouponId::from_uuid(id),
            name,
            project.map(HolderId::from_uuid),
        )))
    }

    #[instrument(skip(self, metadata), fields(coupon_id = %coupon, code = tracing::field::Empty), err)]
    async fn allocate(&self, coupon: CouponId, metadata: Option<JsonValue>) -> EngineResult<String> {
        let row = sqlx::query(
            r#"
            UPDATE coupon_codes
            SET allocated_on = NOW(), metadata = $2
            WHERE id = (
                SELECT id FROM coupon_codes
                WHERE coupon_id = $1 AND allocated_on IS NULL
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND allocated_on IS NULL
            RETURNING code
            "#,
        )
        .bind(coupon.as_uuid())
        .bind(metadata)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("allocate", e))?;

        match row {
            Some(row) => {
                let code: String = row
                    .try_get("code")
                    .map_err(|e| map_sqlx_error("allocate", e))?;
                Span::current().record("code", code.as_str());
                Ok(code)
            }
            None => match self.campaign_name(coupon).await? {
                Some(name) => {
                    debug!(campaign = %name, "coupon exhausted");
                    Err(DomainError::exhausted(name).into())
                }
                None => Err(DomainError::not_found().into()),
            },
        }
    }

    async fn remaining(&self, coupon: CouponId) -> EngineResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM coupon_codes WHERE coupon_id = $1 AND allocated_on IS NULL",
        )
        .bind(coupon.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remaining", e))?;

        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn allocated(&self, coupon: CouponId) -> EngineResult<Vec<CouponCode>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, allocated_on, metadata
            FROM coupon_codes
            WHERE coupon_id = $1 AND allocated_on IS NOT NULL
            ORDER BY allocated_on ASC, id ASC
            "#,
        )
        .bind(coupon.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("allocated", e))?;

        let read = |e| map_sqlx_error("allocated", e);
        rows.iter()
            .map(|row| -> EngineResult<CouponCode> {
                let id: Uuid = row.try_get("id").map_err(read)?;
                let code: String = row.try_get("code").map_err(read)?;
                let allocated_on: Option<DateTime<Utc>> = row.try_get("allocated_on").map_err(read)?;
                let metadata: Option<JsonValue> = row.try_get("metadata").map_err(read)?;
                Ok(CouponCode::restore(
                    CouponCodeId::from_uuid(id),
                    coupon,
                    code,
                    allocated_on,
                    metadata,
                ))
            })
            .collect()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

fn has_code(err: &sqlx::Error, code: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(code),
        _ => false,
    }
}

/// Map SQLx errors to `EngineError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("23514") => DomainError::validation(msg).into(),
                _ => EngineError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => EngineError::Storage(format!("connection pool closed in {operation}")),
        _ => EngineError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
