//! crates/tutor_core/src/quota.rs
//!
//! The quota ledger: the gate every billed generation call passes first.
//! Resetting buckets is a scheduled job outside this crate; the ledger only
//! increments and refunds.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{QuotaBucket, QuotaRecord};
use crate::error::{EngineError, EngineResult};
use crate::ports::QuotaStore;

/// Per-bucket limits assigned to a user the first time a bucket is charged.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub explanation: u32,
    pub quiz: u32,
}

impl QuotaLimits {
    pub fn limit_for(&self, bucket: QuotaBucket) -> u32 {
        match bucket {
            QuotaBucket::Explanation => self.explanation,
            QuotaBucket::Quiz => self.quiz,
        }
    }
}

/// A read-only view of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub bucket: QuotaBucket,
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl From<QuotaRecord> for QuotaStatus {
    fn from(record: QuotaRecord) -> Self {
        Self {
            bucket: record.bucket,
            used: record.used,
            remaining: record.remaining(),
            limit: record.limit,
            reset_at: record.reset_at,
        }
    }
}

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    limits: QuotaLimits,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, limits: QuotaLimits) -> Self {
        Self { store, limits }
    }

    /// Reports the bucket without mutating it. A bucket that was never
    /// charged reports its default limit.
    pub async fn check(&self, user_id: Uuid, bucket: QuotaBucket) -> EngineResult<QuotaStatus> {
        match self.store.get_quota(user_id, bucket).await? {
            Some(record) => Ok(record.into()),
            None => {
                let limit = self.limits.limit_for(bucket);
                Ok(QuotaStatus {
                    bucket,
                    used: 0,
                    remaining: limit,
                    limit,
                    reset_at: next_reset_at(Utc::now()),
                })
            }
        }
    }

    /// Charges `amount` against the bucket, or fails with `QuotaExceeded`
    /// leaving the bucket untouched. The charge is a single conditional
    /// update in the store, so concurrent calls cannot overdraw it.
    pub async fn consume(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> EngineResult<QuotaStatus> {
        self.ensure_bucket(user_id, bucket).await?;

        match self.store.try_consume(user_id, bucket, amount).await? {
            Some(record) => {
                debug!(
                    user_id = %user_id,
                    bucket = %bucket,
                    used = record.used,
                    limit = record.limit,
                    "Quota consumed"
                );
                Ok(record.into())
            }
            None => {
                let status = self.check(user_id, bucket).await?;
                info!(
                    user_id = %user_id,
                    bucket = %bucket,
                    remaining = status.remaining,
                    limit = status.limit,
                    "Quota exceeded"
                );
                Err(EngineError::QuotaExceeded {
                    bucket,
                    remaining: status.remaining,
                    limit: status.limit,
                })
            }
        }
    }

    /// Gives back a charge whose operation failed. `used` never drops below zero.
    pub async fn refund(
        &self,
        user_id: Uuid,
        bucket: QuotaBucket,
        amount: u32,
    ) -> EngineResult<QuotaStatus> {
        let record = self.store.refund(user_id, bucket, amount).await?;
        debug!(user_id = %user_id, bucket = %bucket, used = record.used, "Quota refunded");
        Ok(record.into())
    }

    async fn ensure_bucket(&self, user_id: Uuid, bucket: QuotaBucket) -> EngineResult<()> {
        if self.store.get_quota(user_id, bucket).await?.is_none() {
            self.store
                .create_quota(
                    user_id,
                    bucket,
                    self.limits.limit_for(bucket),
                    next_reset_at(Utc::now()),
                )
                .await?;
        }
        Ok(())
    }
}

/// The first instant of the month after `now`, in UTC.
pub fn next_reset_at(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(|| now + Duration::days(30))
}
