//! Durable store for tailoring results. Writes are insert-only.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::models::tailoring::NewTailoredResume;

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persists `record` and returns its new id.
    async fn save(&self, record: &NewTailoredResume) -> Result<Uuid>;
}

pub struct PgResultStore {
    pool: PgPool,
}

impl PgResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgResultStore {
    async fn save(&self, record: &NewTailoredResume) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO tailored_resumes
                (id, fingerprint, model, job_description, original_resume,
                 tailored_resume, match_score, baseline_score, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(&record.fingerprint)
        .bind(&record.model)
        .bind(&record.job_description)
        .bind(&record.original_resume)
        .bind(&record.tailored_resume)
        .bind(record.match_score)
        .bind(record.baseline_score)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?;

        info!("Saved tailored resume {id}");
        Ok(id)
    }
}
