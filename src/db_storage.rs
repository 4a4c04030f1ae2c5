use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::metrics::MetricsRow;
use crate::models::*;
use crate::store::LeadStore;

/// Columns written from a `Lead`, in bind order. `version` and `updated_at`
/// are managed by the statements themselves.
const LEAD_COLUMNS: &[&str] = &[
    "id",
    "received_at",
    "source",
    "source_detail",
    "first_name",
    "last_name",
    "email",
    "phone",
    "title",
    "company",
    "company_key",
    "industry",
    "employee_count",
    "website",
    "domain",
    "message",
    "product_interest",
    "region",
    "score",
    "score_factors",
    "ai_summary",
    "qualified_by_ai",
    "score_provisional",
    "score_history",
    "response_sent",
    "response_body",
    "response_channel",
    "response_sent_at",
    "response_time_ms",
    "status",
    "sdr_id",
    "ae_id",
    "converted_account_id",
    "converted_deal_id",
    "qualified_at",
    "disqualified_at",
    "converted_at",
    "qualification_notes",
    "status_history",
    "dispatch_attempts",
    "needs_follow_up",
    "last_delivery_error",
];

fn placeholders(from: usize, count: usize) -> String {
    (from..from + count)
        .map(|i| format!("${}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_lead_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let n = LEAD_COLUMNS.len();
        format!(
            "INSERT INTO leads ({}, version, updated_at) VALUES ({})",
            LEAD_COLUMNS.join(", "),
            placeholders(1, n + 2)
        )
    })
}

fn update_lead_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let n = LEAD_COLUMNS.len();
        format!(
            "UPDATE leads SET ({}) = ({}), version = version + 1, updated_at = now() \
             WHERE id = $1 AND version = ${} RETURNING *",
            LEAD_COLUMNS.join(", "),
            placeholders(1, n),
            n + 1
        )
    })
}

fn bind_lead<'q>(
    query: Query<'q, Postgres, PgArguments>,
    lead: &'q Lead,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(lead.id)
        .bind(lead.received_at)
        .bind(lead.source)
        .bind(lead.source_detail.as_deref())
        .bind(lead.first_name.as_deref())
        .bind(lead.last_name.as_deref())
        .bind(lead.email.as_str())
        .bind(lead.phone.as_deref())
        .bind(lead.title.as_deref())
        .bind(lead.company.as_str())
        .bind(lead.company_key.as_str())
        .bind(lead.industry.as_deref())
        .bind(lead.employee_count)
        .bind(lead.website.as_deref())
        .bind(lead.domain.as_deref())
        .bind(lead.message.as_deref())
        .bind(lead.product_interest.as_deref())
        .bind(lead.region.as_deref())
        .bind(lead.score)
        .bind(Json(&lead.score_factors))
        .bind(lead.ai_summary.as_deref())
        .bind(lead.qualified_by_ai)
        .bind(lead.score_provisional)
        .bind(Json(&lead.score_history))
        .bind(lead.response_sent)
        .bind(lead.response_body.as_deref())
        .bind(lead.response_channel)
        .bind(lead.response_sent_at)
        .bind(lead.response_time_ms)
        .bind(lead.status)
        .bind(lead.sdr_id.as_deref())
        .bind(lead.ae_id.as_deref())
        .bind(lead.converted_account_id)
        .bind(lead.converted_deal_id)
        .bind(lead.qualified_at)
        .bind(lead.disqualified_at)
        .bind(lead.converted_at)
        .bind(lead.qualification_notes.as_deref())
        .bind(Json(&lead.status_history))
        .bind(lead.dispatch_attempts)
        .bind(lead.needs_follow_up)
        .bind(lead.last_delivery_error.as_deref())
}

/// Row shape of `leads`; JSONB columns decode through `Json`.
#[derive(Debug, FromRow)]
struct LeadRow {
    id: Uuid,
    received_at: DateTime<Utc>,
    source: LeadSource,
    source_detail: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: String,
    phone: Option<String>,
    title: Option<String>,
    company: String,
    company_key: String,
    industry: Option<String>,
    employee_count: Option<i32>,
    website: Option<String>,
    domain: Option<String>,
    message: Option<String>,
    product_interest: Option<String>,
    region: Option<String>,
    score: Option<i32>,
    score_factors: Json<Vec<String>>,
    ai_summary: Option<String>,
    qualified_by_ai: bool,
    score_provisional: bool,
    score_history: Json<Vec<ScoreChange>>,
    response_sent: bool,
    response_body: Option<String>,
    response_channel: Option<ResponseChannel>,
    response_sent_at: Option<DateTime<Utc>>,
    response_time_ms: Option<i64>,
    status: LeadStatus,
    sdr_id: Option<String>,
    ae_id: Option<String>,
    converted_account_id: Option<Uuid>,
    converted_deal_id: Option<Uuid>,
    qualified_at: Option<DateTime<Utc>>,
    disqualified_at: Option<DateTime<Utc>>,
    converted_at: Option<DateTime<Utc>>,
    qualification_notes: Option<String>,
    status_history: Json<Vec<StatusChange>>,
    dispatch_attempts: i32,
    needs_follow_up: bool,
    last_delivery_error: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<LeadRow> for Lead {
    fn from(row: LeadRow) -> Self {
        Lead {
            id: row.id,
            received_at: row.received_at,
            source: row.source,
            source_detail: row.source_detail,
            first_name: row.first_name,
            last_name: row.last_name,
            email: row.email,
            phone: row.phone,
            title: row.title,
            company: row.company,
            company_key: row.company_key,
            industry: row.industry,
            employee_count: row.employee_count,
            website: row.website,
            domain: row.domain,
            message: row.message,
            product_interest: row.product_interest,
            region: row.region,
            score: row.score,
            score_factors: row.score_factors.0,
            ai_summary: row.ai_summary,
            qualified_by_ai: row.qualified_by_ai,
            score_provisional: row.score_provisional,
            score_history: row.score_history.0,
            response_sent: row.response_sent,
            response_body: row.response_body,
            response_channel: row.response_channel,
            response_sent_at: row.response_sent_at,
            response_time_ms: row.response_time_ms,
            status: row.status,
            sdr_id: row.sdr_id,
            ae_id: row.ae_id,
            converted_account_id: row.converted_account_id,
            converted_deal_id: row.converted_deal_id,
            qualified_at: row.qualified_at,
            disqualified_at: row.disqualified_at,
            converted_at: row.converted_at,
            qualification_notes: row.qualification_notes,
            status_history: row.status_history.0,
            dispatch_attempts: row.dispatch_attempts,
            needs_follow_up: row.needs_follow_up,
            last_delivery_error: row.last_delivery_error,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Version-checked lead write on an open connection or transaction.
async fn write_lead(conn: &mut PgConnection, lead: &Lead) -> Result<Lead, AppError> {
    let updated = bind_lead(sqlx::query(update_lead_sql()), lead)
        .bind(lead.version)
        .fetch_optional(&mut *conn)
        .await
        .context("updating lead")?;

    if let Some(row) = updated {
        let row = LeadRow::from_row(&row).map_err(AppError::DatabaseError)?;
        return Ok(row.into());
    }

    let stored: Option<(i64,)> = sqlx::query_as("SELECT version FROM leads WHERE id = $1")
        .bind(lead.id)
        .fetch_optional(&mut *conn)
        .await?;
    match stored {
        None => Err(AppError::NotFound(format!("Lead {} not found", lead.id))),
        Some((version,)) => Err(AppError::Conflict(format!(
            "lead {} was modified concurrently (stored version {}, write based on {})",
            lead.id, version, lead.version
        ))),
    }
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a LeadQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status);
    }
    if let Some(source) = query.source {
        builder.push(" AND source = ").push_bind(source);
    }
    if let Some(min) = query.min_score {
        builder.push(" AND score >= ").push_bind(min);
    }
    if let Some(term) = query.search_term() {
        builder
            .push(
                " AND lower(concat_ws(' ', first_name, last_name, email, company)) LIKE ",
            )
            .push_bind(format!("%{}%", term));
    }
}

/// PostgreSQL-backed `LeadStore`.
#[derive(Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn insert_lead(&self, lead: &Lead) -> Result<(), AppError> {
        bind_lead(sqlx::query(insert_lead_sql()), lead)
            .bind(lead.version)
            .bind(lead.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(format!("lead {} already exists", lead.id))
                } else {
                    AppError::DatabaseError(e)
                }
            })?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        let row = sqlx::query_as::<_, LeadRow>("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Lead::from))
    }

    async fn find_open_duplicate(
        &self,
        email: &str,
        company_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Lead>, AppError> {
        let row = sqlx::query_as::<_, LeadRow>(
            r#"
            SELECT * FROM leads
            WHERE email = $1 AND company_key = $2 AND received_at >= $3
              AND status <> 'disqualified'
            ORDER BY received_at DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .bind(company_key)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Lead::from))
    }

    async fn update_lead(&self, lead: &Lead) -> Result<Lead, AppError> {
        let mut conn = self.pool.acquire().await?;
        write_lead(&mut conn, lead).await
    }

    async fn list_leads(&self, query: &LeadQuery) -> Result<LeadPage, AppError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM leads");
        push_filters(&mut count, query);
        let (total,): (i64,) = count
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .context("counting leads")?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT * FROM leads");
        push_filters(&mut select, query);
        select
            .push(" ORDER BY received_at DESC, id LIMIT ")
            .push_bind(i64::from(query.per_page()))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows: Vec<LeadRow> = select
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .context("listing leads")?;

        Ok(LeadPage {
            leads: rows.into_iter().map(Lead::from).collect(),
            total: total.max(0) as u64,
            page: query.page(),
            per_page: query.per_page(),
        })
    }

    async fn record_auto_response(
        &self,
        response: &AutoResponse,
        lead: &Lead,
    ) -> Result<Option<Lead>, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO auto_responses (
                id, lead_id, attempt, idempotency_key, subject, body, channel,
                personalization, sent_at, opened, replied, confidence, model_id,
                fallback_used, transport_attempts, response_time_ms, sla_met
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(response.id)
        .bind(response.lead_id)
        .bind(response.attempt)
        .bind(&response.idempotency_key)
        .bind(&response.subject)
        .bind(&response.body)
        .bind(response.channel)
        .bind(&response.personalization)
        .bind(response.sent_at)
        .bind(response.opened)
        .bind(response.replied)
        .bind(response.confidence)
        .bind(&response.model_id)
        .bind(response.fallback_used)
        .bind(response.transport_attempts)
        .bind(response.response_time_ms)
        .bind(response.sla_met)
        .execute(&mut *tx)
        .await
        .context("inserting auto-response")?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let lead = write_lead(&mut tx, lead).await?;
        tx.commit().await?;
        Ok(Some(lead))
    }

    async fn auto_responses(&self, lead_id: Uuid) -> Result<Vec<AutoResponse>, AppError> {
        let rows = sqlx::query_as::<_, AutoResponse>(
            "SELECT * FROM auto_responses WHERE lead_id = $1 ORDER BY sent_at, attempt",
        )
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_account(&self, account_key: &str) -> Result<Option<Account>, AppError> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE account_key = $1")
            .bind(account_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, AppError> {
        let deal = sqlx::query_as::<_, Deal>("SELECT * FROM deals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(deal)
    }

    async fn commit_conversion(
        &self,
        new_account: Option<&Account>,
        deal: &Deal,
        lead: &Lead,
    ) -> Result<Lead, AppError> {
        // Dropping `tx` on any early return rolls everything back.
        let mut tx = self.pool.begin().await?;

        match new_account {
            Some(account) => {
                sqlx::query(
                    r#"
                    INSERT INTO accounts (id, account_key, name, domain, industry, employee_count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    "#,
                )
                .bind(account.id)
                .bind(&account.account_key)
                .bind(&account.name)
                .bind(account.domain.as_deref())
                .bind(account.industry.as_deref())
                .bind(account.employee_count)
                .bind(account.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        AppError::Conversion(format!(
                            "account '{}' was created concurrently",
                            account.account_key
                        ))
                    } else {
                        AppError::DatabaseError(e)
                    }
                })?;
            }
            None => {
                let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM accounts WHERE id = $1")
                    .bind(deal.account_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                if exists.is_none() {
                    return Err(AppError::Conversion(format!(
                        "account {} does not exist",
                        deal.account_id
                    )));
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO deals (
                id, account_id, lead_id, name, product_interest, estimated_seats,
                estimated_value, owner_id, stage, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(deal.id)
        .bind(deal.account_id)
        .bind(deal.lead_id)
        .bind(&deal.name)
        .bind(deal.product_interest.as_deref())
        .bind(deal.estimated_seats)
        .bind(&deal.estimated_value)
        .bind(deal.owner_id.as_deref())
        .bind(&deal.stage)
        .bind(deal.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conversion(format!("lead {} already has a deal", deal.lead_id))
            } else {
                AppError::DatabaseError(e)
            }
        })?;

        let lead = write_lead(&mut tx, lead).await?;
        tx.commit().await?;

        tracing::debug!(
            "Conversion committed for lead {} (deal {})",
            lead.id,
            deal.id
        );
        Ok(lead)
    }

    async fn metrics_rows(&self, since: DateTime<Utc>) -> Result<Vec<MetricsRow>, AppError> {
        let rows = sqlx::query_as::<_, MetricsRow>(
            r#"
            SELECT received_at, source, status, score_provisional, response_sent,
                   response_time_ms, qualified_at, converted_at
            FROM leads
            WHERE received_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
