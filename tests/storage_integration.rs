use bigdecimal::BigDecimal;
use chrono::Utc;
use std::env;
use uuid::Uuid;

use lead_engine::db::Database;
use lead_engine::db_storage::PgLeadStore;
use lead_engine::dispatcher::idempotency_key;
use lead_engine::errors::AppError;
use lead_engine::models::{
    Account, AutoResponse, Deal, Lead, LeadSource, LeadStatus, ResponseChannel,
};
use lead_engine::store::LeadStore;

async fn store() -> anyhow::Result<PgLeadStore> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;
    let db = Database::new(&db_url).await?;
    Ok(PgLeadStore::new(db.pool))
}

fn unique_lead() -> Lead {
    let tag = Uuid::new_v4().simple().to_string();
    let mut lead = Lead::new(
        LeadSource::WebsiteForm,
        format!("casey+{}@example.com", tag),
        format!("Smoke Test {}", tag),
        format!("smoke test {}", tag),
        Utc::now(),
    );
    lead.domain = Some(format!("{}.example.com", tag));
    lead.employee_count = Some(120);
    lead
}

fn response_for(lead: &Lead, ordinal: i32) -> AutoResponse {
    AutoResponse {
        id: Uuid::new_v4(),
        lead_id: lead.id,
        attempt: ordinal,
        idempotency_key: idempotency_key(lead.id, ordinal),
        subject: "Thanks for reaching out".to_string(),
        body: "Hi Casey".to_string(),
        channel: ResponseChannel::Email,
        personalization: serde_json::json!({"company": lead.company}),
        sent_at: Utc::now(),
        opened: false,
        replied: false,
        confidence: 0.8,
        model_id: "template".to_string(),
        fallback_used: true,
        transport_attempts: 1,
        response_time_ms: Some(1200),
        sla_met: Some(true),
    }
}

/// Smoke test for the PostgreSQL lead store.
/// Marked ignored so it only runs against a disposable database; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn lead_round_trip_and_version_check() -> anyhow::Result<()> {
    let store = store().await?;
    let lead = unique_lead();
    store.insert_lead(&lead).await?;

    let loaded = store
        .get_lead(lead.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("inserted lead not found"))?;
    assert_eq!(loaded.email, lead.email);
    assert_eq!(loaded.version, 1);

    let mut edited = loaded.clone();
    edited.score = Some(72);
    edited.score_factors = vec!["director-level title (+20)".to_string()];
    let stored = store.update_lead(&edited).await?;
    assert_eq!(stored.version, 2);
    assert_eq!(stored.score, Some(72));
    assert_eq!(stored.score_factors.len(), 1);

    // Writing from the stale copy must not clobber the newer row.
    let stale = store.update_lead(&loaded).await.unwrap_err();
    assert!(matches!(stale.root(), AppError::Conflict(_)));

    let duplicate = store
        .find_open_duplicate(
            &lead.email,
            &lead.company_key,
            lead.received_at - chrono::Duration::minutes(1),
        )
        .await?;
    assert_eq!(duplicate.map(|l| l.id), Some(lead.id));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn auto_response_keys_are_recorded_once() -> anyhow::Result<()> {
    let store = store().await?;
    let lead = unique_lead();
    store.insert_lead(&lead).await?;

    let mut responded = lead.clone();
    responded.response_sent = true;
    responded.status = LeadStatus::AutoResponded;
    let first = store
        .record_auto_response(&response_for(&lead, 1), &responded)
        .await?;
    let after_first = first.ok_or_else(|| anyhow::anyhow!("first response was not recorded"))?;
    assert_eq!(after_first.status, LeadStatus::AutoResponded);

    let mut again = after_first.clone();
    again.dispatch_attempts += 1;
    let replay = store
        .record_auto_response(&response_for(&lead, 1), &again)
        .await?;
    assert!(replay.is_none());

    let responses = store.auto_responses(lead.id).await?;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].idempotency_key, idempotency_key(lead.id, 1));
    Ok(())
}

#[tokio::test]
#[ignore]
async fn conversion_commits_account_deal_and_lead() -> anyhow::Result<()> {
    let store = store().await?;
    let mut lead = unique_lead();
    lead.status = LeadStatus::Qualified;
    lead.qualified_at = Some(Utc::now());
    store.insert_lead(&lead).await?;
    let lead = store
        .get_lead(lead.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("inserted lead not found"))?;

    let now = Utc::now();
    let account_key = lead.domain.clone().unwrap_or_default();
    let account = Account {
        id: Uuid::new_v4(),
        account_key: account_key.clone(),
        name: lead.company.clone(),
        domain: lead.domain.clone(),
        industry: None,
        employee_count: lead.employee_count,
        created_at: now,
    };
    let deal = Deal {
        id: Uuid::new_v4(),
        account_id: account.id,
        lead_id: lead.id,
        name: format!("{} - New Business", lead.company),
        product_interest: None,
        estimated_seats: 6,
        estimated_value: BigDecimal::from(3000),
        owner_id: Some("ae-smoke".to_string()),
        stage: "discovery".to_string(),
        created_at: now,
    };
    let mut converted = lead.clone();
    converted.status = LeadStatus::Converted;
    converted.converted_at = Some(now);
    converted.converted_account_id = Some(account.id);
    converted.converted_deal_id = Some(deal.id);

    let stored = store
        .commit_conversion(Some(&account), &deal, &converted)
        .await?;
    assert_eq!(stored.status, LeadStatus::Converted);
    assert_eq!(stored.converted_deal_id, Some(deal.id));

    let found = store
        .find_account(&account_key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("account not stored"))?;
    assert_eq!(found.id, account.id);
    let saved_deal = store
        .get_deal(deal.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("deal not stored"))?;
    assert_eq!(saved_deal.estimated_value, BigDecimal::from(3000));
    Ok(())
}
