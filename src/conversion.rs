use bigdecimal::BigDecimal;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::dispatcher::load;
use crate::errors::AppError;
use crate::lifecycle;
use crate::locks::{KeyedLocks, LeadLocks};
use crate::models::{Account, Actor, ConversionResult, Deal, Lead, LeadStatus};
use crate::store::LeadStore;

const EMPLOYEES_PER_SEAT: i32 = 20;
const INITIAL_STAGE: &str = "discovery";

fn seats_regex() -> &'static Regex {
    static SEATS: OnceLock<Regex> = OnceLock::new();
    SEATS.get_or_init(|| {
        Regex::new(r"(?i)\b(\d[\d,]*)\s+(?:[a-z-]+\s+)?(?:seats?|users?|licen[cs]es?|agents?)\b")
            .expect("seat pattern is valid")
    })
}

/// Seat estimate: an explicit "40 seats" in the message wins, then
/// `employee_count / 20` (at least 1), then 1.
pub fn estimate_seats(lead: &Lead) -> i32 {
    let from_message = lead.message.as_deref().and_then(|message| {
        seats_regex()
            .captures(message)
            .and_then(|caps| caps[1].replace(',', "").parse::<i32>().ok())
            .filter(|seats| *seats > 0)
    });
    if let Some(seats) = from_message {
        return seats;
    }
    lead.employee_count
        .map(|count| (count / EMPLOYEES_PER_SEAT).max(1))
        .unwrap_or(1)
}

/// Domain when known, otherwise the normalized company name.
pub fn account_key(lead: &Lead) -> String {
    lead.domain
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| lead.company_key.clone())
}

pub struct ConversionService {
    store: Arc<dyn LeadStore>,
    lead_locks: LeadLocks,
    account_locks: KeyedLocks<String>,
    seat_price: BigDecimal,
}

impl ConversionService {
    pub fn new(store: Arc<dyn LeadStore>, lead_locks: LeadLocks, seat_price: BigDecimal) -> Self {
        Self {
            store,
            lead_locks,
            account_locks: KeyedLocks::new(Duration::from_secs(60)),
            seat_price,
        }
    }

    /// Converts a qualified lead into an Account (found or created) and a Deal.
    ///
    /// All three writes commit together. On any failure the lead stays
    /// `qualified` with no links.
    pub async fn convert(&self, lead_id: Uuid) -> Result<ConversionResult, AppError> {
        let _lead_guard = self.lead_locks.lock(lead_id).await;
        let lead = load(self.store.as_ref(), lead_id).await?;

        if let (Some(account_id), Some(deal_id)) = (lead.converted_account_id, lead.converted_deal_id) {
            return Err(AppError::AlreadyConverted {
                account_id,
                deal_id,
            });
        }
        if lead.status != LeadStatus::Qualified {
            lifecycle::check_transition(lead.status, LeadStatus::Converted, Actor::Conversion)?;
        }

        let key = account_key(&lead);
        let _account_guard = self.account_locks.lock(key.clone()).await;

        let now = Utc::now();
        let existing = self
            .store
            .find_account(&key)
            .await
            .map_err(|e| AppError::Conversion(format!("account lookup failed: {}", e)))?;
        let (account, created) = match existing {
            Some(account) => (account, false),
            None => (
                Account {
                    id: Uuid::new_v4(),
                    account_key: key.clone(),
                    name: lead.company.clone(),
                    domain: lead.domain.clone(),
                    industry: lead.industry.clone(),
                    employee_count: lead.employee_count,
                    created_at: now,
                },
                true,
            ),
        };

        let seats = estimate_seats(&lead);
        let deal = Deal {
            id: Uuid::new_v4(),
            account_id: account.id,
            lead_id,
            name: deal_name(&lead),
            product_interest: lead.product_interest.clone(),
            estimated_seats: seats,
            estimated_value: BigDecimal::from(seats) * &self.seat_price,
            owner_id: lead.ae_id.clone().or_else(|| lead.sdr_id.clone()),
            stage: INITIAL_STAGE.to_string(),
            created_at: now,
        };

        let mut converted = lead;
        lifecycle::mark_converted(&mut converted, account.id, deal.id, now)?;

        let new_account = created.then_some(&account);
        self.store
            .commit_conversion(new_account, &deal, &converted)
            .await
            .map_err(|e| match e {
                AppError::Conversion(_) => e,
                other => AppError::Conversion(format!("commit failed: {}", other)),
            })?;

        tracing::info!(
            "Lead {} converted: account {} ({}), deal {} for {} seat(s)",
            lead_id,
            account.id,
            if created { "new" } else { "existing" },
            deal.id,
            seats
        );

        Ok(ConversionResult {
            lead_id,
            account_id: account.id,
            deal_id: deal.id,
            account_created: created,
        })
    }
}

fn deal_name(lead: &Lead) -> String {
    match lead.product_interest.as_deref() {
        Some(product) if !product.trim().is_empty() => format!("{} - {}", lead.company, product.trim()),
        _ => format!("{} - New Business", lead.company),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRow;
    use crate::models::{AutoResponse, LeadPage, LeadQuery};
    use crate::store::MemoryLeadStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose first conversion commit fails.
    struct FailingCommitStore {
        inner: MemoryLeadStore,
        failed: AtomicBool,
    }

    #[async_trait]
    impl LeadStore for FailingCommitStore {
        async fn insert_lead(&self, lead: &Lead) -> Result<(), AppError> {
            self.inner.insert_lead(lead).await
        }

        async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
            self.inner.get_lead(id).await
        }

        async fn find_open_duplicate(
            &self,
            email: &str,
            company_key: &str,
            since: DateTime<Utc>,
        ) -> Result<Option<Lead>, AppError> {
            self.inner.find_open_duplicate(email, company_key, since).await
        }

        async fn update_lead(&self, lead: &Lead) -> Result<Lead, AppError> {
            self.inner.update_lead(lead).await
        }

        async fn list_leads(&self, query: &LeadQuery) -> Result<LeadPage, AppError> {
            self.inner.list_leads(query).await
        }

        async fn record_auto_response(
            &self,
            response: &AutoResponse,
            lead: &Lead,
        ) -> Result<Option<Lead>, AppError> {
            self.inner.record_auto_response(response, lead).await
        }

        async fn auto_responses(&self, lead_id: Uuid) -> Result<Vec<AutoResponse>, AppError> {
            self.inner.auto_responses(lead_id).await
        }

        async fn find_account(&self, account_key: &str) -> Result<Option<Account>, AppError> {
            self.inner.find_account(account_key).await
        }

        async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, AppError> {
            self.inner.get_deal(id).await
        }

        async fn commit_conversion(
            &self,
            new_account: Option<&Account>,
            deal: &Deal,
            lead: &Lead,
        ) -> Result<Lead, AppError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
            }
            self.inner.commit_conversion(new_account, deal, lead).await
        }

        async fn metrics_rows(&self, since: DateTime<Utc>) -> Result<Vec<MetricsRow>, AppError> {
            self.inner.metrics_rows(since).await
        }
    }

    fn qualified_lead() -> Lead {
        let now = Utc::now();
        let mut lead = Lead::new(
            crate::models::LeadSource::WebsiteForm,
            "dana@acme.io".into(),
            "Acme".into(),
            "acme".into(),
            now,
        );
        lead.status = LeadStatus::Qualified;
        lead.qualified_at = Some(now);
        lead.domain = Some("acme.io".into());
        lead.sdr_id = Some("sdr-1".into());
        lead
    }

    #[test]
    fn test_seats_from_message() {
        let mut lead = qualified_lead();
        lead.message = Some("We need 40 seats for the support team".into());
        assert_eq!(estimate_seats(&lead), 40);
        lead.message = Some("Roughly 1,200 named users across sites".into());
        assert_eq!(estimate_seats(&lead), 1200);
        lead.message = Some("Licenses for 15 support agents".into());
        assert_eq!(estimate_seats(&lead), 15);
    }

    #[test]
    fn test_seats_from_headcount() {
        let mut lead = qualified_lead();
        lead.employee_count = Some(500);
        assert_eq!(estimate_seats(&lead), 25);
        lead.employee_count = Some(8);
        assert_eq!(estimate_seats(&lead), 1);
        lead.employee_count = None;
        assert_eq!(estimate_seats(&lead), 1);
    }

    #[test]
    fn test_account_key_prefers_domain() {
        let mut lead = qualified_lead();
        assert_eq!(account_key(&lead), "acme.io");
        lead.domain = None;
        assert_eq!(account_key(&lead), "acme");
    }

    #[tokio::test]
    async fn test_convert_creates_account_and_deal() {
        let store = Arc::new(MemoryLeadStore::new());
        let mut lead = qualified_lead();
        lead.message = Some("Pricing for 40 seats please".into());
        lead.ae_id = Some("ae-7".into());
        store.insert_lead(&lead).await.unwrap();
        let service = ConversionService::new(store.clone(), LeadLocks::default(), BigDecimal::from(1200));

        let result = service.convert(lead.id).await.unwrap();
        assert!(result.account_created);

        let deal = store.get_deal(result.deal_id).await.unwrap().unwrap();
        assert_eq!(deal.estimated_seats, 40);
        assert_eq!(deal.estimated_value, BigDecimal::from(48_000));
        assert_eq!(deal.owner_id.as_deref(), Some("ae-7"));

        let stored = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Converted);
        assert_eq!(stored.converted_account_id, Some(result.account_id));
        assert!(stored.converted_at.unwrap() > stored.qualified_at.unwrap());
    }

    #[tokio::test]
    async fn test_second_convert_reports_existing_links() {
        let store = Arc::new(MemoryLeadStore::new());
        let lead = qualified_lead();
        store.insert_lead(&lead).await.unwrap();
        let service = ConversionService::new(store.clone(), LeadLocks::default(), BigDecimal::from(1200));

        let first = service.convert(lead.id).await.unwrap();
        let err = service.convert(lead.id).await.unwrap_err();
        match err {
            AppError::AlreadyConverted {
                account_id,
                deal_id,
            } => {
                assert_eq!(account_id, first.account_id);
                assert_eq!(deal_id, first.deal_id);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(store.deal_count().await, 1);
    }

    #[tokio::test]
    async fn test_existing_account_is_reused() {
        let store = Arc::new(MemoryLeadStore::new());
        let first = qualified_lead();
        let mut second = qualified_lead();
        second.email = "lee@acme.io".into();
        store.insert_lead(&first).await.unwrap();
        store.insert_lead(&second).await.unwrap();
        let service = ConversionService::new(store.clone(), LeadLocks::default(), BigDecimal::from(1200));

        let a = service.convert(first.id).await.unwrap();
        let b = service.convert(second.id).await.unwrap();
        assert!(a.account_created);
        assert!(!b.account_created);
        assert_eq!(a.account_id, b.account_id);
        assert_eq!(store.account_count().await, 1);
    }

    #[tokio::test]
    async fn test_unqualified_lead_is_rejected() {
        let store = Arc::new(MemoryLeadStore::new());
        let mut lead = qualified_lead();
        lead.status = LeadStatus::SdrReview;
        lead.qualified_at = None;
        store.insert_lead(&lead).await.unwrap();
        let service = ConversionService::new(store.clone(), LeadLocks::default(), BigDecimal::from(1200));

        let err = service.convert(lead.id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(store.deal_count().await, 0);
        assert_eq!(store.account_count().await, 0);
    }
    #[tokio::test]
    async fn test_failed_commit_rolls_back_and_retry_succeeds() {
        let store = Arc::new(FailingCommitStore {
            inner: MemoryLeadStore::new(),
            failed: AtomicBool::new(false),
        });
        let lead = qualified_lead();
        store.insert_lead(&lead).await.unwrap();
        let service = ConversionService::new(store.clone(), LeadLocks::default(), BigDecimal::from(1200));

        let err = service.convert(lead.id).await.unwrap_err();
        assert!(matches!(err, AppError::Conversion(_)));

        let stored = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Qualified);
        assert_eq!(stored.converted_account_id, None);
        assert_eq!(stored.converted_deal_id, None);
        assert_eq!(stored.converted_at, None);
        assert_eq!(stored.version, lead.version);
        assert_eq!(store.inner.account_count().await, 0);
        assert_eq!(store.inner.deal_count().await, 0);

        let result = service.convert(lead.id).await.unwrap();
        assert!(result.account_created);
        let converted = store.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(converted.status, LeadStatus::Converted);
        assert_eq!(converted.converted_deal_id, Some(result.deal_id));
        assert_eq!(store.inner.account_count().await, 1);
        assert_eq!(store.inner.deal_count().await, 1);
    }
}
