//! The lead store contract and its in-memory implementation.
//!
//! Every lead write is version-checked: `update_lead` only succeeds when the
//! caller's `lead.version` still matches what is stored, and bumps it. Writers
//! therefore always read-modify-write a fresh copy and never blind-overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::AppError;
use crate::metrics::MetricsRow;
use crate::models::{Account, AutoResponse, Deal, Lead, LeadPage, LeadQuery, LeadStatus};

#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn insert_lead(&self, lead: &Lead) -> Result<(), AppError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError>;

    /// Most recent non-disqualified lead with this email/company key received
    /// at or after `since`.
    async fn find_open_duplicate(
        &self,
        email: &str,
        company_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Lead>, AppError>;

    /// Writes `lead` if the stored version equals `lead.version`; returns the
    /// stored copy with the bumped version. `Conflict` otherwise.
    async fn update_lead(&self, lead: &Lead) -> Result<Lead, AppError>;

    async fn list_leads(&self, query: &LeadQuery) -> Result<LeadPage, AppError>;

    /// Inserts `response` and writes `lead` (version-checked) atomically.
    /// `Ok(None)` when the idempotency key is already recorded; nothing is
    /// written in that case.
    async fn record_auto_response(
        &self,
        response: &AutoResponse,
        lead: &Lead,
    ) -> Result<Option<Lead>, AppError>;

    async fn auto_responses(&self, lead_id: Uuid) -> Result<Vec<AutoResponse>, AppError>;

    async fn find_account(&self, account_key: &str) -> Result<Option<Account>, AppError>;

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, AppError>;

    /// Inserts `new_account` (when given), `deal`, and writes `lead` in one
    /// transaction. Any failure leaves all three untouched.
    async fn commit_conversion(
        &self,
        new_account: Option<&Account>,
        deal: &Deal,
        lead: &Lead,
    ) -> Result<Lead, AppError>;

    /// Consistent snapshot of leads received at or after `since`.
    async fn metrics_rows(&self, since: DateTime<Utc>) -> Result<Vec<MetricsRow>, AppError>;
}

#[derive(Default)]
struct MemoryState {
    leads: HashMap<Uuid, Lead>,
    responses: HashMap<Uuid, Vec<AutoResponse>>,
    response_keys: HashSet<String>,
    accounts: HashMap<String, Account>,
    deals: HashMap<Uuid, Deal>,
}

/// Process-local store used by tests and database-less deployments.
#[derive(Default)]
pub struct MemoryLeadStore {
    state: RwLock<MemoryState>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn account_count(&self) -> usize {
        self.state.read().await.accounts.len()
    }

    pub async fn deal_count(&self) -> usize {
        self.state.read().await.deals.len()
    }
}

fn check_version(stored: &Lead, incoming: &Lead) -> Result<(), AppError> {
    if stored.version != incoming.version {
        return Err(AppError::Conflict(format!(
            "lead {} was modified concurrently (stored version {}, write based on {})",
            incoming.id, stored.version, incoming.version
        )));
    }
    Ok(())
}

fn bumped(lead: &Lead) -> Lead {
    let mut next = lead.clone();
    next.version += 1;
    next.updated_at = Utc::now();
    next
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn insert_lead(&self, lead: &Lead) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if state.leads.contains_key(&lead.id) {
            return Err(AppError::Conflict(format!("lead {} already exists", lead.id)));
        }
        state.leads.insert(lead.id, lead.clone());
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, AppError> {
        Ok(self.state.read().await.leads.get(&id).cloned())
    }

    async fn find_open_duplicate(
        &self,
        email: &str,
        company_key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Lead>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .leads
            .values()
            .filter(|l| {
                l.email == email
                    && l.company_key == company_key
                    && l.received_at >= since
                    && l.status != LeadStatus::Disqualified
            })
            .max_by_key(|l| l.received_at)
            .cloned())
    }

    async fn update_lead(&self, lead: &Lead) -> Result<Lead, AppError> {
        let mut state = self.state.write().await;
        let stored = state
            .leads
            .get(&lead.id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead.id)))?;
        check_version(stored, lead)?;
        let next = bumped(lead);
        state.leads.insert(lead.id, next.clone());
        Ok(next)
    }

    async fn list_leads(&self, query: &LeadQuery) -> Result<LeadPage, AppError> {
        let state = self.state.read().await;
        let mut matching: Vec<&Lead> = state.leads.values().filter(|l| query.matches(l)).collect();
        matching.sort_by(|a, b| b.received_at.cmp(&a.received_at).then(a.id.cmp(&b.id)));

        let total = matching.len() as u64;
        let leads = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.per_page() as usize)
            .cloned()
            .collect();

        Ok(LeadPage {
            leads,
            total,
            page: query.page(),
            per_page: query.per_page(),
        })
    }

    async fn record_auto_response(
        &self,
        response: &AutoResponse,
        lead: &Lead,
    ) -> Result<Option<Lead>, AppError> {
        let mut state = self.state.write().await;
        if state.response_keys.contains(&response.idempotency_key) {
            return Ok(None);
        }
        let stored = state
            .leads
            .get(&lead.id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead.id)))?;
        check_version(stored, lead)?;

        let next = bumped(lead);
        state.response_keys.insert(response.idempotency_key.clone());
        state
            .responses
            .entry(response.lead_id)
            .or_default()
            .push(response.clone());
        state.leads.insert(lead.id, next.clone());
        Ok(Some(next))
    }

    async fn auto_responses(&self, lead_id: Uuid) -> Result<Vec<AutoResponse>, AppError> {
        let state = self.state.read().await;
        Ok(state.responses.get(&lead_id).cloned().unwrap_or_default())
    }

    async fn find_account(&self, account_key: &str) -> Result<Option<Account>, AppError> {
        Ok(self.state.read().await.accounts.get(account_key).cloned())
    }

    async fn get_deal(&self, id: Uuid) -> Result<Option<Deal>, AppError> {
        Ok(self.state.read().await.deals.get(&id).cloned())
    }

    async fn commit_conversion(
        &self,
        new_account: Option<&Account>,
        deal: &Deal,
        lead: &Lead,
    ) -> Result<Lead, AppError> {
        let mut state = self.state.write().await;

        // Validate everything before the first mutation.
        let stored = state
            .leads
            .get(&lead.id)
            .ok_or_else(|| AppError::NotFound(format!("Lead {} not found", lead.id)))?;
        check_version(stored, lead)?;
        if let Some(account) = new_account {
            if state.accounts.contains_key(&account.account_key) {
                return Err(AppError::Conversion(format!(
                    "account '{}' was created concurrently",
                    account.account_key
                )));
            }
        } else if !state.accounts.values().any(|a| a.id == deal.account_id) {
            return Err(AppError::Conversion(format!(
                "account {} does not exist",
                deal.account_id
            )));
        }
        if state.deals.values().any(|d| d.lead_id == deal.lead_id) {
            return Err(AppError::Conversion(format!(
                "lead {} already has a deal",
                deal.lead_id
            )));
        }

        if let Some(account) = new_account {
            state
                .accounts
                .insert(account.account_key.clone(), account.clone());
        }
        state.deals.insert(deal.id, deal.clone());
        let next = bumped(lead);
        state.leads.insert(lead.id, next.clone());
        Ok(next)
    }

    async fn metrics_rows(&self, since: DateTime<Utc>) -> Result<Vec<MetricsRow>, AppError> {
        let state = self.state.read().await;
        Ok(state
            .leads
            .values()
            .filter(|l| l.received_at >= since)
            .map(MetricsRow::from)
            .collect())
    }
}
