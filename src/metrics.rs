//! Rolling pipeline metrics, recomputed from a store snapshot on every read.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::AppError;
use crate::models::{Lead, LeadSource, LeadStatus};
use crate::store::LeadStore;

/// The slice of a lead the aggregator needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MetricsRow {
    pub received_at: DateTime<Utc>,
    pub source: LeadSource,
    pub status: LeadStatus,
    pub score_provisional: bool,
    pub response_sent: bool,
    pub response_time_ms: Option<i64>,
    pub qualified_at: Option<DateTime<Utc>>,
    pub converted_at: Option<DateTime<Utc>>,
}

impl From<&Lead> for MetricsRow {
    fn from(lead: &Lead) -> Self {
        Self {
            received_at: lead.received_at,
            source: lead.source,
            status: lead.status,
            score_provisional: lead.score_provisional,
            response_sent: lead.response_sent,
            response_time_ms: lead.response_time_ms,
            qualified_at: lead.qualified_at,
            converted_at: lead.converted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowMetrics {
    pub from: DateTime<Utc>,
    pub lead_count: u64,
    /// Mean first-response latency over leads that have one.
    pub avg_first_response_ms: Option<f64>,
    /// Percent of leads with a recorded AutoResponse.
    pub auto_response_rate: f64,
    /// Percent of responded leads whose first response met the SLA.
    pub sla_met_rate: Option<f64>,
    /// Percent of non-`new` leads that reached qualified or converted.
    pub qualification_rate: f64,
    /// Percent of qualified leads that reached converted.
    pub conversion_rate: f64,
    pub provisional_scores: u64,
    pub by_status: BTreeMap<LeadStatus, u64>,
    pub by_source: BTreeMap<LeadSource, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub generated_at: DateTime<Utc>,
    pub sla_ms: i64,
    pub today: WindowMetrics,
    pub trailing: WindowMetrics,
    pub trailing_days: i64,
}

#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    sla: Duration,
    trailing: chrono::Duration,
}

impl MetricsAggregator {
    pub fn new(sla: Duration) -> Self {
        Self {
            sla,
            trailing: chrono::Duration::days(30),
        }
    }

    pub fn with_trailing_window(mut self, trailing: chrono::Duration) -> Self {
        self.trailing = trailing;
        self
    }

    /// Start of the current UTC calendar day.
    pub fn today_start(now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive().and_time(NaiveTime::MIN).and_utc()
    }

    /// Earliest `received_at` either window looks at.
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        (now - self.trailing).min(Self::today_start(now))
    }

    /// Reads a snapshot from the store and computes both windows.
    pub async fn collect(
        &self,
        store: &Arc<dyn LeadStore>,
        now: DateTime<Utc>,
    ) -> Result<PipelineMetrics, AppError> {
        let rows = store.metrics_rows(self.horizon(now)).await?;
        tracing::debug!("Computing metrics over {} lead rows", rows.len());
        Ok(self.compute(&rows, now))
    }

    pub fn compute(&self, rows: &[MetricsRow], now: DateTime<Utc>) -> PipelineMetrics {
        let sla_ms = self.sla.as_millis() as i64;
        PipelineMetrics {
            generated_at: now,
            sla_ms,
            today: summarize(rows, Self::today_start(now), now, sla_ms),
            trailing: summarize(rows, now - self.trailing, now, sla_ms),
            trailing_days: self.trailing.num_days(),
        }
    }
}

fn summarize(
    rows: &[MetricsRow],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    sla_ms: i64,
) -> WindowMetrics {
    let window: Vec<&MetricsRow> = rows
        .iter()
        .filter(|row| row.received_at >= from && row.received_at <= to)
        .collect();

    let latencies: Vec<i64> = window.iter().filter_map(|r| r.response_time_ms).collect();
    let avg_first_response_ms = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<i64>() as f64 / latencies.len() as f64)
    };
    let sla_met_rate = if latencies.is_empty() {
        None
    } else {
        let met = latencies.iter().filter(|ms| **ms <= sla_ms).count();
        Some(percent(met, latencies.len()))
    };

    let responded = window.iter().filter(|r| r.response_sent).count();
    let progressed = window.iter().filter(|r| r.status != LeadStatus::New).count();
    let reached_qualified = window
        .iter()
        .filter(|r| matches!(r.status, LeadStatus::Qualified | LeadStatus::Converted))
        .count();
    let converted = window
        .iter()
        .filter(|r| r.status == LeadStatus::Converted)
        .count();

    let mut by_status = BTreeMap::new();
    let mut by_source = BTreeMap::new();
    for row in &window {
        *by_status.entry(row.status).or_insert(0) += 1;
        *by_source.entry(row.source).or_insert(0) += 1;
    }

    WindowMetrics {
        from,
        lead_count: window.len() as u64,
        avg_first_response_ms,
        auto_response_rate: percent(responded, window.len()),
        sla_met_rate,
        qualification_rate: percent(reached_qualified, progressed),
        conversion_rate: percent(converted, reached_qualified),
        provisional_scores: window.iter().filter(|r| r.score_provisional).count() as u64,
        by_status,
        by_source,
    }
}

/// Percentage rounded to one decimal; zero when the denominator is empty.
fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 * 1000.0 / whole as f64).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(received_at: DateTime<Utc>, status: LeadStatus, response_ms: Option<i64>) -> MetricsRow {
        MetricsRow {
            received_at,
            source: LeadSource::WebsiteForm,
            status,
            score_provisional: false,
            response_sent: response_ms.is_some(),
            response_time_ms: response_ms,
            qualified_at: None,
            converted_at: None,
        }
    }

    #[test]
    fn test_today_and_trailing_windows() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap();
        let rows = vec![
            row(now - chrono::Duration::hours(2), LeadStatus::AutoResponded, Some(4_000)),
            row(now - chrono::Duration::hours(1), LeadStatus::New, None),
            row(now - chrono::Duration::days(3), LeadStatus::Qualified, Some(40_000)),
            row(now - chrono::Duration::days(5), LeadStatus::Converted, Some(10_000)),
            row(now - chrono::Duration::days(45), LeadStatus::Converted, Some(1_000)),
        ];

        let metrics = MetricsAggregator::new(Duration::from_secs(30)).compute(&rows, now);

        assert_eq!(metrics.today.lead_count, 2);
        assert_eq!(metrics.today.avg_first_response_ms, Some(4_000.0));
        assert_eq!(metrics.today.auto_response_rate, 50.0);

        assert_eq!(metrics.trailing.lead_count, 4);
        assert_eq!(metrics.trailing.avg_first_response_ms, Some(18_000.0));
        // 3 non-new leads, 2 reached qualified/converted
        assert_eq!(metrics.trailing.qualification_rate, 66.7);
        // 2 qualified-or-beyond, 1 converted
        assert_eq!(metrics.trailing.conversion_rate, 50.0);
        // 40s response missed the 30s SLA
        assert_eq!(metrics.trailing.sla_met_rate, Some(66.7));
    }

    #[test]
    fn test_missing_timestamps_are_excluded_not_errors() {
        let now = Utc::now();
        let rows = vec![row(now, LeadStatus::New, None)];
        let metrics = MetricsAggregator::new(Duration::from_secs(30)).compute(&rows, now);

        assert_eq!(metrics.today.lead_count, 1);
        assert_eq!(metrics.today.avg_first_response_ms, None);
        assert_eq!(metrics.today.sla_met_rate, None);
        assert_eq!(metrics.today.qualification_rate, 0.0);
        assert_eq!(metrics.today.conversion_rate, 0.0);
    }

    #[test]
    fn test_empty_store() {
        let metrics = MetricsAggregator::new(Duration::from_secs(30)).compute(&[], Utc::now());
        assert_eq!(metrics.today.lead_count, 0);
        assert_eq!(metrics.trailing.auto_response_rate, 0.0);
    }
}
