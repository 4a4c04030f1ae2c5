//! Prints the rolling pipeline metrics from the database.

use dotenvy::dotenv;
use lead_engine::config::EngineSettings;
use lead_engine::db::Database;
use lead_engine::db_storage::PgLeadStore;
use lead_engine::metrics::{MetricsAggregator, WindowMetrics};
use lead_engine::store::LeadStore;
use std::env;
use std::sync::Arc;

fn print_window(label: &str, window: &WindowMetrics) {
    println!("{} (since {})", label, window.from.format("%Y-%m-%d %H:%M UTC"));
    println!("  leads:                {}", window.lead_count);
    match window.avg_first_response_ms {
        Some(ms) => println!("  avg first response:   {:.0} ms", ms),
        None => println!("  avg first response:   -"),
    }
    println!("  auto-response rate:   {:.1}%", window.auto_response_rate);
    match window.sla_met_rate {
        Some(rate) => println!("  SLA met:              {:.1}%", rate),
        None => println!("  SLA met:              -"),
    }
    println!("  qualification rate:   {:.1}%", window.qualification_rate);
    println!("  conversion rate:      {:.1}%", window.conversion_rate);
    println!("  provisional scores:   {}", window.provisional_scores);
    for (status, count) in &window.by_status {
        println!("    {:<16} {}", status.as_str(), count);
    }
    for (source, count) in &window.by_source {
        println!("    {:<16} {}", source.as_str(), count);
    }
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let database_url = env::var("DB_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let db = Database::new(&database_url).await?;
    let store: Arc<dyn LeadStore> = Arc::new(PgLeadStore::new(db.pool));

    let settings = EngineSettings::from_env()?;
    let metrics = MetricsAggregator::new(settings.response_sla)
        .collect(&store, chrono::Utc::now())
        .await?;

    println!("Pipeline metrics (SLA {} ms)", metrics.sla_ms);
    println!();
    print_window("Today", &metrics.today);
    print_window(
        &format!("Trailing {} days", metrics.trailing_days),
        &metrics.trailing,
    );

    Ok(())
}
