use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mockable::DefaultClock;

use esi_sync::config;
use esi_sync::esi::{Endpoint, EsiClient, RateBudget};
use esi_sync::resilience::TokioSleeper;

/// Fetch one ESI page and print what came back.
#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Route relative to the ESI base, e.g. `universe/stations/60003760/`
    #[arg(long)]
    path: String,

    /// Page number for paginated routes
    #[arg(long)]
    page: Option<u32>,

    /// Bearer token for authenticated routes
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let budget = Arc::new(RateBudget::new(
        cfg.esi.low_water_mark,
        Arc::new(DefaultClock),
        Arc::new(TokioSleeper),
    ));
    let client = EsiClient::new(&cfg, budget, None)?;
    let endpoint = Endpoint::public(args.path.clone());

    let page = client
        .fetch_page(&endpoint, args.page, args.token.as_deref())
        .await?;
    println!("Path: {}", endpoint.path);
    println!("Records: {}", page.records.len());
    println!("Pages: {}", page.total_pages);
    println!("Rate limit:");
    println!("  remaining -> {:?}", page.signal.remaining);
    println!("  reset in  -> {:?}", page.signal.reset_in);
    println!("  budget    -> {:?} left", client.budget().remaining());
    println!("  next wait -> {:?}", client.budget().current_delay());
    if let Some(first) = page.records.first() {
        println!("First record:");
        println!("{}", serde_json::to_string_pretty(first)?);
    }
    Ok(())
}
