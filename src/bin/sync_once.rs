//! One-shot sync runner.
//!
//! Runs a single reconciliation batch and prints the aggregate report as
//! JSON. Exists for manual and gap-fill windows:
//!
//!   funnelsync-sync --reason gap-fill --from 2026-01-01 --to 2026-02-01
//!   funnelsync-sync --project p1

use chrono::NaiveDate;

use funnelsync::config::AppConfig;
use funnelsync::reconcile::sync_batch;
use funnelsync::state::AppState;
use funnelsync::types::SyncRequest;

const USAGE: &str = "Usage: funnelsync-sync [--project <id>] [--from YYYY-MM-DD] \
                     [--to YYYY-MM-DD] [--reason incremental|manual|gap-fill]";

fn parse_args(args: &[String]) -> Result<SyncRequest, String> {
    let mut request = SyncRequest {
        trigger_reason: Some("manual".to_string()),
        ..Default::default()
    };

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| format!("{} requires a value\n{}", flag, USAGE))?;
        match flag.as_str() {
            "--project" => request.project_id = Some(value.clone()),
            "--from" => request.start_date = Some(parse_date(value)?),
            "--to" => request.end_date = Some(parse_date(value)?),
            "--reason" => request.trigger_reason = Some(value.clone()),
            other => return Err(format!("Unknown flag: {}\n{}", other, USAGE)),
        }
    }
    Ok(request)
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}', expected YYYY-MM-DD", value))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let request = match parse_args(&args) {
        Ok(request) => request,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let config = AppConfig::load();
    let state = AppState::new(config);
    let db = match state.open_db() {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let response = sync_batch(&db, &state.config, &request).await;
    match serde_json::to_string_pretty(&response) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize response: {}", e),
    }

    std::process::exit(if response.success { 0 } else { 1 });
}
