use arcade_memorial::config::AppConfig;
use arcade_memorial::services::memorial_card::MemorialCardService;
use arcade_memorial::services::recovery;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Regenerate memorial cards for sessions that have a `result.json` but no card.
#[derive(Parser, Debug)]
#[command(name = "backfill", version)]
struct Args {
    /// Only list the sessions missing a card.
    #[arg(long)]
    dry_run: bool,

    /// Results directory to scan. Defaults to `RESULTS_DIR`.
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let results_dir = args.results_dir.unwrap_or_else(|| config.results_dir.clone());

    tracing::info!(
        results_dir = %results_dir.display(),
        dry_run = args.dry_run,
        "Starting memorial card backfill"
    );

    let service = MemorialCardService::from_config(&config.memorial_card());
    let report = recovery::recover_missing_cards(&service, &results_dir, args.dry_run)
        .await
        .expect("Failed to scan results directory");

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("Failed to encode report")
    );

    if !report.failed.is_empty() {
        tracing::error!(failed = report.failed.len(), "Some memorial cards could not be regenerated");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_and_results_dir_flags() {
        let args = Args::try_parse_from(["backfill", "--dry-run", "--results-dir", "/srv/results"]).unwrap();
        assert!(args.dry_run);
        assert_eq!(args.results_dir, Some(PathBuf::from("/srv/results")));

        let args = Args::try_parse_from(["backfill"]).unwrap();
        assert!(!args.dry_run);
        assert!(args.results_dir.is_none());
    }

    #[test]
    fn test_unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["backfill", "--dryrun"]).is_err());
        assert!(Args::try_parse_from(["backfill", "extra"]).is_err());
    }
}
