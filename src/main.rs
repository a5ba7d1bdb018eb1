/// Command-line front end: ingest exports into the master file, inspect a
/// single export, or train and explain a distance model.
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use polars::prelude::DataFrame;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use golf_sim::clean::CLUB;
use golf_sim::merge::RunStatus;
use golf_sim::{
    discover_exports, filter_shots, ClubFilter, DatasetMerger, DateRange, MergeReport,
    OutlierPolicy, PolicyTable, Preprocessor, RawRecordCleaner, RunRecord, ShotRegressionModel,
};

#[derive(Debug, Parser)]
#[command(name = "golf-sim", about = "Golf simulator shot analytics")]
struct Cli {
    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the master dataset from every export in a directory
    Init {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        master: PathBuf,
    },
    /// Append exports dated on or after --since to the master dataset
    Update {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        master: PathBuf,
        /// YYYY-MM-DD; defaults to today
        #[arg(long)]
        since: Option<NaiveDate>,
    },
    /// Clean one export and print what it contains
    Clean { file: PathBuf },
    /// Train, evaluate and explain a model on the master dataset
    Train(TrainArgs),
}

#[derive(Debug, clap::Args)]
struct TrainArgs {
    #[arg(long)]
    master: PathBuf,
    #[arg(long, default_value = "Carry")]
    target: String,
    /// Extra columns to keep out of the features
    #[arg(long)]
    exclude: Vec<String>,
    /// Club codes to keep (repeatable); `All` keeps every club
    #[arg(long)]
    club: Vec<String>,
    #[arg(long, value_enum, conflicts_with = "club")]
    club_group: Option<ClubGroup>,
    #[arg(long)]
    from: Option<NaiveDate>,
    #[arg(long)]
    to: Option<NaiveDate>,
    #[arg(long, default_value_t = 5)]
    cv_folds: usize,
    #[arg(long, default_value_t = 0.3)]
    test_fraction: f64,
    #[arg(long, default_value_t = 10)]
    top_n: usize,
    /// CSV with `column,policy` rows overriding the default outlier policies
    #[arg(long)]
    policy_file: Option<PathBuf>,
    /// COLUMN=POLICY override, applied after --policy-file
    #[arg(long, value_parser = parse_policy)]
    policy: Vec<(String, OutlierPolicy)>,
    /// Write every grid candidate's cross-validation score here
    #[arg(long)]
    cv_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClubGroup {
    Irons,
    Driver,
}

fn parse_policy(s: &str) -> Result<(String, OutlierPolicy), String> {
    let (column, policy) = s
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=POLICY, got `{s}`"))?;
    Ok((column.trim().to_string(), policy.parse()?))
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn log_run(record: &RunRecord) {
    let files: Vec<String> = record
        .files_processed
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    match record.status {
        RunStatus::Success => info!(
            last_run = %record.last_run,
            status = "success",
            files_processed = ?files,
            "run record"
        ),
        RunStatus::Failure => error!(
            last_run = %record.last_run,
            status = "failure",
            error = record.error.as_deref().unwrap_or_default(),
            "run record"
        ),
    }
}

fn ingest(outcome: golf_sim::Result<MergeReport>) -> anyhow::Result<()> {
    let record = RunRecord::from_outcome(Local::now().date_naive(), &outcome);
    log_run(&record);
    let report = outcome?;
    println!(
        "Processed {} files, added {} rows ({} total)",
        report.files_processed.len(),
        report.rows_added,
        report.total_rows
    );
    Ok(())
}

fn init(dir: &Path, master: &Path) -> anyhow::Result<()> {
    let files: Vec<PathBuf> = discover_exports(dir)?.into_iter().map(|(_, p)| p).collect();
    if files.is_empty() {
        bail!("no export files found in {}", dir.display());
    }
    ingest(DatasetMerger::new(master).build(&files))
}

fn clean(file: &Path) -> anyhow::Result<()> {
    let batch = RawRecordCleaner.clean_file(file)?;
    println!("Session {} from {}", batch.timestamp, batch.source.display());
    println!("{} shots, {} columns", batch.frame.height(), batch.frame.width());
    for name in batch.frame.get_column_names_str() {
        println!("  {name}");
    }
    Ok(())
}

fn club_filter(args: &TrainArgs, data: &DataFrame) -> ClubFilter {
    match args.club_group {
        Some(ClubGroup::Driver) => ClubFilter::driver(),
        Some(ClubGroup::Irons) => match data.column(CLUB).and_then(|c| c.str()) {
            Ok(clubs) => ClubFilter::irons(clubs.into_iter().flatten()),
            Err(_) => ClubFilter::irons([]),
        },
        None => ClubFilter::from_selection(&args.club),
    }
}

fn train(args: &TrainArgs) -> anyhow::Result<()> {
    let mut policies = match &args.policy_file {
        Some(path) => PolicyTable::with_overrides_from(path)?,
        None => PolicyTable::default(),
    };
    for (column, policy) in &args.policy {
        policies.set(column.clone(), *policy);
    }

    let preprocessor = Preprocessor::with_policies(&args.master, policies);
    let data = preprocessor
        .get_data()
        .with_context(|| format!("loading {}", args.master.display()))?;

    let range = match (args.from, args.to) {
        (None, None) => None,
        (from, to) => Some(DateRange::new(
            from.unwrap_or(NaiveDate::MIN),
            to.unwrap_or(NaiveDate::MAX),
        )?),
    };
    let clubs = club_filter(args, data);
    let subset = filter_shots(data, range, &clubs)?;
    info!(rows = subset.height(), clubs = ?clubs, "selected shots");

    let mut model = ShotRegressionModel::new(&subset, &args.target, &args.exclude)?;
    let report = model.run_pipeline(args.cv_folds, args.test_fraction, args.top_n)?;

    if let Some(path) = &args.cv_log {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        for row in model.cv_results()? {
            wtr.serialize(row)?;
        }
        wtr.flush()?;
        println!("Wrote cross-validation results to {}", path.display());
    }

    let eval = report.evaluation;
    println!("\nModel for {}", model.target());
    println!("{:<30} {:>10.4}", "OOB R^2", eval.oob_score);
    println!("{:<30} {:>10.4}", "Test MSE", eval.mse);
    println!("{:<30} {:>10.4}", "Test R^2", eval.r2);

    println!("\nFeature importances:");
    for fi in &report.importances {
        println!("{:<30} {:>10.4}", fi.feature, fi.importance);
    }

    let attr = &report.attribution;
    println!("\nMean |SHAP| over {} test shots (base {:.3}):", attr.values.nrows(), attr.base_value);
    let mean_abs = attr.mean_abs();
    let mut order: Vec<usize> = (0..mean_abs.len()).collect();
    order.sort_by(|&a, &b| mean_abs[b].total_cmp(&mean_abs[a]));
    for i in order.into_iter().take(args.top_n) {
        println!("{:<30} {:>10.4}", attr.feature_names[i], mean_abs[i]);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match &cli.command {
        Command::Init { dir, master } => init(dir, master),
        Command::Update { dir, master, since } => {
            let since = since.unwrap_or_else(|| Local::now().date_naive());
            ingest(DatasetMerger::new(master).update(dir, since))
        }
        Command::Clean { file } => clean(file),
        Command::Train(args) => train(args),
    }
}

/// the test functions
#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fs::File;
    use std::io::Write;

    use golf_sim::model::DISTANCE_GROUP;
    use golf_sim::ShotError;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Four sessions of 25 shots each, in the raw export layout.
    fn write_sessions(dir: &Path) -> Result<(), Box<dyn Error>> {
        let mut rng = StdRng::seed_from_u64(11);
        let clubs = [("DR", 150.0), ("I7", 118.0), ("I9", 105.0), ("PW", 95.0)];
        for session in 0..4 {
            let path = dir.join(format!("gspro-export0{}-1{session}-24-18-30-00.csv", session + 1));
            let mut f = File::create(path)?;
            writeln!(
                f,
                "Club,BallSpeed,ClubSpeed,BackSpin,SideSpin,HLA,Carry,TotalDistance,rawCarryGame,DistanceToPin,AirTime"
            )?;
            for shot in 0..25 {
                let (club, speed) = clubs[(shot + session) % clubs.len()];
                let ball: f64 = speed + rng.random_range(-6.0..6.0);
                let spin: f64 = rng.random_range(2500.0..7500.0);
                let side: f64 = rng.random_range(-600.0..600.0);
                let hla: f64 = rng.random_range(-4.0..4.0);
                let carry = 1.55 * ball - spin / 900.0 + rng.random_range(-2.0..2.0);
                let pin = if shot % 2 == 0 {
                    format!("{:.0} ft", rng.random_range(3.0..60.0))
                } else {
                    format!("{:.0} yds", rng.random_range(1.0..20.0))
                };
                writeln!(
                    f,
                    "{club},{ball:.1},{:.1},{spin:.0},{side:.0},{hla:.1},{carry:.1},{:.1},{:.1},{pin},0",
                    ball / 1.4,
                    carry * 1.07,
                    carry + 0.4,
                )?;
            }
        }
        Ok(())
    }

    /// END TO END: raw exports -> master -> cleaned data -> fitted model
    #[test]
    fn test_pipeline_on_one_hundred_shots() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        write_sessions(dir.path())?;
        let master = dir.path().join("master.csv");
        init(dir.path(), &master)?;

        let preprocessor = Preprocessor::new(&master);
        let data = preprocessor.get_data()?;
        assert!(data.column("AirTime").is_err(), "all-zero column survived cleaning");
        assert!(data.height() <= 100);

        let mut model = ShotRegressionModel::new(data, "Carry", &[])?;
        for leaky in DISTANCE_GROUP {
            assert!(!model.feature_names().iter().any(|f| f == leaky));
        }
        let report = model.run_pipeline(5, 0.3, 5)?;

        let eval = report.evaluation;
        assert!(eval.r2 <= 1.0);
        assert!(eval.mse >= 0.0);
        assert!(eval.oob_score <= 1.0);

        let top = &report.importances;
        assert_eq!(top.len(), 5);
        assert!(top.windows(2).all(|w| w[0].importance >= w[1].importance));
        assert!(top.iter().map(|f| f.importance).sum::<f64>() <= 1.0 + 1e-9);
        assert!(!top.iter().any(|f| DISTANCE_GROUP.contains(&f.feature.as_str())));

        let n_test = model.split_data()?.y_test.len();
        assert_eq!(report.attribution.values.nrows(), n_test);
        Ok(())
    }

    /// INGEST: update only picks up sessions on or after the cutoff
    #[test]
    fn test_update_appends_recent_sessions() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        write_sessions(dir.path())?;
        let master = dir.path().join("master.csv");
        let merger = DatasetMerger::new(&master);

        let first: Vec<PathBuf> = discover_exports(dir.path())?
            .into_iter()
            .take(2)
            .map(|(_, p)| p)
            .collect();
        merger.build(&first)?;

        let report = merger.update(dir.path(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())?;
        assert_eq!(report.files_processed.len(), 2);
        assert_eq!(report.rows_added, 50);
        assert_eq!(report.total_rows, 100);
        Ok(())
    }

    /// INGEST: a failed run yields a failure record with no files
    #[test]
    fn test_failed_init_records_failure() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let bad = dir.path().join("gspro-export01-10-24-18-30-00.csv");
        std::fs::write(&bad, "Club,Carry\nDR,230\n")?;
        let outcome = DatasetMerger::new(dir.path().join("master.csv")).build(&[bad]);
        assert!(matches!(outcome, Err(ShotError::Schema { .. })));

        let record = RunRecord::from_outcome(NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(), &outcome);
        assert_eq!(record.status, RunStatus::Failure);
        assert!(record.files_processed.is_empty());
        Ok(())
    }

    /// TRAIN: driver-only subset still trains
    #[test]
    fn test_club_group_filters_before_training() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        write_sessions(dir.path())?;
        let master = dir.path().join("master.csv");
        init(dir.path(), &master)?;
        let data = Preprocessor::new(&master).load()?;

        let irons = ClubFilter::irons(["I7", "I9", "DR", "PW"]);
        let subset = filter_shots(&data, None, &irons)?;
        let clubs = subset.column(CLUB)?.str()?;
        assert!(clubs.into_iter().flatten().all(|c| c.starts_with('I')));
        assert_eq!(subset.height(), 50);
        Ok(())
    }

    #[test]
    fn test_parse_policy_override() {
        assert_eq!(
            parse_policy("Carry=both").unwrap(),
            ("Carry".to_string(), OutlierPolicy::Both)
        );
        assert!(parse_policy("Carry").is_err());
        assert!(parse_policy("Carry=sideways").is_err());
    }

    #[test]
    fn test_cli_parses_train_flags() {
        let cli = Cli::try_parse_from([
            "golf-sim", "train", "--master", "m.csv", "--target", "TotalDistance", "--club", "DR",
            "--policy", "Carry=upper", "--from", "2024-01-01",
        ])
        .unwrap();
        match cli.command {
            Command::Train(args) => {
                assert_eq!(args.target, "TotalDistance");
                assert_eq!(args.club, vec!["DR"]);
                assert_eq!(args.cv_folds, 5);
                assert_eq!(args.policy, vec![("Carry".to_string(), OutlierPolicy::Upper)]);
                assert_eq!(args.from, NaiveDate::from_ymd_opt(2024, 1, 1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
