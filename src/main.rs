use anyhow::{Context, Result};
use attendance_core::{
    report::ReportQuery, AttendanceEngine, CsvPunchSource, EngineConfig, Employee, GroupBy, ImportMode,
    LeaveAllocation, PunchSource,
};
use chrono::NaiveDate;
use chrono_tz::Tz;
use clap::Parser;
use serde::Deserialize;
use std::{collections::BTreeSet, path::PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Imports a punch export, reconciles the days it covers and prints the results as JSON.
#[derive(Parser, Debug)]
#[command(name = "attendance-core", version, about)]
struct Cli {
    /// JSON file with `employees`, `allocations` and `holidays`.
    #[arg(long)]
    roster: PathBuf,

    /// CSV with `identifier,timestamp[,punch_type]` rows.
    #[arg(long)]
    punches: PathBuf,

    /// Zone of the CSV timestamps; defaults to the business zone.
    #[arg(long)]
    device_tz: Option<String>,

    /// Watermark key for this source; defaults to the file path.
    #[arg(long)]
    source_key: Option<String>,

    /// Re-pull everything in the range instead of only punches past the watermark.
    #[arg(long)]
    force: bool,

    #[arg(long)]
    from: Option<NaiveDate>,

    #[arg(long)]
    to: Option<NaiveDate>,

    /// employee, department, month or week
    #[arg(long, default_value = "employee")]
    group_by: GroupBy,
}

#[derive(Debug, Deserialize)]
struct Roster {
    employees: Vec<Employee>,
    #[serde(default)]
    allocations: Vec<LeaveAllocation>,
    #[serde(default)]
    holidays: Vec<NaiveDate>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::from_env().context("Failed to load ATTENDANCE_* configuration")?;
    let device_tz: Tz = match &cli.device_tz {
        Some(name) => name
            .parse::<Tz>()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid device time zone '{}'", name))?,
        None => config.business_tz(),
    };
    let engine = AttendanceEngine::with_defaults(config)?;

    let raw_roster = tokio::fs::read_to_string(&cli.roster)
        .await
        .with_context(|| format!("Failed to read roster {}", cli.roster.display()))?;
    let roster: Roster = serde_json::from_str(&raw_roster).context("Failed to parse roster JSON")?;
    for employee in roster.employees {
        engine.configure_employee(employee)?;
    }
    for date in roster.holidays {
        engine.configure_holiday(date);
    }
    for allocation in roster.allocations {
        engine.add_allocation(allocation)?;
    }

    let mut source = CsvPunchSource::new(&cli.punches, device_tz);
    if let Some(key) = &cli.source_key {
        source = source.with_key(key);
    }
    let mode = if cli.force {
        ImportMode::ForcedReload {
            from: cli.from,
            to: cli.to,
        }
    } else {
        ImportMode::Incremental
    };
    let request = source
        .pull(mode.clone())
        .await
        .with_context(|| format!("Failed to read punches from {}", cli.punches.display()))?;

    let days: BTreeSet<NaiveDate> = request
        .punches
        .iter()
        .map(|p| p.instant.with_timezone(&device_tz).date_naive())
        .filter(|date| mode.in_range(*date))
        .collect();

    let import = engine.import_punches(request);
    let daily: Vec<_> = days.iter().map(|date| engine.run_daily(*date)).collect();
    info!("Reconciled {} local days", daily.len());

    let query = ReportQuery {
        from: cli.from.or_else(|| days.first().copied()),
        to: cli.to.or_else(|| days.last().copied()),
        group_by: cli.group_by,
        ..ReportQuery::default()
    };
    let report = engine.report(&query);

    let output = serde_json::json!({
        "import": import,
        "daily": daily,
        "report": report,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
