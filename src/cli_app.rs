//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, TimeDelta, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use endolla_watcher::analytics::rules::{self, RuleThresholds};
use endolla_watcher::analytics::utilization::{MemberReport, UtilizationSummary};
use endolla_watcher::core::config::Config;
use endolla_watcher::core::errors::EwError;
use endolla_watcher::core::window::{Granularity, TimeWindow, format_ts};
use endolla_watcher::daemon::loop_main::IngestDaemon;
use endolla_watcher::daemon::signals::SignalHandler;
use endolla_watcher::engine::Engine;
use endolla_watcher::feed::{BatchSource, FileSource};
use endolla_watcher::logger::activity::{
    ActivityLoggerHandle, LoggerConfig, spawn_logger,
};
use endolla_watcher::model::{Observed, PortKey, Scope, StationKey};

/// Endolla Watcher: coverage-aware analytics for EV charging ports.
#[derive(Debug, Parser)]
#[command(
    name = "endolla",
    author,
    version,
    about = "Endolla Watcher - EV charger telemetry analytics",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Ingest one feed document.
    Ingest(IngestArgs),
    /// Utilization summary for a scope and window.
    Summarize(SummarizeArgs),
    /// Outages, MTTR and MTBF.
    Reliability(ReliabilityArgs),
    /// Weekly hour-of-week fingerprint for a station.
    Fingerprint(FingerprintArgs),
    /// Evaluate problematic-port rules.
    Rules(RulesArgs),
    /// Current status of every port.
    Status(StatusArgs),
    /// Recent sessions and session statistics.
    Sessions(SessionsArgs),
    /// Delete snapshots older than the retention horizon.
    Prune,
    /// Reclaim free pages in the snapshot store.
    Compact,
    /// Snapshot store diagnostics.
    DbStats,
    /// Run the ingestion daemon.
    Daemon(DaemonArgs),
    /// View configuration state.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScopeKind {
    Network,
    Location,
    Station,
    Port,
}

#[derive(Debug, Clone, Args)]
struct ScopeArgs {
    /// Aggregation scope.
    #[arg(long, value_enum, default_value = "network")]
    scope: ScopeKind,
    /// Location identifier.
    #[arg(long, value_name = "ID")]
    location: Option<String>,
    /// Station identifier within the location.
    #[arg(long, value_name = "ID")]
    station: Option<String>,
    /// Port identifier within the station.
    #[arg(long, value_name = "ID")]
    port: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct WindowArgs {
    /// Trailing window ending now (e.g. 24h, 7d).
    #[arg(long, value_name = "DURATION", conflicts_with = "start")]
    window: Option<String>,
    /// Window start (RFC 3339).
    #[arg(long, value_name = "RFC3339")]
    start: Option<String>,
    /// Window end (RFC 3339); defaults to now.
    #[arg(long, value_name = "RFC3339", requires = "start")]
    end: Option<String>,
    /// Evaluate as of this instant instead of the wall clock.
    #[arg(long, value_name = "RFC3339")]
    at: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct IngestArgs {
    /// Feed document to ingest.
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
    /// Fetch time to stamp on every snapshot (RFC 3339); defaults to now.
    #[arg(long, value_name = "RFC3339")]
    at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BucketArg {
    Hour,
    Day,
    /// Hourly up to a week, daily beyond.
    Auto,
}

impl BucketArg {
    fn granularity(self, window: TimeWindow) -> Granularity {
        match self {
            Self::Hour => Granularity::Hour,
            Self::Day => Granularity::Day,
            Self::Auto => Granularity::for_span(window.duration()),
        }
    }
}

#[derive(Debug, Clone, Args)]
struct SummarizeArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[command(flatten)]
    window: WindowArgs,
    /// Emit one summary per bucket instead of a single total.
    #[arg(long, value_enum)]
    bucket: Option<BucketArg>,
}

#[derive(Debug, Clone, Args)]
struct ReliabilityArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[command(flatten)]
    window: WindowArgs,
}

#[derive(Debug, Clone, Args)]
struct FingerprintArgs {
    /// Location identifier.
    #[arg(long, value_name = "ID")]
    location: String,
    /// Station identifier.
    #[arg(long, value_name = "ID")]
    station: String,
    /// Evaluate as of this instant instead of the wall clock.
    #[arg(long, value_name = "RFC3339")]
    at: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct RulesArgs {
    /// Flag ports with no session in this many days.
    #[arg(long, value_name = "DAYS")]
    unused_days: Option<u64>,
    /// Flag ports with no long session in this many days.
    #[arg(long, value_name = "DAYS")]
    long_session_days: Option<u64>,
    /// Minimum duration of a long session.
    #[arg(long, value_name = "MINUTES")]
    long_session_min_minutes: Option<u64>,
    /// Flag ports unavailable for at least this many hours.
    #[arg(long, value_name = "HOURS")]
    unavailable_hours: Option<u64>,
    /// Also count unused ports and stations over these day windows.
    #[arg(long, value_name = "DAYS", value_delimiter = ',')]
    unused_windows: Vec<u64>,
    /// Evaluate as of this instant instead of the wall clock.
    #[arg(long, value_name = "RFC3339")]
    at: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct StatusArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    /// Evaluate staleness as of this instant instead of the wall clock.
    #[arg(long, value_name = "RFC3339")]
    at: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct SessionsArgs {
    #[command(flatten)]
    scope: ScopeArgs,
    #[command(flatten)]
    window: WindowArgs,
    /// Sessions listed per port.
    #[arg(long, default_value_t = 5)]
    limit: usize,
}

#[derive(Debug, Clone, Args)]
struct DaemonArgs {
    /// Feed file to re-read every cycle; overrides `ingest.feed_file`.
    #[arg(long, value_name = "PATH")]
    feed: Option<PathBuf>,
    /// Stop after this many fetch cycles.
    #[arg(long, value_name = "N")]
    cycles: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path.
    Path,
    /// Print the effective configuration.
    Show,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// Result printed, but some scope members could not be read.
    #[error("{0}")]
    Partial(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Partial(_) => 4,
        }
    }
}

impl From<EwError> for CliError {
    fn from(err: EwError) -> Self {
        match err {
            EwError::InvalidConfig { .. }
            | EwError::MissingConfig { .. }
            | EwError::ConfigParse { .. }
            | EwError::InvalidWindow { .. } => Self::User(err.to_string()),
            EwError::Serialization { .. } => Self::Internal(err.to_string()),
            _ => Self::Runtime(err.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Ingest(args) => run_ingest(cli, args),
        Command::Summarize(args) => run_summarize(cli, args),
        Command::Reliability(args) => run_reliability(cli, args),
        Command::Fingerprint(args) => run_fingerprint(cli, args),
        Command::Rules(args) => run_rules(cli, args),
        Command::Status(args) => run_status(cli, args),
        Command::Sessions(args) => run_sessions(cli, args),
        Command::Prune => run_prune(cli),
        Command::Compact => run_compact(cli),
        Command::DbStats => run_db_stats(cli),
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

// ──────────────────── engine lifecycle ────────────────────

/// Engine plus the logger thread behind its activity handle.
struct Session {
    config: Config,
    engine: Arc<Engine>,
    logger: ActivityLoggerHandle,
    logger_join: JoinHandle<()>,
}

impl Session {
    fn open(cli: &Cli) -> Result<Self, CliError> {
        let config = Config::load(cli.config.as_deref())?;
        let (logger, logger_join) = spawn_logger(LoggerConfig::at(&config.paths.activity_log))?;
        let engine = Engine::open(&config, logger.clone())?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
            logger,
            logger_join,
        })
    }

    /// Flush the activity log before the process exits.
    fn close(self) {
        drop(self.engine);
        self.logger.shutdown();
        if self.logger_join.join().is_err() {
            eprintln!("[EW-CLI] logger thread panicked");
        }
    }
}

/// Run `f` against an open engine, closing the logger on every path.
fn with_session<T>(
    cli: &Cli,
    f: impl FnOnce(&Session) -> Result<T, CliError>,
) -> Result<T, CliError> {
    let session = Session::open(cli)?;
    let result = f(&session);
    session.close();
    result
}

// ──────────────────── argument resolution ────────────────────

fn parse_window_duration(s: &str) -> Result<std::time::Duration, CliError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(CliError::User("empty window string".to_string()));
    }
    let (digits, suffix) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
    let n: u64 = digits
        .parse()
        .map_err(|_| CliError::User(format!("invalid window value: {s}")))?;
    let multiplier = match suffix {
        "m" | "min" => 60,
        "h" | "hr" => 3600,
        "d" | "day" => 86400,
        "w" | "wk" => 7 * 86400,
        "" => 86400, // bare number defaults to days
        _ => return Err(CliError::User(format!("unknown window suffix: {suffix}"))),
    };
    Ok(std::time::Duration::from_secs(n.saturating_mul(multiplier)))
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, CliError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CliError::User(format!("invalid timestamp {raw:?}: {e}")))
}

fn resolve_now(at: Option<&str>) -> Result<DateTime<Utc>, CliError> {
    at.map_or_else(|| Ok(Utc::now()), parse_instant)
}

impl WindowArgs {
    fn now(&self) -> Result<DateTime<Utc>, CliError> {
        resolve_now(self.at.as_deref())
    }

    fn resolve(&self, now: DateTime<Utc>) -> Result<TimeWindow, CliError> {
        if let Some(start) = &self.start {
            let start = parse_instant(start)?;
            let end = self.end.as_deref().map_or(Ok(now), parse_instant)?;
            return Ok(TimeWindow::new(start, end)?);
        }
        let span = parse_window_duration(self.window.as_deref().unwrap_or("7d"))?;
        let span = TimeDelta::from_std(span)
            .map_err(|_| CliError::User("window is too long".to_string()))?;
        Ok(TimeWindow::trailing(now, span)?)
    }
}

impl ScopeArgs {
    fn resolve(&self) -> Result<Scope, CliError> {
        let need = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .ok_or_else(|| CliError::User(format!("--scope {} requires --{flag}", self.kind())))
        };
        Ok(match self.scope {
            ScopeKind::Network => Scope::Network,
            ScopeKind::Location => Scope::location(need(&self.location, "location")?),
            ScopeKind::Station => Scope::Station(StationKey::new(
                need(&self.location, "location")?,
                need(&self.station, "station")?,
            )),
            ScopeKind::Port => Scope::Port(PortKey::new(
                need(&self.location, "location")?,
                need(&self.station, "station")?,
                need(&self.port, "port")?,
            )),
        })
    }

    const fn kind(&self) -> &'static str {
        match self.scope {
            ScopeKind::Network => "network",
            ScopeKind::Location => "location",
            ScopeKind::Station => "station",
            ScopeKind::Port => "port",
        }
    }
}

/// Map a member shortfall to the partial exit code after output is written.
fn partial_check(command: &str, members: &MemberReport) -> Result<(), CliError> {
    if members.is_partial() {
        return Err(CliError::Partial(format!(
            "{command}: {} of {} member(s) could not be read",
            members.failed.len(),
            members.total
        )));
    }
    Ok(())
}

// ──────────────────── ingest ────────────────────

fn run_ingest(cli: &Cli, args: &IngestArgs) -> Result<(), CliError> {
    let fetched_at = resolve_now(args.at.as_deref())?;
    with_session(cli, |session| {
        let batch = FileSource::new(&args.file).next_batch(fetched_at)?;
        let report = session.engine.ingest(&batch, Utc::now())?;

        match output_mode(cli) {
            OutputMode::Human => {
                println!(
                    "Ingested {} snapshot(s) from {}",
                    report.received,
                    args.file.display()
                );
                println!(
                    "  inserted {}, replaced {}, unchanged {}, out of order {}",
                    report.written.inserted,
                    report.written.replaced,
                    report.written.unchanged,
                    report.out_of_order
                );
                if report.unknown_statuses > 0 {
                    println!(
                        "  {} unrecognized status(es) stored as UNKNOWN",
                        report.unknown_statuses
                    );
                }
                for rejected in &report.rejected {
                    println!(
                        "  {} {} at {}: {}",
                        "rejected".red(),
                        rejected.port,
                        format_ts(rejected.observed_at),
                        rejected.reason
                    );
                }
                println!("  digest {}", report.batch_digest.dimmed());
            }
            OutputMode::Json => emit_json("ingest", &report)?,
        }
        Ok(())
    })
}

// ──────────────────── summarize ────────────────────

fn run_summarize(cli: &Cli, args: &SummarizeArgs) -> Result<(), CliError> {
    let scope = args.scope.resolve()?;
    let now = args.window.now()?;
    let window = args.window.resolve(now)?;

    with_session(cli, |session| {
        if let Some(bucket) = args.bucket {
            let granularity = bucket.granularity(window);
            let series = session
                .engine
                .summarize_series(&scope, window, granularity, now)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    let unit = match granularity {
                        Granularity::Hour => "hour",
                        Granularity::Day => "day",
                    };
                    print_header(&format!("Utilization by {unit} for {scope}"), window);
                    for point in &series.points {
                        let label = format_ts(point.bucket.start);
                        match &point.summary {
                            Observed::Value(s) => println!(
                                "  {label}  occupied {:>6.2}%  charging {:>6.2}%  sessions {:>3}",
                                s.occupation_utilization_pct,
                                s.active_charging_utilization_pct,
                                s.session_count
                            ),
                            Observed::NoData => println!("  {label}  {}", "no data".dimmed()),
                        }
                    }
                }
                OutputMode::Json => emit_json("summarize", &series)?,
            }
            return partial_check("summarize", &series.members);
        }

        let result = session.engine.summarize(&scope, window, now)?;
        match output_mode(cli) {
            OutputMode::Human => {
                print_header(&format!("Utilization for {scope}"), window);
                print_summary(&result.summary);
                print_members(&result.members);
            }
            OutputMode::Json => emit_json("summarize", &result)?,
        }
        partial_check("summarize", &result.members)
    })
}

fn print_header(title: &str, window: TimeWindow) {
    println!("{}", title.bold());
    println!(
        "  window {} .. {}",
        format_ts(window.start),
        format_ts(window.end)
    );
}

fn print_summary(summary: &Observed<UtilizationSummary>) {
    let Observed::Value(s) = summary else {
        println!("  {}", "no data in window".dimmed());
        return;
    };
    println!(
        "  Occupation:   {:>6.2}%",
        s.occupation_utilization_pct
    );
    println!(
        "  Charging:     {:>6.2}%",
        s.active_charging_utilization_pct
    );
    println!("  Availability: {:>6.3}", s.availability_ratio);
    println!(
        "  Sessions:     {} ({:.2}/day)",
        s.session_count, s.sessions_per_day
    );
    let coverage = format!("{:.1}%", s.coverage_ratio * 100.0);
    let coverage = if s.coverage_ratio < 0.5 {
        coverage.yellow()
    } else {
        coverage.normal()
    };
    println!(
        "  Coverage:     {coverage} ({:.2} monitored day(s), {:.0}s unknown, {:.0}s gaps)",
        s.monitored_days, s.unknown_seconds, s.gap_seconds
    );
    println!("  Ports:        {}", s.port_count);
}

fn print_members(members: &MemberReport) {
    if members.no_data > 0 {
        println!(
            "  {} of {} port(s) had no data",
            members.no_data, members.total
        );
    }
    for failure in &members.failed {
        println!(
            "  {} {} [{}] {}",
            "failed".red(),
            failure.port,
            failure.code,
            failure.message
        );
    }
}

// ──────────────────── reliability ────────────────────

fn run_reliability(cli: &Cli, args: &ReliabilityArgs) -> Result<(), CliError> {
    let scope = args.scope.resolve()?;
    let now = args.window.now()?;
    let window = args.window.resolve(now)?;

    with_session(cli, |session| {
        if let Scope::Port(port) = &scope {
            let stats = session.engine.reliability(port, window)?;
            match output_mode(cli) {
                OutputMode::Human => {
                    print_header(&format!("Reliability for port {port}"), window);
                    println!("  Outages: {}", stats.outage_count());
                    for outage in &stats.outages {
                        let marker = if outage.low_confidence {
                            " (low confidence)".yellow().to_string()
                        } else {
                            String::new()
                        };
                        println!(
                            "    {} .. {}  {:.1} min{marker}",
                            format_ts(outage.start),
                            format_ts(outage.end),
                            outage.duration_minutes
                        );
                    }
                    if let Some(open) = &stats.open_outage {
                        println!(
                            "  {} since {} (last seen {})",
                            "UNAVAILABLE".red().bold(),
                            format_ts(open.since),
                            format_ts(open.last_seen)
                        );
                    }
                    println!("  MTTR: {}", observed_minutes(&stats.mttr_minutes));
                    println!("  MTBF: {}", observed_minutes(&stats.mtbf_minutes));
                }
                OutputMode::Json => emit_json("reliability", &stats)?,
            }
            return Ok(());
        }

        let rollup = session.engine.reliability_rollup(&scope, window)?;
        match output_mode(cli) {
            OutputMode::Human => {
                print_header(&format!("Reliability for {scope}"), window);
                println!(
                    "  Outages: {} closed, {} open, {} low confidence",
                    rollup.outage_count, rollup.open_outages, rollup.low_confidence_count
                );
                println!("  MTTR: {}", observed_minutes(&rollup.mttr_minutes));
                for port in rollup.ports.iter().filter(|p| p.open_outage.is_some()) {
                    println!("    {} {}", "open".red(), port.port);
                }
                for station in rollup
                    .stations
                    .iter()
                    .filter(|s| !s.outages.is_empty() || s.open_outage.is_some())
                {
                    let open = station.open_outage.map_or_else(String::new, |o| {
                        format!(", down since {}", format_ts(o.since)).red().to_string()
                    });
                    println!(
                        "    station {}: {} full outages, MTTR {}{open}",
                        station.station,
                        station.outages.len(),
                        observed_minutes(&station.mttr_minutes)
                    );
                }
                print_members(&rollup.members);
            }
            OutputMode::Json => emit_json("reliability", &rollup)?,
        }
        partial_check("reliability", &rollup.members)
    })
}

fn observed_minutes(value: &Observed<f64>) -> String {
    match value {
        Observed::Value(minutes) => format!("{minutes:.1} min"),
        Observed::NoData => "n/a".dimmed().to_string(),
    }
}

// ──────────────────── fingerprint ────────────────────

fn run_fingerprint(cli: &Cli, args: &FingerprintArgs) -> Result<(), CliError> {
    let station = StationKey::new(args.location.clone(), args.station.clone());
    let now = resolve_now(args.at.as_deref())?;

    with_session(cli, |session| {
        let Some(fingerprint) = session.engine.fingerprint(&station, now)? else {
            return match output_mode(cli) {
                OutputMode::Human => {
                    println!("No stored history for station {station}.");
                    Ok(())
                }
                OutputMode::Json => {
                    write_json_line(&json!({
                        "command": "fingerprint",
                        "station": station,
                        "result": Value::Null,
                    }))
                }
            };
        };

        match output_mode(cli) {
            OutputMode::Human => {
                println!("{}", format!("Weekly fingerprint for station {station}").bold());
                println!(
                    "  history {} .. {} (UTC{:+} min), {} port(s)",
                    format_ts(fingerprint.history_start),
                    format_ts(fingerprint.history_end),
                    fingerprint.utc_offset_minutes,
                    fingerprint.port_count
                );
                println!("  Busiest:");
                for cell in &fingerprint.busiest {
                    println!(
                        "    {:<16} {:>6.2}%  coverage {:.2}",
                        cell.label, cell.occupation_utilization_pct, cell.coverage_ratio
                    );
                }
                println!("  Quietest:");
                for cell in &fingerprint.quietest {
                    println!(
                        "    {:<16} {:>6.2}%  coverage {:.2}",
                        cell.label, cell.occupation_utilization_pct, cell.coverage_ratio
                    );
                }
                print_members(&fingerprint.members);
            }
            OutputMode::Json => emit_json("fingerprint", &fingerprint)?,
        }
        partial_check("fingerprint", &fingerprint.members)
    })
}

// ──────────────────── rules ────────────────────

fn run_rules(cli: &Cli, args: &RulesArgs) -> Result<(), CliError> {
    let now = resolve_now(args.at.as_deref())?;

    with_session(cli, |session| {
        let defaults = session.engine.settings().rules;
        let thresholds = RuleThresholds {
            unused_days: args.unused_days.unwrap_or(defaults.unused_days),
            long_session_days: args.long_session_days.unwrap_or(defaults.long_session_days),
            long_session_min_minutes: args
                .long_session_min_minutes
                .unwrap_or(defaults.long_session_min_minutes),
            unavailable_hours: args.unavailable_hours.unwrap_or(defaults.unavailable_hours),
        };
        thresholds.validate()?;
        rules::validate_day_windows(&args.unused_windows)?;

        let evaluation = session.engine.evaluate_rules(thresholds, now)?;
        let unused = if args.unused_windows.is_empty() {
            Vec::new()
        } else {
            session.engine.unused_counts(&args.unused_windows, now)?
        };

        match output_mode(cli) {
            OutputMode::Human => {
                println!("{}", format!("Rules as of {}", format_ts(now)).bold());
                println!(
                    "  unused {}d, long session {}d >= {} min, unavailable {}h",
                    thresholds.unused_days,
                    thresholds.long_session_days,
                    thresholds.long_session_min_minutes,
                    thresholds.unavailable_hours
                );
                let counts = evaluation.counts;
                println!(
                    "  Flagged ports: {} (unused {}, no long session {}, unavailable too long {})",
                    counts.flagged_ports,
                    counts.unused,
                    counts.no_long_session,
                    counts.unavailable_too_long
                );
                for port in evaluation.flagged() {
                    let flags: Vec<String> = port
                        .flags
                        .iter()
                        .map(|f| {
                            serde_json::to_value(f)
                                .ok()
                                .and_then(|v| v.as_str().map(str::to_string))
                                .unwrap_or_default()
                        })
                        .collect();
                    let stale = if port.stale {
                        " stale".yellow().to_string()
                    } else {
                        String::new()
                    };
                    println!(
                        "    {:<24} {}  [{}]{stale}",
                        port.port.to_string(),
                        flags.join(",").red(),
                        port.current_status
                    );
                }
                for count in &unused {
                    println!(
                        "  Unused over {}d: {} ports, {} stations",
                        count.days, count.ports, count.stations
                    );
                }
                print_members(&evaluation.members);
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "rules",
                "result": evaluation,
                "unused_counts": unused,
            }))?,
        }
        partial_check("rules", &evaluation.members)
    })
}

// ──────────────────── status ────────────────────

fn run_status(cli: &Cli, args: &StatusArgs) -> Result<(), CliError> {
    let scope = args.scope.resolve()?;
    let now = resolve_now(args.at.as_deref())?;

    with_session(cli, |session| {
        let board = session.engine.current_status(&scope, now)?;
        match output_mode(cli) {
            OutputMode::Human => {
                let c = board.counts;
                println!("{}", format!("Status for {scope}").bold());
                println!(
                    "  {} port(s): {} available, {} in use, {} charging, {} unavailable, {} unknown, {} stale",
                    c.total,
                    c.available.to_string().green(),
                    c.in_use,
                    c.charging.to_string().cyan(),
                    c.unavailable.to_string().red(),
                    c.unknown,
                    c.stale.to_string().yellow()
                );
                for row in &board.ports {
                    let stale = if row.stale { " (stale)" } else { "" };
                    println!(
                        "    {:<24} {:<12} {}{}",
                        row.port.to_string(),
                        row.status.to_string(),
                        format_ts(row.observed_at),
                        stale.yellow()
                    );
                }
            }
            OutputMode::Json => emit_json("status", &board)?,
        }
        Ok(())
    })
}

// ──────────────────── sessions ────────────────────

fn run_sessions(cli: &Cli, args: &SessionsArgs) -> Result<(), CliError> {
    let scope = args.scope.resolve()?;
    let now = args.window.now()?;
    let window = args.window.resolve(now)?;

    with_session(cli, |session| {
        let stats = session.engine.session_stats(&scope, window, now)?;
        let recent = session
            .engine
            .recent_sessions(&scope, window, args.limit, now)?;

        match output_mode(cli) {
            OutputMode::Human => {
                print_header(&format!("Sessions for {scope}"), window);
                println!(
                    "  {} session(s): {} short, {} long, {} open",
                    stats.count, stats.short_sessions, stats.long_sessions, stats.open_sessions
                );
                println!(
                    "  mean {}, median {}",
                    observed_minutes(&stats.mean_duration_minutes),
                    observed_minutes(&stats.median_duration_minutes)
                );
                for port in recent.iter().filter(|p| !p.sessions.is_empty()) {
                    println!("  {}", port.port.to_string().bold());
                    for s in &port.sessions {
                        let open = if s.open { " (open)" } else { "" };
                        println!(
                            "    {} .. {}  {:.1} min{}",
                            format_ts(s.start),
                            format_ts(s.end),
                            s.duration_minutes(),
                            open.cyan()
                        );
                    }
                }
                print_members(&stats.members);
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "sessions",
                "result": stats,
                "recent": recent,
            }))?,
        }
        partial_check("sessions", &stats.members)
    })
}

// ──────────────────── maintenance ────────────────────

fn run_prune(cli: &Cli) -> Result<(), CliError> {
    with_session(cli, |session| {
        let report = session.engine.prune(Utc::now())?;
        match output_mode(cli) {
            OutputMode::Human => println!(
                "Pruned {} snapshot(s) older than {} in {} ms",
                report.deleted,
                format_ts(report.cutoff),
                report.duration_ms
            ),
            OutputMode::Json => emit_json("prune", &report)?,
        }
        Ok(())
    })
}

fn run_compact(cli: &Cli) -> Result<(), CliError> {
    with_session(cli, |session| {
        let report = session.engine.compact()?;
        match output_mode(cli) {
            OutputMode::Human => println!(
                "Compacted {} -> {} ({} reclaimed) in {} ms",
                format_bytes(report.size_before),
                format_bytes(report.size_after),
                format_bytes(report.reclaimed_bytes),
                report.duration_ms
            ),
            OutputMode::Json => emit_json("compact", &report)?,
        }
        Ok(())
    })
}

fn run_db_stats(cli: &Cli) -> Result<(), CliError> {
    with_session(cli, |session| {
        let stats = session.engine.store_stats()?;
        let mark = session.engine.high_water_mark()?;
        match output_mode(cli) {
            OutputMode::Human => {
                println!(
                    "{}",
                    format!("Snapshot store {}", session.config.paths.database.display()).bold()
                );
                println!("  Rows:    {} across {} port(s)", stats.rows, stats.ports);
                println!(
                    "  Size:    {} ({} free)",
                    format_bytes(stats.size_bytes),
                    format_bytes(stats.free_bytes)
                );
                let span = match (stats.oldest_observed_at, stats.newest_observed_at) {
                    (Some(oldest), Some(newest)) => {
                        format!("{} .. {}", format_ts(oldest), format_ts(newest))
                    }
                    _ => "empty".to_string(),
                };
                println!("  Span:    {span}");
                println!(
                    "  Schema:  {}",
                    stats
                        .schema_version
                        .map_or_else(|| "unknown".to_string(), |v| v.to_string())
                );
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "db-stats",
                "result": stats,
                "high_water_mark": mark,
            }))?,
        }
        Ok(())
    })
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

// ──────────────────── daemon ────────────────────

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    with_session(cli, |session| {
        let Some(feed) = args
            .feed
            .clone()
            .or_else(|| session.config.ingest.feed_file.clone())
        else {
            return Err(CliError::User(
                "no feed configured: pass --feed or set ingest.feed_file".to_string(),
            ));
        };

        let mut daemon = IngestDaemon::new(
            &session.config,
            Arc::clone(&session.engine),
            FileSource::new(feed),
            SignalHandler::new(),
        );
        let stats = daemon.run(args.cycles)?;

        match output_mode(cli) {
            OutputMode::Human => println!(
                "Daemon stopped after {} cycle(s), {} failed",
                stats.cycles, stats.failed_cycles
            ),
            OutputMode::Json => write_json_line(&json!({
                "command": "daemon",
                "cycles": stats.cycles,
                "failed_cycles": stats.failed_cycles,
            }))?,
        }
        Ok(())
    })
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;
            let hash = config.stable_hash()?;

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("# hash {hash}");
                    println!("{}", config.to_toml()?);
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "hash": hash,
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
    }
}

// ──────────────────── output ────────────────────

fn emit_json<T: Serialize>(command: &str, result: &T) -> Result<(), CliError> {
    write_json_line(&json!({
        "command": command,
        "result": serde_json::to_value(result)?,
    }))
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("ENDOLLA_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
