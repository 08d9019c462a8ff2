use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ArgAction;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pm_planner_core::{
    discover_reports, evaluate_suite_file, load_config, normalize_key, run_bulk_with_events,
    run_pipeline_file, BulkEventKind, BulkInput, BulkOptions, BulkUnitStatus, InventorySnapshot,
    LifeBasis, ManualAction, ManualOverride, PartTable, PipelineResult, PipelineShared,
    PlannerConfig, RuleOptions, DEFAULT_THRESHOLD, DEFAULT_WORKERS,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "pm-planner",
    version,
    about = "Turn printer PM support-code reports into parts orders reconciled against stock."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan one report: select due kits, resolve parts and reconcile inventory.
    Run(RunArgs),
    /// Plan every report in a directory with a bounded worker pool.
    Bulk(BulkArgs),
    /// Print the canonical code for one or more part descriptors.
    Normalize(NormalizeArgs),
    /// Validate a planner configuration file and print what it contains.
    Check(CheckArgs),
    /// Evaluate kit selection against a fixture suite.
    Eval(EvalArgs),
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum CliBasis {
    Page,
    Drive,
}

impl From<CliBasis> for LifeBasis {
    fn from(value: CliBasis) -> Self {
        match value {
            CliBasis::Page => LifeBasis::Page,
            CliBasis::Drive => LifeBasis::Drive,
        }
    }
}

#[derive(Debug, Args)]
struct DataArgs {
    /// Planner configuration (canon table, catalogs, overrides). Defaults to the built-in one.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Part table JSON (kit code to part number rows).
    #[arg(long, value_name = "FILE")]
    parts: Option<PathBuf>,

    /// Inventory snapshot JSON.
    #[arg(long, value_name = "FILE")]
    inventory: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RuleArgs {
    /// Life-used ratio at which an item becomes due.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// Only items past 100% of their life are due.
    #[arg(long)]
    no_threshold: bool,

    /// Preferred usage basis.
    #[arg(long, default_value = "page")]
    basis: CliBasis,

    /// Link every evaluated item to its kit, due or not.
    #[arg(long)]
    show_all: bool,

    /// Force a canonical code to be due (repeatable).
    #[arg(long = "force-due", value_name = "CODE", action = ArgAction::Append)]
    force_due: Vec<String>,

    /// Exclude a canonical code from selection (repeatable).
    #[arg(long = "skip", value_name = "CODE", action = ArgAction::Append)]
    skip: Vec<String>,
}

impl RuleArgs {
    fn to_options(&self) -> RuleOptions {
        let manual = self
            .force_due
            .iter()
            .map(|code| (code, ManualAction::ForceDue))
            .chain(self.skip.iter().map(|code| (code, ManualAction::Skip)))
            .map(|(code, action)| ManualOverride {
                code: code.clone(),
                action,
            })
            .collect();
        RuleOptions {
            threshold: self.threshold,
            threshold_enabled: !self.no_threshold,
            basis: self.basis.into(),
            show_all: self.show_all,
            manual,
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    /// PM support-code report (CSV or key/value text).
    #[arg(long, value_name = "FILE")]
    report: PathBuf,

    #[command(flatten)]
    data: DataArgs,

    #[command(flatten)]
    rules: RuleArgs,

    /// Optional JSON output file for the full result.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct BulkArgs {
    /// Directory scanned recursively for `.csv` and `.txt` reports.
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Individual report files (repeatable).
    #[arg(long = "report", value_name = "FILE", num_args = 1.., action = ArgAction::Append)]
    reports: Vec<PathBuf>,

    #[command(flatten)]
    data: DataArgs,

    #[command(flatten)]
    rules: RuleArgs,

    /// Worker threads.
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Serial or file-name glob to skip (repeatable).
    #[arg(long = "blacklist", value_name = "GLOB", action = ArgAction::Append)]
    blacklist: Vec<String>,

    /// Optional JSON output file for the run.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    /// Raw descriptors as printed on the report.
    #[arg(required = true, value_name = "DESCRIPTOR")]
    descriptors: Vec<String>,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct EvalArgs {
    /// Evaluation suite JSON file.
    #[arg(long, value_name = "FILE", default_value = "fixtures/eval/suite.json")]
    suite: PathBuf,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Optional JSON output file for evaluation result.
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,
}

struct LoadedData {
    config: PlannerConfig,
    parts: PartTable,
    inventory: InventorySnapshot,
}

impl LoadedData {
    fn load(args: &DataArgs) -> Result<Self> {
        let config = load_config(args.config.as_deref())?;
        let parts = match &args.parts {
            Some(path) => PartTable::load(path)?,
            None => {
                warn!("no part table given; every kit will be unresolved");
                PartTable::default()
            }
        };
        let inventory = match &args.inventory {
            Some(path) => InventorySnapshot::load(path)?,
            None => InventorySnapshot::empty(),
        };
        debug!(
            part_kits = parts.kit_count(),
            inventory_parts = inventory.len(),
            "planner data loaded"
        );
        Ok(Self {
            config,
            parts,
            inventory,
        })
    }

    fn shared(&self) -> PipelineShared<'_> {
        PipelineShared {
            config: &self.config,
            parts: &self.parts,
            inventory: &self.inventory,
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_run_command(args),
        Commands::Bulk(args) => run_bulk_command(args),
        Commands::Normalize(args) => run_normalize_command(args),
        Commands::Check(args) => run_check_command(args),
        Commands::Eval(args) => run_eval_command(args),
    }
}

fn run_run_command(args: RunArgs) -> Result<()> {
    let data = LoadedData::load(&args.data)?;
    let result = run_pipeline_file(&args.report, &data.shared(), &args.rules.to_options())?;
    print_result(&result);

    if let Some(output) = args.output {
        write_json(&output, &result)?;
        println!("Result written to {}", output.display());
    }
    Ok(())
}

fn print_result(result: &PipelineResult) {
    let header = &result.header;
    println!(
        "{} | serial {} | captured {}",
        header.model,
        header.serial,
        header.captured_raw.as_deref().unwrap_or("unknown")
    );

    let selection = &result.selection;
    if selection.kits.is_empty() {
        println!("No kits due.");
    } else {
        println!("Kits due:");
        for (kit, request) in &selection.kits {
            println!(
                "- {kit} x{}{}",
                request.quantity,
                if request.over_life { " (over life)" } else { "" }
            );
        }
    }
    if !selection.watch.is_empty() {
        let watch: Vec<String> = selection
            .watch
            .iter()
            .map(|finding| format!("{} {:.0}%", finding.code, finding.life_used * 100.0))
            .collect();
        println!("Watch: {}", watch.join(", "));
    }
    if !selection.unresolved.is_empty() {
        let unresolved: Vec<&str> = selection
            .unresolved
            .iter()
            .map(|finding| finding.code.as_str())
            .collect();
        println!("Due without catalog entry: {}", unresolved.join(", "));
    }

    let reconciled = &result.reconciled;
    for line in &reconciled.matched {
        println!("  stock  {} x{}", line.part_number, line.quantity);
    }
    for line in &reconciled.to_order {
        println!("  order  {} x{}", line.part_number, line.quantity);
    }
    for kit in &reconciled.unpriced {
        println!("  ?      {} x{} (no part number)", kit.kit_code, kit.quantity);
    }
    println!(
        "From stock: {:.2} | to order: {:.2}{} | diagnostics: {}",
        reconciled.matched_value,
        reconciled.order_cost,
        if reconciled.uncosted_order_lines > 0 {
            format!(" (+{} uncosted line(s))", reconciled.uncosted_order_lines)
        } else {
            String::new()
        },
        result.diagnostics.len()
    );
}

fn run_bulk_command(args: BulkArgs) -> Result<()> {
    let mut inputs: Vec<BulkInput> = args.reports.iter().cloned().map(BulkInput::file).collect();
    if let Some(dir) = &args.dir {
        inputs.extend(discover_reports(dir)?);
    }
    if inputs.is_empty() {
        anyhow::bail!("no reports given; pass --dir or --report");
    }

    let data = LoadedData::load(&args.data)?;
    let options = BulkOptions {
        workers: args.workers,
        rules: args.rules.to_options(),
        blacklist: args.blacklist,
        ..BulkOptions::default()
    };
    let output = run_bulk_with_events(inputs, &data.shared(), &options, |event| {
        match event.kind {
            BulkEventKind::Started => debug!(label = %event.label, "unit started"),
            BulkEventKind::Failed => warn!(
                label = %event.label,
                error = event.message.as_deref().unwrap_or_default(),
                "unit failed"
            ),
            _ => info!(label = %event.label, kind = ?event.kind, "unit finished"),
        }
    })?;

    println!(
        "Bulk {}: {} completed, {} failed, {} skipped, {} cancelled in {} ms.",
        output.run_id,
        output.count(BulkUnitStatus::Completed),
        output.count(BulkUnitStatus::Failed),
        output.count(BulkUnitStatus::Skipped),
        output.count(BulkUnitStatus::Cancelled),
        output.elapsed_ms
    );
    for unit in output.ranked() {
        println!(
            "- {} [{}] best {:.0}% | {} kit(s)",
            unit.serial.as_deref().unwrap_or(&unit.label),
            unit.model.as_deref().unwrap_or("?"),
            unit.best_life_used.unwrap_or(0.0) * 100.0,
            unit.kit_count
        );
    }
    for unit in &output.units {
        if let Some(error) = &unit.error {
            println!("! {}: {}", unit.label, error);
        }
    }

    if let Some(path) = args.output {
        write_json(&path, &output)?;
        println!("Bulk JSON written to {}", path.display());
    }
    Ok(())
}

fn run_normalize_command(args: NormalizeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    for descriptor in &args.descriptors {
        match config.canon.normalize(descriptor) {
            Some(code) => println!("{descriptor} -> {code}"),
            None => println!("{descriptor} -> (unmapped: {})", normalize_key(descriptor)),
        }
    }
    Ok(())
}

fn run_check_command(args: CheckArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let summary = config.summary();
    println!(
        "Configuration OK: {} model(s), {} kit(s), {} canon entr(ies), {} pattern(s), {} override(s).",
        summary.models.len(),
        summary.kits,
        summary.canon_entries,
        summary.canon_patterns,
        summary.quantity_overrides
    );
    for model in &summary.models {
        println!("- {model}");
    }
    Ok(())
}

fn run_eval_command(args: EvalArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let result = evaluate_suite_file(&args.suite, &config)?;
    println!(
        "Eval: {}/{} cases passed | exact match rate {:.3}",
        result.passed_cases, result.total_cases, result.exact_match_rate
    );

    for case in &result.case_results {
        let mut notes = Vec::new();
        if !case.missing.is_empty() {
            notes.push(format!("missing: {}", case.missing.join(", ")));
        }
        if !case.unexpected.is_empty() {
            notes.push(format!("unexpected: {}", case.unexpected.join(", ")));
        }
        if !case.forbidden_hits.is_empty() {
            notes.push(format!("forbidden: {}", case.forbidden_hits.join(", ")));
        }
        if let Some(error) = &case.error {
            notes.push(format!("error: {error}"));
        }
        println!(
            "- [{}] {}{}",
            if case.passed { "PASS" } else { "FAIL" },
            case.name,
            if notes.is_empty() {
                String::new()
            } else {
                format!(" | {}", notes.join(" | "))
            }
        );
    }

    if let Some(output) = args.output {
        write_json(&output, &result)?;
        println!("Evaluation JSON written to {}", output.display());
    }
    Ok(())
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write output to {}", path.display()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
