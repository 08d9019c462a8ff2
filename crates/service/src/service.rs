use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread;

use anyhow::{anyhow, bail, Result};
use once_cell::sync::Lazy;
use pm_planner_core::{
    discover_reports, load_config, run_bulk_with_events, run_pipeline_file, BulkEvent, BulkInput,
    BulkOptions, BulkRunOutput, InventorySnapshot, LifeBasis, ManualOverride, PartTable,
    PipelineResult, PipelineShared, PlannerConfig, RuleOptions, DEFAULT_THRESHOLD,
    DEFAULT_WORKERS,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOptions {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub threshold_enabled: bool,
    #[serde(default)]
    pub basis: LifeBasis,
    #[serde(default)]
    pub show_all: bool,
    #[serde(default)]
    pub manual: Vec<ManualOverride>,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            threshold_enabled: true,
            basis: LifeBasis::default(),
            show_all: false,
            manual: Vec::new(),
        }
    }
}

impl PlanOptions {
    fn rule_options(&self) -> RuleOptions {
        RuleOptions {
            threshold: self.threshold,
            threshold_enabled: self.threshold_enabled,
            basis: self.basis,
            show_all: self.show_all,
            manual: self.manual.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSources {
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub parts: Option<PathBuf>,
    #[serde(default)]
    pub inventory: Option<PathBuf>,
}

struct LoadedSources {
    config: PlannerConfig,
    parts: PartTable,
    inventory: InventorySnapshot,
}

impl LoadedSources {
    fn load(sources: &DataSources) -> Result<Self> {
        let config = load_config(sources.config.as_deref())?;
        let parts = match &sources.parts {
            Some(path) => PartTable::load(path)?,
            None => PartTable::default(),
        };
        let inventory = match &sources.inventory {
            Some(path) => InventorySnapshot::load(path)?,
            None => InventorySnapshot::empty(),
        };
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    #[serde(default)]
    pub reports: Vec<PathBuf>,
    #[serde(default)]
    pub sources: DataSources,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub options: PlanOptions,
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl Default for BulkRequest {
    fn default() -> Self {
        Self {
            run_id: None,
            report_dir: None,
            reports: Vec::new(),
            sources: DataSources::default(),
            workers: default_workers(),
            options: PlanOptions::default(),
            blacklist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkSessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSessionSnapshot {
    pub run_id: String,
    pub status: BulkSessionStatus,
    pub units: usize,
    pub error: Option<String>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelBulkResponse {
    pub run_id: String,
    pub status: BulkSessionStatus,
}

#[derive(Debug, Clone)]
struct BulkSession {
    status: BulkSessionStatus,
    units: usize,
    output: Option<BulkRunOutput>,
    error: Option<String>,
    events: Vec<BulkEvent>,
    cancel_flag: Arc<AtomicBool>,
}

static SESSIONS: Lazy<Mutex<HashMap<String, BulkSession>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn plan_report(
    report: impl Into<PathBuf>,
    sources: &DataSources,
    options: &PlanOptions,
) -> Result<PipelineResult> {
    let report: PathBuf = report.into();
    let loaded = LoadedSources::load(sources)?;
    run_pipeline_file(&report, &loaded.shared(), &options.rule_options())
}

pub fn start_bulk_run(request: BulkRequest) -> Result<String> {
    let mut inputs: Vec<BulkInput> = request.reports.iter().cloned().map(BulkInput::file).collect();
    if let Some(dir) = &request.report_dir {
        inputs.extend(discover_reports(dir)?);
    }
    if inputs.is_empty() {
        bail!("bulk run has no reports");
    }
    let rules = request.options.rule_options();
    rules.validate()?;
    let loaded = LoadedSources::load(&request.sources)?;

    let run_id = request
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cancel_flag = Arc::new(AtomicBool::new(false));

    {
        let mut sessions = lock_sessions()?;
        if sessions.contains_key(&run_id) {
            bail!("bulk run already exists: {run_id}");
        }
        sessions.insert(
            run_id.clone(),
            BulkSession {
                status: BulkSessionStatus::Running,
                units: inputs.len(),
                output: None,
                error: None,
                events: Vec::new(),
                cancel_flag: Arc::clone(&cancel_flag),
            },
        );
    }
    info!(run_id = %run_id, units = inputs.len(), "bulk session registered");

    let thread_run_id = run_id.clone();
    thread::spawn(move || {
        let options = BulkOptions {
            workers: request.workers,
            rules,
            blacklist: request.blacklist,
            cancel_flag: Some(Arc::clone(&cancel_flag)),
            run_id: Some(thread_run_id.clone()),
        };

        let run_result = run_bulk_with_events(inputs, &loaded.shared(), &options, |event| {
            if let Ok(mut sessions) = lock_sessions() {
                if let Some(session) = sessions.get_mut(&thread_run_id) {
                    session.events.push(event);
                }
            }
        });

        let Ok(mut sessions) = lock_sessions() else {
            warn!(run_id = %thread_run_id, "bulk session registry unavailable");
            return;
        };
        let Some(session) = sessions.get_mut(&thread_run_id) else {
            return;
        };
        match run_result {
            Ok(output) => {
                session.status = if output.cancelled || cancel_flag.load(Ordering::Relaxed) {
                    BulkSessionStatus::Cancelled
                } else {
                    BulkSessionStatus::Completed
                };
                session.output = Some(output);
                session.error = None;
            }
            Err(err) => {
                session.status = BulkSessionStatus::Failed;
                session.error = Some(format!("{err:#}"));
            }
        }
    });

    Ok(run_id)
}

pub fn poll_bulk_events(run_id: &str, from_seq: u64) -> Result<Vec<BulkEvent>> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("bulk session not found: {run_id}"))?;

    Ok(session
        .events
        .iter()
        .filter(|event| event.seq > from_seq)
        .cloned()
        .collect())
}

pub fn cancel_bulk_run(run_id: &str) -> Result<CancelBulkResponse> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("bulk session not found: {run_id}"))?;

    session.cancel_flag.store(true, Ordering::Relaxed);
    Ok(CancelBulkResponse {
        run_id: run_id.to_string(),
        status: session.status.clone(),
    })
}

pub fn get_bulk_session(run_id: &str) -> Result<BulkSessionSnapshot> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("bulk session not found: {run_id}"))?;

    Ok(BulkSessionSnapshot {
        run_id: run_id.to_string(),
        status: session.status.clone(),
        units: session.units,
        error: session.error.clone(),
        total_events: session.events.len() as u64,
    })
}

pub fn bulk_run_output(run_id: &str) -> Result<Option<BulkRunOutput>> {
    let sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("bulk session not found: {run_id}"))?;
    Ok(session.output.clone())
}

pub fn release_bulk_run(run_id: &str) -> Result<Option<BulkRunOutput>> {
    let mut sessions = lock_sessions()?;
    let session = sessions
        .get(run_id)
        .ok_or_else(|| anyhow!("bulk session not found: {run_id}"))?;
    if session.status == BulkSessionStatus::Running {
        bail!("bulk run is still running: {run_id}");
    }
    let output = sessions.remove(run_id).and_then(|session| session.output);
    info!(run_id = %run_id, "bulk session released");
    Ok(output)
}

fn lock_sessions() -> Result<std::sync::MutexGuard<'static, HashMap<String, BulkSession>>> {
    SESSIONS
        .lock()
        .map_err(|_| anyhow!("bulk session registry lock poisoned"))
}
