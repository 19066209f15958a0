//! FSM that sequences captures, modelling and adaptation, owns all
//! persistent state, and serialises incoming commands through a
//! single-slot queue: a background worker thread holds an
//! `Arc<Mutex<RunState>>` that synchronous getter methods read, while
//! commands arrive one at a time over a bounded channel.

use crate::adapter::Adapter;
use crate::agc;
use crate::config::EngineConfig;
use crate::heuristics;
use crate::model::{DpdData, PolynomialModel, K};
use crate::snapshot::{self, Snapshot};
use crate::stats::{BinStatistic, MEDIAN_TO_PEAK};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// FSM states, surfaced to callers as `RunState.state_tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    RxCalibration,
    CaptureAndModel,
    UpdatePredistorter,
    AutorestartPending,
}

/// Shared, lock-guarded engine state, read by RPC handlers and mutated
/// exclusively by the worker thread.
#[derive(Debug, Clone)]
pub struct RunState {
    pub n_runs: u32,
    pub current_dpddata: DpdData,
    pub state: State,
    pub stateprogress: u8,
    pub summary: Vec<String>,
    pub latest_plot_refs: Vec<String>,
    pub adapt_dumps: Vec<String>,
}

impl RunState {
    fn new(adapt_dumps: Vec<String>) -> Self {
        RunState {
            n_runs: 0,
            current_dpddata: identity_dpddata(),
            state: State::Idle,
            stateprogress: 0,
            summary: Vec::new(),
            latest_plot_refs: Vec::new(),
            adapt_dumps,
        }
    }
}

fn identity_dpddata() -> DpdData {
    let mut am = [0.0; K];
    am[0] = 1.0;
    DpdData::Poly {
        coefs_am: am,
        coefs_pm: [0.0; K],
    }
}

/// The FSM commands accepted from RPC.
#[derive(Debug, Clone)]
pub enum Command {
    Calibrate,
    Reset,
    TriggerRun,
    Adapt,
    RestoreDump { dump_id: String },
    Quit,
}

/// Handle for RPC callers: pushes commands onto the single-slot queue and
/// reads `RunState` under the shared lock.
pub struct Orchestrator {
    state: Arc<Mutex<RunState>>,
    queue: SyncSender<Command>,
    /// Set for the entire duration of a command's execution (not merely
    /// while it sits in `queue`), so a second `submit` while the first is
    /// still running is rejected with `Busy` rather than being buffered.
    busy: Arc<AtomicBool>,
    _worker: thread::JoinHandle<()>,
}

impl Orchestrator {
    pub fn spawn(config: EngineConfig, adapter: Adapter) -> Self {
        let adapt_dumps = snapshot::enumerate_dumps(&config.logs_directory).unwrap_or_default();
        let state = Arc::new(Mutex::new(RunState::new(adapt_dumps)));
        let (tx, rx) = sync_channel(1);
        let busy = Arc::new(AtomicBool::new(false));

        let worker_state = state.clone();
        let worker_busy = busy.clone();
        let worker = thread::spawn(move || worker_loop(worker_state, adapter, config, rx, worker_busy));

        Orchestrator {
            state,
            queue: tx,
            busy,
            _worker: worker,
        }
    }

    /// Claim the busy flag and push a command onto the single-slot queue,
    /// returning `Busy` if a command is already claimed or in progress.
    pub fn submit(&self, command: Command) -> Result<(), crate::error::EngineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(crate::error::EngineError::Busy);
        }
        if self.queue.try_send(command).is_err() {
            self.busy.store(false, Ordering::Release);
            return Err(crate::error::EngineError::Busy);
        }
        Ok(())
    }

    pub fn get_results(&self) -> RunState {
        self.state.lock().unwrap().clone()
    }
}

struct WorkerCtx {
    bin_stat: Option<BinStatistic>,
    model: PolynomialModel,
    pending_dpddata: Option<DpdData>,
}

impl WorkerCtx {
    fn new() -> Self {
        WorkerCtx {
            bin_stat: None,
            model: PolynomialModel::new(),
            pending_dpddata: None,
        }
    }
}

fn worker_loop(
    state: Arc<Mutex<RunState>>,
    mut adapter: Adapter,
    config: EngineConfig,
    queue: Receiver<Command>,
    busy: Arc<AtomicBool>,
) {
    let mut ctx = WorkerCtx::new();
    loop {
        let command = match queue.recv_timeout(Duration::from_secs(3)) {
            Ok(cmd) => cmd,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if matches!(command, Command::Quit) {
            busy.store(false, Ordering::Release);
            break;
        }

        let result = run_command(&state, &mut adapter, &config, &mut ctx, command);
        if let Err(e) = result {
            log::error!("command failed: {e}");
            let mut guard = state.lock().unwrap();
            guard.summary.push(format!("command failed: {e}"));
            guard.state = State::AutorestartPending;
            guard.stateprogress = 0;
            drop(guard);

            for step in 0..10 {
                thread::sleep(Duration::from_secs(1));
                let mut guard = state.lock().unwrap();
                guard.stateprogress = (step + 1) * 10;
            }

            let mut guard = state.lock().unwrap();
            guard.state = State::Idle;
            guard.stateprogress = 0;
        }

        // The command (and, on failure, its autorestart cooldown) has now
        // fully run to completion: only now is the engine free to accept
        // another one.
        busy.store(false, Ordering::Release);
    }
}

fn run_command(
    state: &Arc<Mutex<RunState>>,
    adapter: &mut Adapter,
    config: &EngineConfig,
    ctx: &mut WorkerCtx,
    command: Command,
) -> Result<(), crate::error::EngineError> {
    match command {
        Command::Quit => Ok(()),
        Command::Calibrate => cmd_calibrate(state, adapter),
        Command::Reset => cmd_reset(state, ctx),
        Command::TriggerRun => cmd_trigger_run(state, adapter, ctx),
        Command::Adapt => cmd_adapt(state, adapter, config, ctx),
        Command::RestoreDump { dump_id } => cmd_restore_dump(state, adapter, config, ctx, &dump_id),
    }
}

fn set_state(state: &Arc<Mutex<RunState>>, tag: State, progress: u8) {
    let mut guard = state.lock().unwrap();
    guard.state = tag;
    guard.stateprogress = progress;
}

fn push_summary(state: &Arc<Mutex<RunState>>, line: impl Into<String>) {
    state.lock().unwrap().summary.push(line.into());
}

/// `calibrate`: run RxAgc for up to 3 iterations.
fn cmd_calibrate(state: &Arc<Mutex<RunState>>, adapter: &mut Adapter) -> Result<(), crate::error::EngineError> {
    set_state(state, State::RxCalibration, 0);
    let mut last_err = None;
    for i in 0..3 {
        set_state(state, State::RxCalibration, (i + 1) * 30);
        match agc::run(adapter) {
            Ok(outcome) => {
                push_summary(
                    state,
                    format!(
                        "calibrate: rx gain {:.2} -> {:.2} dB (rx_median={:.5})",
                        outcome.previous_gain, outcome.new_gain, outcome.rx_median
                    ),
                );
                last_err = None;
                break;
            }
            Err(e) => {
                push_summary(state, format!("calibrate: {e}"));
                last_err = Some(e);
            }
        }
    }
    set_state(state, State::Idle, 100);
    if let Some(e) = last_err {
        return Err(e.into());
    }
    Ok(())
}

/// `reset`: reconstruct the statistic accumulator, reset the model, zero
/// `n_runs`.
fn cmd_reset(state: &Arc<Mutex<RunState>>, ctx: &mut WorkerCtx) -> Result<(), crate::error::EngineError> {
    ctx.bin_stat = None;
    ctx.model.reset_coefs();
    ctx.pending_dpddata = None;
    let mut guard = state.lock().unwrap();
    guard.n_runs = 0;
    guard.current_dpddata = identity_dpddata();
    guard.state = State::Idle;
    guard.stateprogress = 0;
    guard.summary.push("reset".to_string());
    Ok(())
}

/// `trigger_run`: capture and extract until enough measurements for this
/// iteration, then train and stash the new coefficients without applying
/// them.
fn cmd_trigger_run(
    state: &Arc<Mutex<RunState>>,
    adapter: &mut Adapter,
    ctx: &mut WorkerCtx,
) -> Result<(), crate::error::EngineError> {
    set_state(state, State::CaptureAndModel, 0);
    let n_runs = state.lock().unwrap().n_runs;
    let required = heuristics::n_meas(n_runs);

    let mut pending_first_capture = None;
    if ctx.bin_stat.is_none() {
        let capture = adapter.capture()?;
        ctx.bin_stat = Some(BinStatistic::with_defaults(capture.tx_median * MEDIAN_TO_PEAK));
        pending_first_capture = Some(capture);
    }

    loop {
        let capture = match pending_first_capture.take() {
            Some(c) => c,
            None => match adapter.capture() {
                Ok(c) => c,
                Err(e) => {
                    push_summary(state, format!("capture failed: {e}"));
                    continue;
                }
            },
        };
        let bin_stat = ctx.bin_stat.as_mut().unwrap();
        if let Err(e) = bin_stat.extract(&capture.tx, &capture.rx) {
            push_summary(state, format!("extract rejected a capture: {e}"));
            continue;
        }

        let n_meas = bin_stat.n_meas();
        let progress = ((n_meas as f64 / required as f64) * 90.0).min(90.0) as u8;
        set_state(state, State::CaptureAndModel, progress);

        if n_meas >= required {
            break;
        }
    }

    let (tx_mean, rx_mean, phase_mean, _n) = ctx.bin_stat.as_ref().unwrap().means();
    let lr = heuristics::learning_rate(n_runs);
    ctx.model.train(&tx_mean, &rx_mean, &phase_mean, lr)?;
    ctx.bin_stat = None;
    ctx.pending_dpddata = Some(ctx.model.get_dpd_data());

    push_summary(state, format!("trigger_run: trained with lr={lr:.3}, {} bins used", tx_mean.len()));
    set_state(state, State::Idle, 100);
    Ok(())
}

/// `adapt`: apply the stashed coefficients, capture once more, snapshot,
/// and record the dump id.
fn cmd_adapt(
    state: &Arc<Mutex<RunState>>,
    adapter: &mut Adapter,
    config: &EngineConfig,
    ctx: &mut WorkerCtx,
) -> Result<(), crate::error::EngineError> {
    set_state(state, State::UpdatePredistorter, 0);

    let dpddata = ctx
        .pending_dpddata
        .take()
        .unwrap_or_else(|| ctx.model.get_dpd_data());

    adapter.set_predistorter(&dpddata)?;
    set_state(state, State::UpdatePredistorter, 40);

    adapter.capture()?;
    set_state(state, State::UpdatePredistorter, 70);

    let unix_timestamp = current_unix_timestamp();
    let path = snapshot::path_for_id(&config.logs_directory, &unix_timestamp.to_string());
    adapter.dump(&path, dpddata.clone())?;

    let mut guard = state.lock().unwrap();
    guard.n_runs += 1;
    guard.current_dpddata = dpddata;
    guard.adapt_dumps.push(unix_timestamp.to_string());
    guard.summary.push("adapt: predistorter updated and snapshotted".to_string());
    guard.state = State::Idle;
    guard.stateprogress = 100;
    Ok(())
}

/// `restore_dump{dump_id}`: "defaults" resets model + pushes identity;
/// otherwise loads the named snapshot.
fn cmd_restore_dump(
    state: &Arc<Mutex<RunState>>,
    adapter: &mut Adapter,
    config: &EngineConfig,
    ctx: &mut WorkerCtx,
    dump_id: &str,
) -> Result<(), crate::error::EngineError> {
    set_state(state, State::UpdatePredistorter, 0);

    if dump_id == "defaults" {
        ctx.model.reset_coefs();
        let identity = identity_dpddata();
        adapter.set_predistorter(&identity)?;
        let mut guard = state.lock().unwrap();
        guard.current_dpddata = identity;
        guard.summary.push("restore_dump: defaults".to_string());
        guard.state = State::Idle;
        guard.stateprogress = 100;
        return Ok(());
    }

    let path = snapshot::path_for_id(&config.logs_directory, dump_id);
    if !path.exists() {
        return Err(crate::error::EngineError::UnknownSnapshot(dump_id.to_string()));
    }
    let snapshot = adapter.restore(&path)?;
    ctx.model.set_dpd_data(&snapshot.dpddata)?;

    let mut guard = state.lock().unwrap();
    guard.current_dpddata = snapshot.dpddata;
    guard.summary.push(format!("restore_dump: restored {dump_id}"));
    guard.state = State::Idle;
    guard.stateprogress = 100;
    Ok(())
}

fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Whether `dump_id` is either the literal `"defaults"` or a known
/// snapshot id. Exposed so RPC handlers can validate `restore_dump` ids
/// without going through the worker thread.
pub fn is_known_dump(run_state: &RunState, dump_id: &str) -> bool {
    dump_id == "defaults" || run_state.adapt_dumps.iter().any(|id| id == dump_id)
}
