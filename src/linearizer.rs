//! # Linearizer
//!
//! Assigns every committed event a position in one global, gap-free
//! sequence. Writers never touch the sequence; they only append commits. The
//! linearizer follows behind and numbers them.
//!
//! ```text
//!   writer ──► commits (commit_seq 1, 2, 3, ...)
//!                  │
//!                  │  unit: BEGIN IMMEDIATE
//!                  │        read commits after marker (≤ batch_size)
//!                  │        insert global_sequence rows, one per event
//!                  │        advance marker
//!                  │        COMMIT
//!                  ▼
//!   global_sequence (position 1, 2, 3, ... no gaps)
//! ```
//!
//! ## Units and Passes
//!
//! A **unit** is one transaction. Either every assignment in it becomes
//! visible together with the advanced marker, or none does. A crash mid-unit
//! leaves the previous marker in place and the next unit redoes the work.
//!
//! A **pass** runs units until one comes back short (the backlog is drained)
//! or the pass's duration budget is spent.
//!
//! ## Single Runner
//!
//! ```text
//!           trigger                 pass done, no rerun
//!   Idle ─────────────► Running ─────────────────────────► Idle
//!                        │   ▲
//!               trigger  │   │ pass done
//!                        ▼   │
//!                       RunAgain
//! ```
//!
//! Triggers come from three places: the writer's post-commit signal, the
//! periodic tick, and [`Linearizer::trigger`]. A trigger while a pass is
//! running only sets `RunAgain`, so bursts of writes collapse into one extra
//! pass. [`Linearizer::run_once`] bypasses the state flag but still serializes
//! on the runner mutex, so two passes never overlap.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, TransactionBehavior};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::types::GlobalPos;

// =============================================================================
// Configuration
// =============================================================================

/// Default time between periodic passes.
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Default number of commits sequenced per unit.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Configuration for the background linearizer.
#[derive(Debug, Clone)]
pub struct LinearizerConfig {
    /// Time between periodic passes.
    pub interval: Duration,

    /// Wall-clock budget for one pass. `None` runs until drained.
    pub max_duration_per_pass: Option<Duration>,

    /// Commits sequenced per unit (one transaction).
    pub batch_size: usize,
}

impl Default for LinearizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            max_duration_per_pass: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Result of one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitReport {
    pub commits: usize,
    pub events: usize,
    pub last_position: GlobalPos,
}

/// Result of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub units: usize,
    pub commits: usize,
    pub events: usize,
    /// Highest position assigned so far (including earlier passes).
    pub last_position: GlobalPos,
    /// False if the pass stopped on its duration budget with work left.
    pub drained: bool,
}

/// Durable linearizer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearizerProgress {
    pub last_commit_seq: u64,
    pub last_position: GlobalPos,
    /// Commits appended but not yet sequenced.
    pub pending_commits: u64,
}

/// Reads the durable progress marker.
pub fn read_progress(conn: &Connection) -> Result<LinearizerProgress> {
    let (last_commit_seq, last_position): (i64, i64) = conn.query_row(
        "SELECT last_commit_seq, last_position FROM linearizer_state WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM commits WHERE commit_seq > ?",
        [last_commit_seq],
        |row| row.get(0),
    )?;

    Ok(LinearizerProgress {
        last_commit_seq: last_commit_seq as u64,
        last_position: GlobalPos::from_raw(last_position as u64),
        pending_commits: pending as u64,
    })
}

// =============================================================================
// Pass Algorithm
// =============================================================================

/// Sequences up to `batch_size` commits in one transaction.
///
/// Commits are taken in `commit_seq` order. Each event of a commit gets the
/// next position, in version order.
pub fn sequence_unit(conn: &mut Connection, batch_size: usize) -> Result<UnitReport> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let (last_commit_seq, last_position): (i64, i64) = tx.query_row(
        "SELECT last_commit_seq, last_position FROM linearizer_state WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let commits: Vec<(i64, String, i64, i64)> = {
        let mut stmt = tx.prepare_cached(
            "SELECT commit_seq, stream_id, first_version, last_version
             FROM commits
             WHERE commit_seq > ?
             ORDER BY commit_seq
             LIMIT ?",
        )?;
        let rows = stmt.query_map(params![last_commit_seq, batch_size as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    let mut position = last_position;
    let mut events = 0;
    {
        let mut insert = tx.prepare_cached(
            "INSERT INTO global_sequence (position, commit_seq, stream_id, version)
             VALUES (?, ?, ?, ?)",
        )?;
        for (commit_seq, stream_id, first_version, last_version) in &commits {
            for version in *first_version..=*last_version {
                position += 1;
                insert.execute(params![position, commit_seq, stream_id, version])?;
                events += 1;
            }
        }
    }

    if let Some((commit_seq, ..)) = commits.last() {
        tx.execute(
            "UPDATE linearizer_state
             SET last_commit_seq = ?, last_position = ?, updated_ms = ?
             WHERE id = 1",
            params![commit_seq, position, current_time_ms() as i64],
        )?;
    }

    tx.commit()?;

    Ok(UnitReport {
        commits: commits.len(),
        events,
        last_position: GlobalPos::from_raw(position as u64),
    })
}

/// Runs units until the backlog is drained or `max_duration` is spent.
///
/// A failing unit rolls back alone; units committed before it stay.
pub fn run_pass(
    conn: &mut Connection,
    batch_size: usize,
    max_duration: Option<Duration>,
) -> Result<PassReport> {
    let started = Instant::now();
    let batch_size = batch_size.max(1);
    let mut report = PassReport::default();

    loop {
        let unit = sequence_unit(conn, batch_size)?;
        report.units += 1;
        report.commits += unit.commits;
        report.events += unit.events;
        report.last_position = unit.last_position;

        if unit.commits < batch_size {
            report.drained = true;
            break;
        }
        if max_duration.is_some_and(|budget| started.elapsed() >= budget) {
            break;
        }
    }

    Ok(report)
}

// =============================================================================
// Wake Signal
// =============================================================================

/// Post-commit wake-up for the linearizer.
///
/// Backed by a channel of capacity 1: while one wake is pending, further
/// signals are dropped.
#[derive(Debug, Clone)]
pub struct LinearizerSignal {
    tx: mpsc::Sender<()>,
}

impl LinearizerSignal {
    /// Requests a pass. Never blocks, never fails.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Creates the signal and the receiver the background loop listens on.
pub fn signal_channel() -> (LinearizerSignal, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (LinearizerSignal { tx }, rx)
}

// =============================================================================
// Runner
// =============================================================================

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const RUN_AGAIN: u8 = 2;

struct Background {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    /// The single-runner mutex. Held for exactly one pass at a time.
    conn: Arc<Mutex<Connection>>,
    state: AtomicU8,
    config: std::sync::Mutex<LinearizerConfig>,
    signals: Arc<Mutex<mpsc::Receiver<()>>>,
    background: std::sync::Mutex<Option<Background>>,
    runtime: Handle,
}

/// Handle to the linearizer. Cheap to clone.
#[derive(Clone)]
pub struct Linearizer {
    inner: Arc<Inner>,
}

impl Linearizer {
    /// Creates a linearizer that owns `conn` and listens on `signals`.
    ///
    /// Must be called from within a Tokio runtime; triggered passes are
    /// spawned onto it.
    pub fn new(conn: Connection, signals: mpsc::Receiver<()>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Schema(format!("linearizer needs a tokio runtime: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Arc::new(Mutex::new(conn)),
                state: AtomicU8::new(IDLE),
                config: std::sync::Mutex::new(LinearizerConfig::default()),
                signals: Arc::new(Mutex::new(signals)),
                background: std::sync::Mutex::new(None),
                runtime,
            }),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> LinearizerConfig {
        match self.inner.config.lock() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_config(&self, config: LinearizerConfig) {
        match self.inner.config.lock() {
            Ok(mut current) => *current = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    /// Returns true while no pass is running or queued.
    pub fn is_idle(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == IDLE
    }

    /// Returns true while the periodic schedule is active.
    pub fn is_scheduled(&self) -> bool {
        self.inner
            .background
            .lock()
            .map(|bg| bg.as_ref().is_some_and(|bg| !bg.task.is_finished()))
            .unwrap_or(false)
    }

    /// Starts (or restarts) the periodic schedule with `config`.
    ///
    /// The schedule ticks every `config.interval` and also wakes on the
    /// writer's post-commit signal.
    pub fn start(&self, config: LinearizerConfig) {
        let _previous = self.detach_background();
        self.set_config(config.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let this = self.clone();
        let task = self
            .inner
            .runtime
            .spawn(async move { this.run_schedule(config.interval, shutdown_rx).await });

        if let Ok(mut bg) = self.inner.background.lock() {
            *bg = Some(Background {
                shutdown: shutdown_tx,
                task,
            });
        }
    }

    /// Stops the periodic schedule and waits for it to exit.
    ///
    /// A pass already running finishes normally.
    pub async fn stop(&self) {
        if let Some(task) = self.detach_background() {
            let _ = task.await;
        }
    }

    fn detach_background(&self) -> Option<JoinHandle<()>> {
        let bg = self.inner.background.lock().ok()?.take()?;
        let _ = bg.shutdown.send(true);
        Some(bg.task)
    }

    /// Requests a pass without waiting for it.
    ///
    /// Starts one if idle; otherwise marks the running pass to go again.
    pub fn trigger(&self) {
        let state = &self.inner.state;
        loop {
            match state.compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    let this = self.clone();
                    self.inner.runtime.spawn(async move { this.drive().await });
                    return;
                }
                Err(RUNNING) => {
                    if state
                        .compare_exchange(RUNNING, RUN_AGAIN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // Raced with the runner going idle; try again.
                }
                Err(_) => return,
            }
        }
    }

    /// Runs exactly one pass and returns its report.
    ///
    /// Waits for any pass in progress to finish first.
    pub async fn run_once(&self) -> Result<PassReport> {
        self.pass().await
    }

    /// Runs passes until the state machine settles back to idle.
    async fn drive(self) {
        let state = &self.inner.state;
        loop {
            let drained = match self.pass().await {
                Ok(report) => report.drained,
                Err(e) => {
                    warn!(error = %e, "linearizer pass failed; will retry on next trigger");
                    true
                }
            };

            if !drained {
                state.store(RUNNING, Ordering::Release);
                continue;
            }

            match state.compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(_) => state.store(RUNNING, Ordering::Release),
            }
        }
    }

    async fn pass(&self) -> Result<PassReport> {
        let config = self.config();
        let mut conn = Arc::clone(&self.inner.conn).lock_owned().await;

        let report = tokio::task::spawn_blocking(move || {
            run_pass(&mut conn, config.batch_size, config.max_duration_per_pass)
        })
        .await
        .map_err(|e| Error::Schema(format!("linearizer pass panicked: {e}")))??;

        if report.commits > 0 {
            debug!(
                commits = report.commits,
                events = report.events,
                units = report.units,
                last_position = report.last_position.as_raw(),
                drained = report.drained,
                "linearizer pass complete"
            );
        }
        Ok(report)
    }

    async fn run_schedule(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut signals = Arc::clone(&self.inner.signals).lock_owned().await;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = interval.as_millis() as u64, "linearizer schedule started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.trigger(),
                Some(()) = signals.recv() => self.trigger(),
            }
        }

        info!("linearizer schedule stopped");
    }
}

// =============================================================================
// Tests
// =============================================================================
