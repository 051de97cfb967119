//! Randomized fault-injection driver for the holo_ring epoch protocol.
//!
//! `run` interleaves commits, batch round trips, failures and recoveries on an
//! in-process ring, checks every ring invariant after each step, and records a
//! JSON history. `check` validates a persisted ring snapshot.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use holo_ring::ring::{
    Config, NoopSink, PartitionId, RingError, RingState, SnapshotStore, TransactionBatch,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-ring-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Drive a randomized run and check invariants after every step.
    Run(RunArgs),
    /// Validate a persisted ring snapshot.
    Check(CheckArgs),
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of ring partitions.
    #[arg(long, env = "HOLO_RING_PARTITIONS", default_value_t = 5)]
    partitions: u64,

    /// Number of random steps to run.
    #[arg(long, env = "HOLO_RING_STEPS", default_value_t = 1000)]
    steps: usize,

    /// Upper bound on operations per partition in one batch.
    #[arg(long, env = "HOLO_RING_OPS_MAX", default_value_t = 4)]
    ops_max: usize,

    /// Percent of steps that inject a failure.
    #[arg(long, env = "HOLO_RING_FAIL_PCT", default_value_t = 10)]
    fail_pct: u8,

    /// Percent of steps that inject a recovery.
    #[arg(long, env = "HOLO_RING_RECOVER_PCT", default_value_t = 10)]
    recover_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, env = "HOLO_RING_SEED", default_value_t = 0)]
    seed: u64,

    /// How long a boundary waits for its predecessor.
    #[arg(long, env = "HOLO_RING_EPOCH_WAIT", default_value = "2s")]
    epoch_wait: humantime::Duration,

    /// Write a JSON history to this path.
    #[arg(long, env = "HOLO_RING_OUT", default_value = ".tmp/holo-ring/history.json")]
    out: PathBuf,

    /// Optionally persist the final ring snapshot to this path.
    #[arg(long, env = "HOLO_RING_SNAPSHOT_OUT")]
    snapshot_out: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
struct CheckArgs {
    /// Snapshot file written by `run --snapshot-out`.
    #[arg(long, env = "HOLO_RING_SNAPSHOT")]
    snapshot: PathBuf,
}

/// Metadata embedded in the history file for reproducibility.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct HistoryMeta {
    partitions: u64,
    steps: usize,
    ops_max: usize,
    fail_pct: u8,
    recover_pct: u8,
    seed: u64,
    epoch_wait_ms: u64,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct History {
    meta: HistoryMeta,
    steps: Vec<StepRecord>,
    final_epoch: u64,
}

/// One simulator step and what the ring answered.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
struct StepRecord {
    step: usize,
    action: Action,
    outcome: Outcome,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Action {
    Submit { partition: PartitionId },
    Batch { ops: usize },
    Fail { partition: PartitionId },
    Recover { partition: PartitionId },
    CheckAgreement { epoch: u64 },
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outcome {
    Ok,
    Rejected { error: String },
}

impl Outcome {
    /// Fold a ring result into an outcome, failing on anything unexpected.
    fn from_result<T>(
        result: Result<T, RingError>,
        allowed: impl Fn(&RingError) -> bool,
    ) -> anyhow::Result<Self> {
        match result {
            Ok(_) => Ok(Outcome::Ok),
            Err(err) if allowed(&err) => Ok(Outcome::Rejected {
                error: err.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
        Command::Check(args) => check(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.partitions > 0, "--partitions must be > 0");
    anyhow::ensure!(
        args.fail_pct as u16 + args.recover_pct as u16 <= 100,
        "--fail-pct plus --recover-pct must be <= 100"
    );

    // Use a random seed when the user provides zero.
    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let mut rng = SmallRng::seed_from_u64(seed);

    let config = Config {
        epoch_wait_timeout: args.epoch_wait.into(),
    };
    let ring = RingState::new(config, 0..args.partitions, Arc::new(NoopSink))
        .context("create ring")?;
    tracing::info!(partitions = args.partitions, steps = args.steps, seed, "simulation started");

    let mut steps = Vec::with_capacity(args.steps);
    let mut epochs = 0u64;
    for step in 0..args.steps {
        let partition = rng.gen_range(0..args.partitions);
        let roll = rng.gen_range(0..100u16);
        let fail_cut = args.fail_pct as u16;
        let recover_cut = fail_cut + args.recover_pct as u16;

        let (action, outcome) = if roll < fail_cut {
            let result = ring.inject_failure(partition).await;
            let outcome = Outcome::from_result(result, |err| {
                matches!(err, RingError::QuorumWouldBeLost { .. })
            })?;
            (Action::Fail { partition }, outcome)
        } else if roll < recover_cut {
            let result = ring.inject_recovery(partition).await;
            (Action::Recover { partition }, Outcome::from_result(result, |_| false)?)
        } else {
            // Split the remaining mass between commits, batches and checks.
            match rng.gen_range(0..4) {
                0 | 1 => {
                    let result = ring.submit_operation(partition, b"sim").await;
                    let outcome = Outcome::from_result(result, |err| {
                        matches!(err, RingError::ParticipantUnavailable { .. })
                    })?;
                    (Action::Submit { partition }, outcome)
                }
                2 => {
                    let batch = random_batch(&mut rng, args.partitions, args.ops_max);
                    let result = ring.run_batch(&batch).await;
                    let outcome = Outcome::from_result(result, |_| false)
                        .with_context(|| format!("batch at step {step}"))?;
                    epochs += 1;
                    (Action::Batch { ops: batch.len() }, outcome)
                }
                _ => {
                    let epoch = rng.gen_range(0..=epochs);
                    let result = ring.check_agreement(epoch).await;
                    (Action::CheckAgreement { epoch }, Outcome::from_result(result, |_| false)?)
                }
            }
        };
        tracing::debug!(step, ?action, ?outcome, "step done");
        steps.push(StepRecord {
            step,
            action,
            outcome,
        });

        if let Err(violation) = ring.check_invariants().await {
            write_history(&args, seed, steps, epochs)?;
            anyhow::bail!("invariant violated after step {step} (seed {seed}): {violation}");
        }
    }

    if let Some(path) = &args.snapshot_out {
        let store = SnapshotStore::new(path);
        store.save(&ring.snapshot().await)?;
        tracing::info!(path = %path.display(), "ring snapshot written");
    }

    let functional = ring.functional_count().await;
    tracing::info!(
        seed,
        epochs,
        functional,
        total = args.partitions,
        "simulation finished with all invariants intact"
    );
    write_history(&args, seed, steps, epochs)?;
    eprintln!("wrote history: {}", args.out.display());
    Ok(())
}

async fn check(args: CheckArgs) -> anyhow::Result<()> {
    let store = SnapshotStore::new(&args.snapshot);
    let snapshot = store
        .load()?
        .with_context(|| format!("no snapshot at {}", args.snapshot.display()))?;
    let ring = RingState::restore(Config::default(), snapshot, Arc::new(NoopSink))
        .context("restore ring snapshot")?;

    let participants = ring.participants().await;
    let last_epoch = participants
        .iter()
        .map(|p| p.committed_epoch_clock)
        .max()
        .unwrap_or(0);
    for epoch in 0..=last_epoch {
        let agreement = ring
            .check_agreement(epoch)
            .await
            .with_context(|| format!("agreement at epoch {epoch}"))?;
        tracing::debug!(epoch, compared = ?agreement.compared, "agreement holds");
    }
    tracing::info!(
        partitions = participants.len(),
        epochs = last_epoch,
        functional = participants.iter().filter(|p| p.functional).count(),
        "snapshot is consistent"
    );
    Ok(())
}

fn random_batch(rng: &mut SmallRng, partitions: u64, ops_max: usize) -> TransactionBatch {
    let mut batch = TransactionBatch::new();
    for partition in 0..partitions {
        for idx in 0..rng.gen_range(0..=ops_max) {
            batch.push(partition, format!("p{partition}-b{idx}").into_bytes());
        }
    }
    batch
}

fn write_history(
    args: &RunArgs,
    seed: u64,
    steps: Vec<StepRecord>,
    final_epoch: u64,
) -> anyhow::Result<()> {
    let history = History {
        meta: HistoryMeta {
            partitions: args.partitions,
            steps: args.steps,
            ops_max: args.ops_max,
            fail_pct: args.fail_pct,
            recover_pct: args.recover_pct,
            seed,
            epoch_wait_ms: std::time::Duration::from(args.epoch_wait).as_millis() as u64,
        },
        steps,
        final_epoch,
    };
    if let Some(parent) = args.out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(&history).context("serialize history")?;
    std::fs::write(&args.out, data).with_context(|| format!("write {}", args.out.display()))?;
    Ok(())
}
