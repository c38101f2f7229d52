//! stepd-sim: drives the step scheduler against the in-memory driver.
//!
//! Builds one model gathering from `--queues` input queues, loads a stream
//! that per transaction locks a table, gathers, enqueues the batch and
//! unlocks, then feeds transactions in and prints the scheduler metrics.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use stepd_compute::kernel::{GatherParams, QueueRoute};
use stepd_compute::{ExternalEvent, ModelSpec, Runtime, Scheduler, TaskDescriptor, TaskParams};
use stepd_core::{
    load_dotenv, BufferHeader, Driver, MismatchPolicy, ModelId, NotifyId, QueueId, SchedConfig, SimDriver,
    StreamId, TableId,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Simulated step scheduler run.
#[derive(Parser, Debug)]
#[command(name = "stepd-sim", version, about)]
struct Cli {
    /// Path to a stepd.toml config file. Defaults plus env overrides if unset.
    #[arg(long, env = "STEPD_CONFIG")]
    config: Option<String>,

    /// Transactions to feed through the gather.
    #[arg(long, default_value_t = 8)]
    transactions: u64,

    /// Input queues the model gathers from.
    #[arg(long, default_value_t = 3)]
    queues: u32,

    /// Every `skip_every`-th transaction is left incomplete on the last
    /// queue. 0 disables. A nonzero value raises a zero gather cache limit
    /// to 1 so incomplete sets are forced out.
    #[arg(long, default_value_t = 0)]
    skip_every: u64,

    /// Mismatch policy override (`drop` or `pad`).
    #[arg(long)]
    policy: Option<String>,
}

const MODEL: ModelId = ModelId(0);
const WATCHER: ModelId = ModelId(1);
const TABLE: TableId = TableId(1);
const DONE_NOTIFY: NotifyId = NotifyId(0);

fn input_queue(i: u32) -> QueueId {
    QueueId(1 + i)
}

fn output_queue(i: u32) -> QueueId {
    QueueId(100 + i)
}

fn pipeline_tasks(cli: &Cli) -> Vec<TaskDescriptor> {
    let routes: Vec<QueueRoute> = (0..cli.queues).map(|i| QueueRoute::local(input_queue(i))).collect();
    let outputs: Vec<QueueId> = (0..cli.queues).map(output_queue).collect();
    let mut tasks = Vec::new();
    let mut next_id = 0u32;
    let mut push = |params: TaskParams| {
        tasks.push(TaskDescriptor::new(next_id, MODEL, params));
        next_id += 1;
    };
    let expected = cli.transactions - cli.transactions.checked_div(cli.skip_every).unwrap_or(0);
    for _ in 0..expected {
        push(TaskParams::LockTable {
            table_id: TABLE,
            lock_type: 1,
        });
        push(TaskParams::GatherDequeue(GatherParams::all(routes.clone())));
        push(TaskParams::Enqueue {
            queues: outputs.clone(),
        });
        push(TaskParams::UnlockTable {
            table_id: TABLE,
            lock_type: 1,
        });
    }
    push(TaskParams::RecordNotify { notify_id: DONE_NOTIFY });
    push(TaskParams::EndGraph);
    tasks
}

fn main() -> anyhow::Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.queues > 0, "--queues must be at least 1");

    let mut config = match &cli.config {
        Some(path) => SchedConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => SchedConfig::from_env()?,
    };
    if let Some(raw) = &cli.policy {
        config.gather.policy =
            MismatchPolicy::parse(raw).with_context(|| format!("unknown policy {:?}", raw))?;
    }
    if cli.skip_every > 0 && config.gather.cache_num == 0 {
        info!("--skip-every set without a gather cache limit, forcing out incomplete sets with cache_num=1");
        config.gather.cache_num = 1;
    }
    config.log_summary();

    let driver = Arc::new(SimDriver::new());
    for i in 0..cli.queues {
        driver.add_queue(input_queue(i));
        driver.add_queue(output_queue(i));
    }

    let runtime = Runtime::new(config, driver.clone());
    let scheduler = Scheduler::new(Arc::clone(&runtime));
    let dispatcher = scheduler.dispatcher();

    scheduler.load_model(
        MODEL,
        ModelSpec {
            notify_ids: vec![DONE_NOTIFY],
            input_queues: (0..cli.queues).map(input_queue).collect(),
            output_queues: (0..cli.queues).map(output_queue).collect(),
        },
    )?;
    scheduler.load_model(WATCHER, ModelSpec::default())?;

    scheduler.add_stream(StreamId(0), MODEL, pipeline_tasks(&cli))?;
    scheduler.add_stream(
        StreamId(1),
        WATCHER,
        vec![
            TaskDescriptor::new(0, WATCHER, TaskParams::WaitNotify { notify_id: DONE_NOTIFY }),
            TaskDescriptor::new(1, WATCHER, TaskParams::WaitEndGraph { target: MODEL }),
        ],
    )?;
    scheduler.run_until_idle();

    let mut delivered = 0usize;
    for trans in 0..cli.transactions {
        let skipped = cli.skip_every > 0 && trans % cli.skip_every == cli.skip_every - 1;
        for i in 0..cli.queues {
            if skipped && i == cli.queues - 1 {
                continue;
            }
            let header = BufferHeader::new(trans, 0).with_timestamp(trans * 10 + u64::from(i));
            driver.push(input_queue(i), header)?;
            dispatcher.dispatch(ExternalEvent::QueueNotEmpty { queue: input_queue(i) })?;
        }
        scheduler.run_until_idle();

        for i in 0..cli.queues {
            for handle in driver.drain_queue(output_queue(i)) {
                delivered += 1;
                driver.free(handle)?;
            }
            dispatcher.dispatch(ExternalEvent::QueueNotFull { queue: output_queue(i) })?;
        }
        scheduler.run_until_idle();
    }

    for (stream, name) in [(StreamId(0), "pipeline"), (StreamId(1), "watcher")] {
        match scheduler.streams().status(stream) {
            Some(status) => info!(%stream, name, ?status, "stream finished"),
            None => warn!(%stream, name, "stream missing"),
        }
    }

    scheduler.unload_model(MODEL)?;
    scheduler.unload_model(WATCHER)?;
    for i in 0..cli.queues {
        for handle in driver.drain_queue(input_queue(i)) {
            driver.free(handle)?;
        }
    }
    info!(delivered, live_buffers = driver.live_count(), "simulation complete");

    println!("{}", serde_json::to_string_pretty(&scheduler.metrics())?);
    Ok(())
}
