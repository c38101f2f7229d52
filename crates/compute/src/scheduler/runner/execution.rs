use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use stepd_core::{Result, SchedError, StatusCode};

use crate::events::StreamWaker;
use crate::kernel::RunContext;
use crate::scheduler::stream::{Claim, StepOutcome, StreamStatus};

use super::Scheduler;

/// Map a step's status and pending flag to what happens to its stream.
pub(crate) fn outcome_of(status: StatusCode, ctx: &RunContext) -> StepOutcome {
    match status {
        StatusCode::Ok | StatusCode::DiscardData if ctx.pending => StepOutcome::Pended(ctx.waiting_on),
        StatusCode::Ok | StatusCode::DiscardData => StepOutcome::Advanced,
        StatusCode::ModelUnload => StepOutcome::Aborted,
        code => StepOutcome::Failed(code),
    }
}

impl Scheduler {
    /// Run one claimed step on the current thread and settle its stream.
    pub fn execute(&self, claim: Claim) -> StepOutcome {
        let kernel_name = claim.task.kernel_name();
        let Some(kernel) = self.kernels.get(kernel_name) else {
            error!(kernel = kernel_name, stream = %claim.stream, "no kernel registered");
            let outcome = StepOutcome::Failed(StatusCode::ParameterInvalid);
            self.settle(&claim, outcome);
            return outcome;
        };

        let mut ctx = RunContext::new(claim.model, claim.stream, claim.task.task_id);
        let started = Instant::now();
        let status = kernel.compute(&claim.task, &mut ctx);
        let elapsed = started.elapsed();

        for stream in &ctx.woken {
            self.streams.wake(*stream);
        }

        let outcome = outcome_of(status, &ctx);
        {
            let mut m = self.metrics.write();
            m.record_step(kernel_name, elapsed);
            m.wakes += ctx.woken.len() as u64;
            if status == StatusCode::DiscardData {
                m.discard_batches += 1;
            }
        }
        debug!(
            kernel = kernel_name,
            stream = %claim.stream,
            task = %claim.task.task_id,
            %status,
            ?outcome,
            "step finished in {:?}",
            elapsed
        );
        self.settle(&claim, outcome);
        outcome
    }

    fn settle(&self, claim: &Claim, outcome: StepOutcome) {
        let status = self.streams.complete(claim.stream, outcome);
        let mut m = self.metrics.write();
        match (outcome, status) {
            (_, Some(StreamStatus::Aborted)) => m.aborted_streams += 1,
            (StepOutcome::Pended(_), _) => m.pends += 1,
            (StepOutcome::Failed(code), _) => {
                warn!(stream = %claim.stream, model = %claim.model, %code, "stream failed");
                m.record_failure(code);
            }
            (StepOutcome::Advanced, Some(StreamStatus::Done)) => m.completed_streams += 1,
            _ => {}
        }
    }

    /// Execute runnable streams on the current thread until none is left.
    /// Returns the number of steps executed.
    pub fn run_until_idle(&self) -> usize {
        let mut steps = 0;
        while let Some(claim) = self.streams.claim_next() {
            self.execute(claim);
            steps += 1;
        }
        steps
    }

    /// Run the main scheduling loop. Blocks until shutdown is signaled.
    ///
    /// Uses a thread pool via `rayon` for parallel step execution. Claims are
    /// made on the calling thread; in-flight steps finish before this returns.
    pub fn run(&self) -> Result<()> {
        let num_workers = self.runtime.config.resolved_worker_threads();
        let backoff = self.runtime.config.idle_backoff();
        info!(
            "Scheduler starting with {} workers, kernels: {:?}",
            num_workers,
            self.kernels.names()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("stepd-worker-{}", i))
            .build()
            .map_err(|e| SchedError::Inner(format!("failed to build worker pool: {}", e)))?;

        pool.in_place_scope(|scope| {
            while !self.shutdown.load(Ordering::Relaxed) {
                let mut claimed = false;
                while let Some(claim) = self.streams.claim_next() {
                    claimed = true;
                    scope.spawn(move |_| {
                        self.execute(claim);
                    });
                }
                if !claimed {
                    std::thread::sleep(backoff);
                }
            }
        });

        info!("Scheduler stopped");
        Ok(())
    }
}
