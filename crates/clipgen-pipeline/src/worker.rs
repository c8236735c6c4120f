//! One OS thread per rank, owning that rank's [`RankContext`].
//!
//! The thread builds its context (join + load), reports readiness over a
//! oneshot, then serves jobs from a crossbeam channel until told to stop.
//! Callers only ever hold a [`RankWorker`] handle and talk to the context
//! through `submit`, which resolves once the job has run.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use clipgen_net::Rendezvous;
use clipgen_ops::PackKernel;
use clipgen_types::DeviceBinding;

use crate::context::RankContext;
use crate::error::{PipelineError, Result};
use crate::factory::ModelFactories;

type Job = Box<dyn FnOnce(&mut RankContext) + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

pub struct RankWorker {
    rank: usize,
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

impl RankWorker {
    /// Start the rank's thread. The returned receiver resolves once the
    /// context is ready, or with the error that stopped it.
    pub fn spawn(
        binding: DeviceBinding,
        rendezvous: Arc<dyn Rendezvous>,
        factories: ModelFactories,
        pack_kernel: PackKernel,
    ) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let rank = binding.rank;
        let (commands, inbox) = unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("clipgen-rank-{rank}"))
            .spawn(move || {
                let ctx = RankContext::initialize(binding, rendezvous.as_ref(), &factories)
                    .map(|ctx| ctx.with_pack_kernel(pack_kernel));
                match ctx {
                    Ok(ctx) => {
                        let _ = ready_tx.send(Ok(()));
                        serve(ctx, inbox);
                    }
                    Err(e) => {
                        error!(rank, error = %e, "rank failed to start");
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| {
                error!(rank, error = %e, "failed to spawn worker thread");
                PipelineError::WorkerGone { rank }
            })?;

        Ok((Self { rank, commands, thread: Some(thread) }, ready_rx))
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Queue `work` on the rank's context; the future resolves with its result.
    pub fn submit<T, F>(&self, work: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut RankContext) -> Result<T> + Send + 'static,
    {
        let rank = self.rank;
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            let _ = tx.send(ctx.run(work));
        });
        let queued = self.commands.send(Command::Run(job)).is_ok();

        async move {
            if !queued {
                return Err(PipelineError::WorkerGone { rank });
            }
            rx.await.map_err(|_| PipelineError::WorkerGone { rank })?
        }
    }

    /// Ask the thread to stop once its current job is done. Does not wait.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop();
        if thread.join().is_err() {
            warn!(rank = self.rank, "worker thread panicked");
        }
    }

    /// Stop the thread without waiting. For ranks that may be stuck in a
    /// join or load that will never finish.
    pub fn detach(mut self) {
        self.stop();
        self.thread = None;
    }
}

impl Drop for RankWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(mut ctx: RankContext, inbox: Receiver<Command>) {
    let rank = ctx.rank();
    while let Ok(command) = inbox.recv() {
        match command {
            Command::Run(job) => {
                if catch_unwind(AssertUnwindSafe(|| job(&mut ctx))).is_err() {
                    error!(rank, "job panicked, terminating context");
                    break;
                }
            }
            Command::Shutdown => break,
        }
    }
    ctx.terminate();
    info!(rank, "worker stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smoke;
    use clipgen_net::LocalMesh;

    async fn start_single() -> RankWorker {
        let mesh: Arc<dyn Rendezvous> = Arc::new(LocalMesh::new(1, None));
        let (worker, ready) = RankWorker::spawn(
            DeviceBinding::new(0, 1),
            mesh,
            smoke::factories(),
            PackKernel::Parallel,
        )
        .unwrap();
        ready.await.unwrap().unwrap();
        worker
    }

    #[tokio::test]
    async fn submit_runs_on_context() {
        let worker = start_single().await;
        let rank = worker.submit(|ctx| Ok(ctx.rank())).await.unwrap();
        assert_eq!(rank, 0);
        let kernel = worker.submit(|ctx| Ok(ctx.parts()?.pack_kernel)).await.unwrap();
        assert_eq!(kernel, PackKernel::Parallel);

        let err = worker
            .submit(|_| -> Result<()> { Err(PipelineError::InvalidRequest("bad".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));

        // Still serving after a failed job.
        assert_eq!(worker.submit(|ctx| Ok(ctx.world_size())).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn panicking_job_retires_worker() {
        let worker = start_single().await;
        let err = worker
            .submit(|_| -> Result<()> { panic!("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::WorkerGone { rank: 0 }));
        assert!(matches!(
            worker.submit(|_| Ok(())).await,
            Err(PipelineError::WorkerGone { rank: 0 })
        ));
    }

    #[tokio::test]
    async fn shutdown_then_submit_fails() {
        let mut worker = start_single().await;
        worker.shutdown();
        worker.shutdown();
        assert!(matches!(
            worker.submit(|_| Ok(())).await,
            Err(PipelineError::WorkerGone { rank: 0 })
        ));
    }

    #[test]
    fn failed_start_reports_error() {
        let mesh: Arc<dyn Rendezvous> = Arc::new(LocalMesh::new(2, None));
        // World size disagrees with the mesh, so the join fails.
        let (_worker, ready) = RankWorker::spawn(
            DeviceBinding::new(0, 3),
            mesh,
            smoke::factories(),
            PackKernel::Reference,
        )
        .unwrap();
        let err = ready.blocking_recv().unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::GroupJoinFailed { rank: 0, .. }));
    }
}
