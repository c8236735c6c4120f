//! Multi-rank pipeline: one [`RankWorker`] per rank, driven in lockstep.
//!
//! Every request is submitted to every rank, since each rank has to reach
//! the same collectives. The caller gets rank 0's result; when ranks fail,
//! the error of the lowest failing rank is reported.
//!
//! Each request gets a fresh epoch that every rank enters before running
//! it. Frames a failed request left on the links carry the old epoch and
//! are dropped by the receiver, so the next request starts clean.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::time::timeout;
use tracing::{error, info, warn};

use clipgen_net::Rendezvous;
use clipgen_ops::PackKernel;
use clipgen_types::config::PipelineConfig;
use clipgen_types::{DeviceBinding, GenerationRequest, Tensor};

use crate::context::RankContext;
use crate::error::{PipelineError, Result};
use crate::factory::ModelFactories;
use crate::generate::generate;
use crate::worker::RankWorker;

pub struct MultiRankPipeline {
    workers: Vec<RankWorker>,
    config: PipelineConfig,
    epochs: AtomicU64,
}

impl MultiRankPipeline {
    /// Start every rank and wait until all are ready.
    ///
    /// Fails with the lowest failing rank's error, or `InitTimeout` if the
    /// ranks are not all ready within `config.init_timeout`. Started ranks
    /// are stopped before returning an error.
    pub async fn new(
        config: PipelineConfig,
        rendezvous: Arc<dyn Rendezvous>,
        factories: ModelFactories,
    ) -> Result<Self> {
        let world_size = config.world_size;
        if world_size == 0 {
            return Err(PipelineError::InvalidRequest("world size must be at least 1".into()));
        }
        let pack_kernel = PackKernel::select(config.kernel.pack);
        info!(world_size, ?pack_kernel, "starting pipeline ranks");

        let mut workers = Vec::with_capacity(world_size);
        let mut ready = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let binding = DeviceBinding::new(rank, world_size);
            let rendezvous = Arc::clone(&rendezvous);
            match RankWorker::spawn(binding, rendezvous, factories.clone(), pack_kernel) {
                Ok((worker, rx)) => {
                    workers.push(worker);
                    ready.push(rx);
                }
                Err(e) => {
                    workers.into_iter().for_each(RankWorker::detach);
                    return Err(e);
                }
            }
        }

        let outcomes = match timeout(config.init_timeout, join_all(ready)).await {
            Ok(outcomes) => outcomes,
            Err(_) => {
                error!(timeout = ?config.init_timeout, "ranks did not become ready in time");
                workers.into_iter().for_each(RankWorker::detach);
                return Err(PipelineError::InitTimeout(config.init_timeout));
            }
        };

        let failure = outcomes.into_iter().enumerate().find_map(|(rank, outcome)| match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(PipelineError::WorkerGone { rank }),
        });
        if let Some(e) = failure {
            error!(error = %e, "pipeline initialization failed");
            workers.into_iter().for_each(RankWorker::detach);
            return Err(e);
        }

        info!(world_size, "all ranks ready");
        Ok(Self { workers, config, epochs: AtomicU64::new(0) })
    }

    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `work` on every rank concurrently and collect the results in rank
    /// order. Bounded by `request_timeout`.
    pub async fn run_on_all<T, F>(&self, work: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(&mut RankContext) -> Result<T> + Clone + Send + 'static,
    {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let pending: Vec<_> = self
            .workers
            .iter()
            .map(|w| {
                let work = work.clone();
                w.submit(move |ctx| {
                    ctx.enter_request(epoch);
                    work(ctx)
                })
            })
            .collect();
        let limit = self.config.request_timeout;

        let outcomes = timeout(limit, join_all(pending)).await.map_err(|_| {
            warn!(timeout = ?limit, "request exceeded its time limit");
            PipelineError::CollectiveStall(format!("request did not finish within {limit:?}"))
        })?;

        outcomes.into_iter().collect()
    }

    /// Generate one video. Returns rank 0's `[1, 3, T, H, W]` frames in `[0, 1]`.
    pub async fn invoke(&self, req: &GenerationRequest) -> Result<Tensor> {
        let req = req.clone().normalized()?;
        info!(
            frames = req.num_frames,
            height = req.height,
            width = req.width,
            steps = req.num_inference_steps,
            seed = req.seed,
            "invoking pipeline"
        );

        let config = self.config.clone();
        let videos = self.run_on_all(move |ctx| generate(ctx, &req, &config)).await?;
        videos.into_iter().next().ok_or(PipelineError::WorkerGone { rank: 0 })
    }

    /// Stop every rank and wait for their threads.
    pub fn shutdown(&mut self) {
        // Signal everyone first so no rank waits on a peer that is still serving.
        self.workers.iter().for_each(RankWorker::stop);
        for worker in &mut self.workers {
            worker.shutdown();
        }
        self.workers.clear();
    }
}

impl Drop for MultiRankPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_parallel::gather_frames;
    use crate::factory::{Decoder, Denoiser, TextEncoder};
    use crate::smoke::{self, conditioning_target, HashTextEncoder};
    use clipgen_net::LocalMesh;
    use clipgen_types::config::PackKernelChoice;
    use std::time::Duration;

    fn config(world_size: usize) -> PipelineConfig {
        PipelineConfig {
            world_size,
            init_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ..PipelineConfig::default()
        }
    }

    async fn pipeline(world_size: usize, factories: ModelFactories) -> Result<MultiRankPipeline> {
        let mesh = Arc::new(LocalMesh::new(world_size, Some(Duration::from_secs(10))));
        MultiRankPipeline::new(config(world_size), mesh, factories).await
    }

    fn small_request() -> GenerationRequest {
        GenerationRequest {
            num_frames: 13,
            height: 64,
            width: 64,
            num_inference_steps: 4,
            ..GenerationRequest::new("a paper boat on a pond")
        }
    }

    #[tokio::test]
    async fn invoke_produces_flat_video_on_two_ranks() {
        let pipe = pipeline(2, smoke::factories()).await.unwrap();
        assert_eq!(pipe.world_size(), 2);

        let req = small_request();
        let video = pipe.invoke(&req).await.unwrap();
        assert_eq!(video.shape(), &[1, 3, 3, 64, 64]);

        let tc = conditioning_target(&HashTextEncoder.encode(&req.prompt).unwrap());
        let tu = conditioning_target(&HashTextEncoder.encode("").unwrap());
        let latent = tu + req.guidance_scale * (tc - tu);
        let want = ((latent + 1.0) / 2.0).clamp(0.0, 1.0);
        assert!(video.data().iter().all(|v| (v - want).abs() < 1e-3));
    }

    #[tokio::test]
    async fn invoke_matches_across_world_sizes() {
        let req = small_request();
        let one = pipeline(1, smoke::factories()).await.unwrap().invoke(&req).await.unwrap();
        let three = pipeline(3, smoke::factories()).await.unwrap().invoke(&req).await.unwrap();
        assert!(one.max_abs_diff(&three).unwrap() < 1e-4);
    }

    #[tokio::test]
    async fn invalid_request_rejected_before_dispatch() {
        let pipe = pipeline(1, smoke::factories()).await.unwrap();
        let err = pipe.invoke(&GenerationRequest::new("  ")).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));

        let odd = GenerationRequest { height: 60, ..small_request() };
        assert!(matches!(pipe.invoke(&odd).await, Err(PipelineError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn load_failure_on_one_rank_fails_construction() {
        let mut factories = smoke::factories();
        factories.decoder = Arc::new(|b: &DeviceBinding| -> anyhow::Result<Box<dyn Decoder>> {
            anyhow::ensure!(b.rank != 1, "out of device memory");
            Ok(Box::new(smoke::NearestDecoder))
        });

        let err = pipeline(2, factories).await.err().unwrap();
        assert!(matches!(err, PipelineError::ModelLoadFailed { rank: 1, .. }), "{err}");
    }

    #[tokio::test]
    async fn lowest_failing_rank_is_reported() {
        let mut factories = smoke::factories();
        factories.text_encoder = Arc::new(|b: &DeviceBinding| -> anyhow::Result<Box<dyn TextEncoder>> {
            anyhow::ensure!(b.rank < 2, "no encoder on rank {}", b.rank);
            Ok(Box::new(HashTextEncoder))
        });
        let err = pipeline(4, factories).await.err().unwrap();
        assert!(matches!(err, PipelineError::ModelLoadFailed { rank: 2, .. }), "{err}");

        let pipe = pipeline(3, smoke::factories()).await.unwrap();
        let err = pipe
            .run_on_all(|ctx| match ctx.rank() {
                0 => Ok(()),
                r => Err(PipelineError::InvalidRequest(format!("rank {r}"))),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(ref m) if m == "rank 1"));
    }

    #[tokio::test]
    async fn slow_init_times_out() {
        let mut factories = smoke::factories();
        factories.denoiser = Arc::new(|_: &DeviceBinding| -> anyhow::Result<Box<dyn Denoiser>> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Box::new(smoke::FlatDenoiser))
        });
        let cfg = PipelineConfig { init_timeout: Duration::from_millis(50), ..config(1) };
        let mesh = Arc::new(LocalMesh::new(1, None));

        let err = MultiRankPipeline::new(cfg, mesh, factories).await.err().unwrap();
        assert!(matches!(err, PipelineError::InitTimeout(_)));
    }

    #[tokio::test]
    async fn slow_request_reports_stall() {
        let mut pipe = pipeline(1, smoke::factories()).await.unwrap();
        pipe.config.request_timeout = Duration::from_millis(50);

        let err = pipe
            .run_on_all(|_| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CollectiveStall(_)));
    }

    #[tokio::test]
    async fn failed_request_does_not_poison_the_next() {
        let mesh = Arc::new(LocalMesh::new(2, Some(Duration::from_millis(200))));
        let pipe = MultiRankPipeline::new(config(2), mesh, smoke::factories()).await.unwrap();
        let req = small_request();

        for failing in [1, 0] {
            // One rank gives up before the gather; its peer sends its half
            // and stalls waiting for the rest.
            let err = pipe
                .run_on_all(move |ctx| {
                    if ctx.rank() == failing {
                        return Err(PipelineError::InvalidRequest("encoder rejected prompt".into()));
                    }
                    let parts = ctx.parts()?;
                    let local = Tensor::zeros(&[1, 3, 2, 8, 8]);
                    gather_frames(parts.group, &local)
                })
                .await
                .unwrap_err();
            assert!(
                matches!(err, PipelineError::InvalidRequest(_) | PipelineError::CollectiveStall(_)),
                "{err}"
            );

            let video = pipe.invoke(&req).await.unwrap();
            assert_eq!(video.shape(), &[1, 3, 3, 64, 64]);
            pipe.invoke(&req).await.unwrap();
        }
    }

    #[tokio::test]
    async fn terminated_rank_rejects_work() {
        let pipe = pipeline(1, smoke::factories()).await.unwrap();
        pipe.run_on_all(|ctx| {
            ctx.terminate();
            Ok(())
        })
        .await
        .unwrap();

        let err = pipe.invoke(&small_request()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ContextTerminated { rank: 0 }));
    }

    #[tokio::test]
    async fn every_rank_gets_the_configured_pack_kernel() {
        let mut cfg = config(2);
        cfg.kernel.pack = PackKernelChoice::Reference;
        let mesh = Arc::new(LocalMesh::new(2, None));
        let pipe = MultiRankPipeline::new(cfg, mesh, smoke::factories()).await.unwrap();

        let kernels = pipe.run_on_all(|ctx| Ok(ctx.parts()?.pack_kernel)).await.unwrap();
        assert_eq!(kernels, vec![PackKernel::Reference; 2]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let mut pipe = pipeline(2, smoke::factories()).await.unwrap();
        pipe.shutdown();
        pipe.shutdown();
        assert_eq!(pipe.world_size(), 0);
    }
}
