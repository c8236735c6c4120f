//! Per-rank context: process-group membership plus the loaded models.
//!
//! ```text
//!   Uninitialized ─► JoiningGroup ─► LoadingTextEncoder ─► LoadingDenoiser
//!                                                               │
//!        ┌──────── Running ◄──────── Ready ◄──── LoadingDecoder ┘
//!        └────────────────────────►   │
//!                                     ▼
//!   (any state) ──────────────────► Terminated
//! ```
//!
//! A context is built once, on its worker thread, and owns its models and
//! group for its whole life. A failed join or load terminates it before the
//! error is returned, so nothing is left half-initialized.

use std::fmt;

use tracing::{debug, info, warn};

use clipgen_net::{ProcessGroup, Rendezvous};
use clipgen_ops::PackKernel;
use clipgen_types::{DeviceBinding, ModelComponent};

use crate::error::{PipelineError, Result};
use crate::factory::{Decoder, Denoiser, ModelFactories, TextEncoder};
use crate::timer::StageTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    JoiningGroup,
    LoadingTextEncoder,
    LoadingDenoiser,
    LoadingDecoder,
    Ready,
    Running,
    Terminated,
}

impl ContextState {
    fn loading(component: ModelComponent) -> Self {
        match component {
            ModelComponent::TextEncoder => Self::LoadingTextEncoder,
            ModelComponent::Denoiser => Self::LoadingDenoiser,
            ModelComponent::Decoder => Self::LoadingDecoder,
        }
    }

    fn can_become(self, next: Self) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Uninitialized, JoiningGroup)
                | (JoiningGroup, LoadingTextEncoder)
                | (LoadingTextEncoder, LoadingDenoiser)
                | (LoadingDenoiser, LoadingDecoder)
                | (LoadingDecoder, Ready)
                | (Ready, Running)
                | (Running, Ready)
        ) || (next == Terminated && self != Terminated)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized      => write!(f, "Uninitialized"),
            Self::JoiningGroup       => write!(f, "JoiningGroup"),
            Self::LoadingTextEncoder => write!(f, "LoadingTextEncoder"),
            Self::LoadingDenoiser    => write!(f, "LoadingDenoiser"),
            Self::LoadingDecoder     => write!(f, "LoadingDecoder"),
            Self::Ready              => write!(f, "Ready"),
            Self::Running            => write!(f, "Running"),
            Self::Terminated         => write!(f, "Terminated"),
        }
    }
}

/// Borrowed view of a ready context, handed to request work.
pub struct RankParts<'a> {
    pub binding: DeviceBinding,
    pub pack_kernel: PackKernel,
    pub group: &'a mut dyn ProcessGroup,
    pub text_encoder: &'a dyn TextEncoder,
    pub denoiser: &'a dyn Denoiser,
    pub decoder: &'a dyn Decoder,
}

pub struct RankContext {
    binding: DeviceBinding,
    state: ContextState,
    pack_kernel: PackKernel,
    group: Option<Box<dyn ProcessGroup>>,
    text_encoder: Option<Box<dyn TextEncoder>>,
    denoiser: Option<Box<dyn Denoiser>>,
    decoder: Option<Box<dyn Decoder>>,
    timer: StageTimer,
}

impl RankContext {
    pub fn new(binding: DeviceBinding) -> Self {
        Self {
            binding,
            state: ContextState::Uninitialized,
            pack_kernel: PackKernel::Reference,
            group: None,
            text_encoder: None,
            denoiser: None,
            decoder: None,
            timer: StageTimer::new(),
        }
    }

    /// Join the group and load every component, in order.
    pub fn initialize(
        binding: DeviceBinding,
        rendezvous: &dyn Rendezvous,
        factories: &ModelFactories,
    ) -> Result<Self> {
        let mut ctx = Self::new(binding);
        info!(rank = binding.rank, world_size = binding.world_size, device = binding.device, "initializing rank");

        ctx.join_group(rendezvous)?;
        for component in ModelComponent::LOAD_ORDER {
            ctx.load(component, factories)?;
        }
        ctx.transition(ContextState::Ready)?;
        ctx.timer.log(binding.rank);
        Ok(ctx)
    }

    /// Use `kernel` for token pack/unpack on this rank.
    pub fn with_pack_kernel(mut self, kernel: PackKernel) -> Self {
        self.pack_kernel = kernel;
        self
    }

    pub fn rank(&self) -> usize {
        self.binding.rank
    }

    pub fn pack_kernel(&self) -> PackKernel {
        self.pack_kernel
    }

    pub fn world_size(&self) -> usize {
        self.binding.world_size
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn timings(&self) -> &StageTimer {
        &self.timer
    }

    fn transition(&mut self, next: ContextState) -> Result<()> {
        if self.state == ContextState::Terminated {
            return Err(PipelineError::ContextTerminated { rank: self.rank() });
        }
        if !self.state.can_become(next) {
            return Err(PipelineError::InvalidTransition { from: self.state, to: next });
        }
        debug!(rank = self.rank(), from = %self.state, to = %next, "context transition");
        self.state = next;
        Ok(())
    }

    fn join_group(&mut self, rendezvous: &dyn Rendezvous) -> Result<()> {
        self.transition(ContextState::JoiningGroup)?;
        let DeviceBinding { rank, world_size, .. } = self.binding;
        let joined = self.timer.time("join_group", || rendezvous.join(rank, world_size));
        match joined {
            Ok(group) => {
                self.group = Some(group);
                Ok(())
            }
            Err(e) => {
                self.terminate();
                Err(PipelineError::GroupJoinFailed { rank, reason: e.to_string() })
            }
        }
    }

    fn load(&mut self, component: ModelComponent, factories: &ModelFactories) -> Result<()> {
        self.transition(ContextState::loading(component))?;
        let binding = self.binding;

        let loaded = match component {
            ModelComponent::TextEncoder => self
                .timer
                .time("load_text_encoder", || factories.text_encoder.get_model(&binding))
                .map(|m| self.text_encoder = Some(m)),
            ModelComponent::Denoiser => self
                .timer
                .time("load_denoiser", || factories.denoiser.get_model(&binding))
                .map(|m| self.denoiser = Some(m)),
            ModelComponent::Decoder => self
                .timer
                .time("load_decoder", || factories.decoder.get_model(&binding))
                .map(|m| self.decoder = Some(m)),
        };

        if let Err(e) = loaded {
            warn!(rank = binding.rank, %component, error = %e, "model load failed");
            self.terminate();
            return Err(PipelineError::ModelLoadFailed {
                rank: binding.rank,
                component,
                reason: format!("{e:#}"),
            });
        }
        debug!(rank = binding.rank, %component, "model loaded");
        Ok(())
    }

    /// Execute one unit of work. Only valid in `Ready`; the context returns
    /// to `Ready` whether or not the work succeeds.
    pub fn run<T>(&mut self, work: impl FnOnce(&mut RankContext) -> Result<T>) -> Result<T> {
        self.transition(ContextState::Running)?;
        let out = work(self);
        if self.state == ContextState::Running {
            self.transition(ContextState::Ready)?;
        }
        out
    }

    /// Tag everything this rank sends from now on with request `epoch`, and
    /// discard whatever peers left behind from earlier requests.
    pub fn enter_request(&mut self, epoch: u64) {
        if let Some(group) = self.group.as_deref_mut() {
            debug!(rank = self.binding.rank, epoch, "entering request");
            group.set_epoch(epoch);
        }
    }

    /// Models and group, for work running inside [`Self::run`].
    pub fn parts(&mut self) -> Result<RankParts<'_>> {
        let rank = self.rank();
        if self.state != ContextState::Running {
            return Err(match self.state {
                ContextState::Terminated => PipelineError::ContextTerminated { rank },
                from => PipelineError::InvalidTransition { from, to: ContextState::Running },
            });
        }
        match (
            self.group.as_deref_mut(),
            self.text_encoder.as_deref(),
            self.denoiser.as_deref(),
            self.decoder.as_deref(),
        ) {
            (Some(group), Some(text_encoder), Some(denoiser), Some(decoder)) => Ok(RankParts {
                binding: self.binding,
                pack_kernel: self.pack_kernel,
                group,
                text_encoder,
                denoiser,
                decoder,
            }),
            _ => Err(PipelineError::ContextTerminated { rank }),
        }
    }

    /// Drop every model and destroy the group. Idempotent.
    pub fn terminate(&mut self) {
        if self.state == ContextState::Terminated {
            return;
        }
        self.text_encoder = None;
        self.denoiser = None;
        self.decoder = None;
        if let Some(mut group) = self.group.take() {
            group.destroy();
        }
        self.state = ContextState::Terminated;
        info!(rank = self.rank(), "context terminated");
    }
}

impl Drop for RankContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
