mod backend;
mod bootstrap;
mod config;
mod error;
mod group;
mod probe;
mod rendezvous;
mod resume;
mod seed;
mod telemetry;
mod topology;

#[cfg(test)]
mod testing;

pub use backend::{Backend, Gloo, LocalBackend, Nccl};
pub use bootstrap::{Bootstrapper, WorkerContext, local_rank_for};
pub use config::{BackendKind, Configuration, LocalRankCheck};
pub use error::{InitErr, Result};
pub use group::{Collective, LocalCollective, ProcessGroup};
pub use probe::{Accelerator, DIAGNOSTIC_ENDPOINT, DiagnosticErr, NvidiaSmi, Probe, Prober, probe};
pub use rendezvous::{Coordinator, Fabric, Rendezvous};
pub use resume::{DeadlineResume, ResumeService, ResumeSession, ResumeState};
pub use seed::{MODEL_PARALLEL_RNG, RngTracker, SeedState, model_parallel_seed};
pub use telemetry::{JsonLinesSink, TelemetryRecord, TelemetrySink};
pub use topology::{Grid, ParallelTopology};

use log::{debug, info};

/// Everything a worker knows once initialization finished.
pub struct Initialized {
    pub context: WorkerContext,
    pub topology: ParallelTopology,
    pub seeds: SeedState,
    pub resume: ResumeState,
}

/// Drives one worker through probing, bootstrap, topology, seeding, resume and telemetry.
pub struct Initializer<A> {
    config: Configuration,
    prober: Prober,
    bootstrapper: Bootstrapper<A>,
    resume: Option<Box<dyn ResumeService>>,
    sink: Option<Box<dyn TelemetrySink>>,
}

impl<A: Accelerator> Initializer<A> {
    pub fn new(config: Configuration, accelerator: A) -> Self {
        Self {
            config,
            prober: Prober::default(),
            bootstrapper: Bootstrapper::new(accelerator),
            resume: None,
            sink: None,
        }
    }

    /// Sends accelerator diagnostics through `prober` instead of the default endpoint.
    pub fn with_prober(mut self, prober: Prober) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_resume(mut self, service: Box<dyn ResumeService>) -> Self {
        self.resume = Some(service);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The configuration as resolved so far, `local_rank` is filled in by the bootstrap.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// The control plane connection, available once `initialize` joined the job.
    pub fn fabric(&mut self) -> Result<&mut Fabric> {
        self.bootstrapper.fabric()
    }

    /// Runs the whole initialization pipeline for this worker.
    ///
    /// Calling it again reuses the existing job membership instead of joining twice.
    ///
    /// # Returns
    /// The worker's context, topology, random state and resume state.
    ///
    /// # Errors
    /// Any fatal `InitErr`, later phases don't run once one of them fails.
    pub async fn initialize(&mut self) -> Result<Initialized> {
        self.config.validate()?;

        let devices = self
            .prober
            .ensure_ready(
                self.bootstrapper.accelerator(),
                self.config.require_accelerator,
            )
            .await?;

        let context = self.bootstrapper.bootstrap(&mut self.config).await?;
        let fabric = self.bootstrapper.fabric()?;

        let model_parallel_size = self.config.model_parallel_size;
        let topology = if devices > 0 && model_parallel_size > 1 {
            ParallelTopology::build(fabric, model_parallel_size).await?
        } else {
            debug!(
                devices = devices,
                model_parallel_size = model_parallel_size;
                "skipping model parallel groups"
            );
            ParallelTopology::unpartitioned(context.rank, context.world_size)
        };

        if context.rank == 0 {
            info!(
                "> setting random seeds to {} ...",
                self.config
                    .seed
                    .map_or_else(|| "None".to_string(), |seed| seed.to_string())
            );
        }

        let model_parallel_rank = topology
            .is_model_parallel()
            .then(|| topology.model_parallel_rank());
        let seeds = SeedState::synchronize(self.config.seed, model_parallel_rank)?;

        let service = match &mut self.resume {
            Some(service) => Some(service.as_mut() as &mut dyn ResumeService),
            None => None,
        };
        let resume = ResumeSession::new().coordinate(fabric, service).await?;

        let sink = match &mut self.sink {
            Some(sink) => Some(sink.as_mut() as &mut dyn TelemetrySink),
            None => None,
        };
        telemetry::report(&self.config, sink);

        Ok(Initialized {
            context,
            topology,
            seeds,
            resume,
        })
    }

    /// Leaves the job, rank 0 also waits for the coordinator to wind down.
    pub async fn shutdown(self) -> Result<()> {
        match self.bootstrapper.into_fabric() {
            Some(fabric) => fabric.shutdown().await,
            None => Ok(()),
        }
    }
}
