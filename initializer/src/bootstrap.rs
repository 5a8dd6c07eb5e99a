use log::{info, warn};

use crate::{
    config::{BackendKind, Configuration, LocalRankCheck},
    error::{InitErr, Result},
    probe::Accelerator,
    rendezvous::{Fabric, Rendezvous},
};

/// Who this worker is inside the job, fixed once the rendezvous completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: Option<usize>,
    pub device: Option<usize>,
    pub backend: BackendKind,
}

enum Lifecycle {
    Uninitialized,
    Bootstrapped {
        fabric: Fabric,
        context: WorkerContext,
    },
}

/// Binds the worker to its device and joins the job's control plane.
pub struct Bootstrapper<A> {
    accelerator: A,
    lifecycle: Lifecycle,
}

impl<A: Accelerator> Bootstrapper<A> {
    pub fn new(accelerator: A) -> Self {
        Self {
            accelerator,
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    pub fn accelerator(&self) -> &A {
        &self.accelerator
    }

    pub fn is_bootstrapped(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Bootstrapped { .. })
    }

    /// The control plane connection of a bootstrapped worker.
    pub fn fabric(&mut self) -> Result<&mut Fabric> {
        match &mut self.lifecycle {
            Lifecycle::Bootstrapped { fabric, .. } => Ok(fabric),
            Lifecycle::Uninitialized => Err(InitErr::Protocol(
                "the worker has not joined the job yet".into(),
            )),
        }
    }

    pub fn into_fabric(self) -> Option<Fabric> {
        match self.lifecycle {
            Lifecycle::Bootstrapped { fabric, .. } => Some(fabric),
            Lifecycle::Uninitialized => None,
        }
    }

    /// Joins the job described by `cfg`, or adopts the existing membership on re-entry.
    ///
    /// A fresh bootstrap fills in `cfg.local_rank` when it's absent. On re-entry `cfg.rank` and
    /// `cfg.world_size` are overwritten with the values the job was joined with.
    ///
    /// # Errors
    /// `InitErr::RendezvousTimeout` if the world didn't assemble in time,
    /// `InitErr::LocalRankMismatch` under a strict local rank check, or any fabric error.
    pub async fn bootstrap(&mut self, cfg: &mut Configuration) -> Result<WorkerContext> {
        let device_count = self.accelerator.device_count();

        if let Lifecycle::Bootstrapped { fabric, context } = &self.lifecycle {
            if cfg.rank == 0 {
                info!("distributed fabric is already initialized, skipping initialization");
            }

            cfg.rank = fabric.rank();
            cfg.world_size = fabric.world_size();

            if let (Some(expected), Some(device)) = (
                local_rank_for(cfg.rank, device_count),
                self.accelerator.current_device(),
            ) {
                check_local_rank(cfg.local_rank_check, device, expected)?;
            }

            return Ok(context.clone());
        }

        info!(rank = cfg.rank; "> initializing distributed ...");

        let device = match local_rank_for(cfg.rank, device_count) {
            Some(device) => {
                match cfg.local_rank {
                    Some(local_rank) => check_local_rank(cfg.local_rank_check, local_rank, device)?,
                    None => cfg.local_rank = Some(device),
                }

                self.accelerator.bind(device)?;
                Some(device)
            }
            None => {
                warn!(rank = cfg.rank; "no devices to bind, degraded single stream mode");
                None
            }
        };

        let rdzv = Rendezvous {
            endpoint: cfg.endpoint(),
            rank: cfg.rank,
            world_size: cfg.world_size,
            timeout: cfg.rendezvous_timeout(),
        };
        let fabric = cfg.distributed_backend.join(&rdzv, device).await?;

        let context = WorkerContext {
            rank: fabric.rank(),
            world_size: fabric.world_size(),
            local_rank: cfg.local_rank,
            device,
            backend: cfg.distributed_backend,
        };

        info!(rank = context.rank, world_size = context.world_size; "joined the job");
        self.lifecycle = Lifecycle::Bootstrapped {
            fabric,
            context: context.clone(),
        };

        Ok(context)
    }
}

/// The device a rank is bound to under the round robin layout, `None` without devices.
pub fn local_rank_for(rank: usize, device_count: usize) -> Option<usize> {
    (device_count > 0).then(|| rank % device_count)
}

fn check_local_rank(policy: LocalRankCheck, local_rank: usize, expected: usize) -> Result<()> {
    if local_rank == expected {
        return Ok(());
    }

    match policy {
        LocalRankCheck::Strict => Err(InitErr::LocalRankMismatch {
            local_rank,
            expected,
        }),
        LocalRankCheck::Relaxed => {
            warn!(
                local_rank = local_rank,
                expected = expected;
                "local rank differs from rank % device count"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeAccelerator, free_port, loopback_config};

    #[test]
    fn rank_maps_round_robin_onto_devices() {
        assert_eq!(local_rank_for(6, 4), Some(2));
        assert_eq!(local_rank_for(3, 4), Some(3));
        assert_eq!(local_rank_for(0, 1), Some(0));
        assert_eq!(local_rank_for(5, 0), None);
    }

    #[test]
    fn relaxed_check_tolerates_mismatch() {
        assert!(check_local_rank(LocalRankCheck::Relaxed, 1, 0).is_ok());
        assert!(matches!(
            check_local_rank(LocalRankCheck::Strict, 1, 0),
            Err(InitErr::LocalRankMismatch {
                local_rank: 1,
                expected: 0
            })
        ));
    }

    #[tokio::test]
    async fn single_rank_bootstraps_and_fills_local_rank() {
        let mut cfg = loopback_config(0, 1, free_port());
        let mut bootstrapper = Bootstrapper::new(FakeAccelerator::new(4));

        let ctx = bootstrapper.bootstrap(&mut cfg).await.unwrap();

        assert_eq!(ctx.rank, 0);
        assert_eq!(ctx.world_size, 1);
        assert_eq!(ctx.local_rank, Some(0));
        assert_eq!(ctx.device, Some(0));
        assert_eq!(cfg.local_rank, Some(0));
        let current = bootstrapper.accelerator().current_device();
        assert_eq!(current, Some(0));

        let fabric = bootstrapper.into_fabric().unwrap();
        fabric.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reentry_adopts_the_existing_membership() {
        let mut cfg = loopback_config(0, 1, free_port());
        let mut bootstrapper = Bootstrapper::new(FakeAccelerator::new(2));
        let first = bootstrapper.bootstrap(&mut cfg).await.unwrap();

        cfg.world_size = 16;
        cfg.master_port = 1;
        let second = bootstrapper.bootstrap(&mut cfg).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cfg.world_size, 1);
        assert!(bootstrapper.is_bootstrapped());

        let fabric = bootstrapper.into_fabric().unwrap();
        fabric.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn strict_mismatch_fails_before_joining() {
        let mut cfg = loopback_config(0, 1, free_port());
        cfg.local_rank = Some(1);
        cfg.local_rank_check = LocalRankCheck::Strict;
        let mut bootstrapper = Bootstrapper::new(FakeAccelerator::new(2));

        let err = bootstrapper.bootstrap(&mut cfg).await.err().unwrap();

        assert!(matches!(err, InitErr::LocalRankMismatch { .. }));
        assert!(!bootstrapper.is_bootstrapped());
    }

    #[tokio::test]
    async fn unreachable_rendezvous_times_out() {
        let mut cfg = loopback_config(1, 2, free_port());
        cfg.rendezvous_timeout_ms = 300;
        let mut bootstrapper = Bootstrapper::new(FakeAccelerator::new(1));

        let started = tokio::time::Instant::now();
        let err = bootstrapper.bootstrap(&mut cfg).await.err().unwrap();

        assert!(matches!(
            err,
            InitErr::RendezvousTimeout { timeout, .. } if timeout == Duration::from_millis(300)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!bootstrapper.is_bootstrapped());
    }

    #[tokio::test]
    async fn degraded_mode_needs_a_host_backend() {
        let mut cfg = loopback_config(0, 1, free_port());
        cfg.distributed_backend = BackendKind::Nccl;
        let mut bootstrapper = Bootstrapper::new(FakeAccelerator::new(0));

        let err = bootstrapper.bootstrap(&mut cfg).await.err().unwrap();
        assert!(matches!(err, InitErr::BackendUnsupported { .. }));

        cfg.distributed_backend = BackendKind::Gloo;
        let ctx = bootstrapper.bootstrap(&mut cfg).await.unwrap();
        assert_eq!(ctx.device, None);
        assert_eq!(ctx.local_rank, None);

        let fabric = bootstrapper.into_fabric().unwrap();
        fabric.shutdown().await.unwrap();
    }
}
