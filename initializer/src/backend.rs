use log::info;

use crate::{
    config::BackendKind,
    error::{InitErr, Result},
    rendezvous::{Fabric, Rendezvous},
};

/// A transport a worker can join the job with.
#[allow(unused)]
#[trait_variant::make(Backend: Send)]
pub trait LocalBackend: Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this transport can only run with a device bound to the process.
    fn requires_device(&self) -> bool;

    /// Performs the rendezvous for this transport.
    ///
    /// # Arguments
    /// * `rdzv` - The endpoint, rank, world size and deadline of the rendezvous.
    ///
    /// # Returns
    /// The control plane connection shared by every later collective.
    async fn join(&self, rdzv: &Rendezvous) -> Result<Fabric>;
}

/// Host side collectives over TCP, runs with or without devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gloo;

impl Backend for Gloo {
    fn kind(&self) -> BackendKind {
        BackendKind::Gloo
    }

    fn requires_device(&self) -> bool {
        false
    }

    async fn join(&self, rdzv: &Rendezvous) -> Result<Fabric> {
        Fabric::join(rdzv).await
    }
}

/// Device interconnect collectives. The device communicators are created by the compute
/// layer, this backend provides the TCP control plane they bootstrap from.
#[derive(Debug, Clone, Copy, Default)]
pub struct Nccl;

impl Backend for Nccl {
    fn kind(&self) -> BackendKind {
        BackendKind::Nccl
    }

    fn requires_device(&self) -> bool {
        true
    }

    async fn join(&self, rdzv: &Rendezvous) -> Result<Fabric> {
        Fabric::join(rdzv).await
    }
}

/// Joins through `backend` after checking it can run here.
///
/// # Arguments
/// * `backend` - The transport strategy.
/// * `rdzv` - The rendezvous to join.
/// * `device` - The device bound to this process, if any.
pub async fn join_with<B: Backend>(
    backend: &B,
    rdzv: &Rendezvous,
    device: Option<usize>,
) -> Result<Fabric> {
    if backend.requires_device() && device.is_none() {
        return Err(InitErr::BackendUnsupported {
            backend: backend.kind(),
            reason: "it requires a device bound to this process",
        });
    }

    info!(
        backend:% = backend.kind(),
        rank = rdzv.rank,
        world_size = rdzv.world_size;
        "joining {}", rdzv.init_method()
    );

    backend.join(rdzv).await
}

impl BackendKind {
    /// Resolves the strategy for this backend and joins through it.
    pub async fn join(self, rdzv: &Rendezvous, device: Option<usize>) -> Result<Fabric> {
        match self {
            BackendKind::Gloo => join_with(&Gloo, rdzv, device).await,
            BackendKind::Nccl => join_with(&Nccl, rdzv, device).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn only_nccl_needs_a_device() {
        assert!(!Backend::requires_device(&Gloo));
        assert!(Backend::requires_device(&Nccl));
    }

    #[tokio::test]
    async fn nccl_without_device_is_refused_before_connecting() {
        let rdzv = Rendezvous {
            endpoint: "127.0.0.1:1".into(),
            rank: 1,
            world_size: 2,
            timeout: Duration::from_secs(60),
        };

        let err = BackendKind::Nccl.join(&rdzv, None).await.err().unwrap();
        assert!(matches!(
            err,
            InitErr::BackendUnsupported {
                backend: BackendKind::Nccl,
                ..
            }
        ));
    }
}
