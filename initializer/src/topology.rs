//! Splits the world into model parallel and data parallel groups.
//!
//! Ranks are laid out as a row-major grid of `data_parallel_size` rows by
//! `model_parallel_size` columns: a row is a model parallel group sharing one replica,
//! a column is a data parallel group holding the same shard of every replica.

use log::info;

use crate::{
    error::{InitErr, Result},
    group::ProcessGroup,
    rendezvous::Fabric,
};

/// The shape of the rank grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    world_size: usize,
    model_parallel_size: usize,
}

impl Grid {
    /// Creates a new `Grid`.
    ///
    /// # Errors
    /// `InitErr::TopologyMisconfiguration` if `model_parallel_size` doesn't divide `world_size`.
    pub fn new(world_size: usize, model_parallel_size: usize) -> Result<Self> {
        if model_parallel_size == 0 || world_size % model_parallel_size != 0 {
            return Err(InitErr::TopologyMisconfiguration {
                world_size,
                model_parallel_size,
            });
        }

        Ok(Self {
            world_size,
            model_parallel_size,
        })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn model_parallel_size(&self) -> usize {
        self.model_parallel_size
    }

    pub fn data_parallel_size(&self) -> usize {
        self.world_size / self.model_parallel_size
    }

    pub fn model_parallel_rank(&self, rank: usize) -> usize {
        rank % self.model_parallel_size
    }

    pub fn data_parallel_rank(&self, rank: usize) -> usize {
        rank / self.model_parallel_size
    }

    /// The contiguous block of ranks sharing `rank`'s replica.
    pub fn model_parallel_group(&self, rank: usize) -> Vec<usize> {
        let start = self.data_parallel_rank(rank) * self.model_parallel_size;
        (start..start + self.model_parallel_size).collect()
    }

    /// The ranks holding `rank`'s shard in every replica.
    pub fn data_parallel_group(&self, rank: usize) -> Vec<usize> {
        let offset = self.model_parallel_rank(rank);
        (offset..self.world_size)
            .step_by(self.model_parallel_size)
            .collect()
    }

    /// Every model parallel group, by data parallel rank.
    pub fn model_parallel_groups(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.data_parallel_size())
            .map(move |row| self.model_parallel_group(row * self.model_parallel_size))
    }

    /// Every data parallel group, by model parallel rank.
    pub fn data_parallel_groups(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        (0..self.model_parallel_size)
            .map(move |col| self.data_parallel_group(col))
    }
}

/// A rank's place in the grid together with the handles of both its groups.
#[derive(Debug, Clone)]
pub struct ParallelTopology {
    grid: Grid,
    rank: usize,
    model_parallel_group: Option<ProcessGroup>,
    data_parallel_group: Option<ProcessGroup>,
}

impl ParallelTopology {
    /// A topology without model parallelism or group handles, every rank is its own replica.
    pub fn unpartitioned(rank: usize, world_size: usize) -> Self {
        Self {
            grid: Grid {
                world_size,
                model_parallel_size: 1,
            },
            rank,
            model_parallel_group: None,
            data_parallel_group: None,
        }
    }

    /// Creates every data parallel and then every model parallel group through `fabric`.
    ///
    /// Group creation is collective, every rank creates every group in the same order
    /// and keeps the handles of the two it belongs to.
    ///
    /// # Errors
    /// `InitErr::TopologyMisconfiguration` before any group is created if the sizes don't
    /// divide, or any fabric error.
    pub async fn build(fabric: &mut Fabric, model_parallel_size: usize) -> Result<Self> {
        let grid = Grid::new(fabric.world_size(), model_parallel_size)?;
        let rank = fabric.rank();

        let mut data_parallel_group = None;
        for ranks in grid.data_parallel_groups() {
            let member = ranks.contains(&rank);
            let group = fabric.new_group(ranks).await?;
            if member {
                data_parallel_group = Some(group);
            }
        }

        let mut model_parallel_group = None;
        for ranks in grid.model_parallel_groups() {
            let member = ranks.contains(&rank);
            let group = fabric.new_group(ranks).await?;
            if member {
                model_parallel_group = Some(group);
            }
        }

        if rank == 0 {
            info!(
                model_parallel_size = grid.model_parallel_size(),
                data_parallel_size = grid.data_parallel_size();
                "> initialized model parallel with size {}",
                grid.model_parallel_size()
            );
        }

        Ok(Self {
            grid,
            rank,
            model_parallel_group,
            data_parallel_group,
        })
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn model_parallel_size(&self) -> usize {
        self.grid.model_parallel_size()
    }

    pub fn data_parallel_size(&self) -> usize {
        self.grid.data_parallel_size()
    }

    pub fn model_parallel_rank(&self) -> usize {
        self.grid.model_parallel_rank(self.rank)
    }

    pub fn data_parallel_rank(&self) -> usize {
        self.grid.data_parallel_rank(self.rank)
    }

    pub fn is_model_parallel(&self) -> bool {
        self.grid.model_parallel_size() > 1
    }

    pub fn model_parallel_group(&self) -> Option<&ProcessGroup> {
        self.model_parallel_group.as_ref()
    }

    pub fn data_parallel_group(&self) -> Option<&ProcessGroup> {
        self.data_parallel_group.as_ref()
    }
}
