use crate::error::Result;

/// A set of ranks that was created collectively and can synchronize on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    id: usize,
    ranks: Vec<usize>,
}

impl ProcessGroup {
    pub(crate) fn new(id: usize, ranks: Vec<usize>) -> Self {
        Self { id, ranks }
    }

    /// The id the coordinator assigned to this group.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The global ranks of the members, in group order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    /// The position of the global `rank` inside this group.
    pub fn group_rank(&self, rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }
}

/// A synchronization point shared by every worker of the job.
#[allow(unused)]
#[trait_variant::make(Collective: Send)]
pub trait LocalCollective {
    /// Blocks until every worker arrived at this barrier.
    ///
    /// # Returns
    /// An error if the fabric broke down while waiting.
    async fn barrier(&mut self) -> Result<()>;
}
