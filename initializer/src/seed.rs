//! Seeds the random streams of a worker.
//!
//! The global stream is identical on every rank. The model parallel stream differs
//! between the shards of a replica and repeats across replicas.

use std::collections::{BTreeMap, HashSet};

use log::debug;
use rand::{SeedableRng, rngs::StdRng};

use crate::error::{InitErr, Result};

/// The name of the stream used inside sharded computations.
pub const MODEL_PARALLEL_RNG: &str = "model-parallel-rng";

const MODEL_PARALLEL_SEED_OFFSET: u64 = 2718;

/// The model parallel seed of a shard, independent of the replica it belongs to.
pub fn model_parallel_seed(base_seed: u64, model_parallel_rank: usize) -> u64 {
    base_seed + MODEL_PARALLEL_SEED_OFFSET + model_parallel_rank as u64
}

/// Named, independently seeded random streams.
#[derive(Debug, Default)]
pub struct RngTracker {
    streams: BTreeMap<String, StdRng>,
    seeds: HashSet<u64>,
}

impl RngTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new stream.
    ///
    /// # Errors
    /// `InitErr::RngStream` if the name or the seed is already taken, two streams sharing a
    /// seed would be perfectly correlated.
    pub fn add(&mut self, name: &str, seed: u64) -> Result<()> {
        if self.streams.contains_key(name) {
            return Err(InitErr::RngStream(format!("{name} already exists")));
        }
        if !self.seeds.insert(seed) {
            return Err(InitErr::RngStream(format!("seed {seed} already exists")));
        }

        self.streams
            .insert(name.to_string(), StdRng::seed_from_u64(seed));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Runs `f` drawing from the stream `name`, the stream advances by what `f` consumed.
    ///
    /// # Errors
    /// `InitErr::RngStream` if no stream is registered under `name`.
    pub fn fork<T, F>(&mut self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut StdRng) -> T,
    {
        let rng = self
            .streams
            .get_mut(name)
            .ok_or_else(|| InitErr::RngStream(format!("{name} is not registered")))?;

        Ok(f(rng))
    }
}

/// Every random stream of a worker, derived from one positive seed.
#[derive(Debug)]
pub struct SeedState {
    base_seed: u64,
    global: StdRng,
    tracker: RngTracker,
}

impl SeedState {
    /// Seeds the global stream and, for a model parallel rank, the model parallel stream.
    ///
    /// # Arguments
    /// * `seed` - The configured seed.
    /// * `model_parallel_rank` - This worker's shard position, `None` without model parallelism.
    ///
    /// # Errors
    /// `InitErr::InvalidSeed` if `seed` is absent or not positive, nothing is seeded then.
    pub fn synchronize(seed: Option<i64>, model_parallel_rank: Option<usize>) -> Result<Self> {
        let base_seed = match seed {
            Some(seed) if seed > 0 => seed as u64,
            other => return Err(InitErr::InvalidSeed(other)),
        };

        let mut tracker = RngTracker::new();

        if let Some(mp_rank) = model_parallel_rank {
            let seed = model_parallel_seed(base_seed, mp_rank);
            debug!(model_parallel_rank = mp_rank, seed = seed; "seeding model parallel stream");
            tracker.add(MODEL_PARALLEL_RNG, seed)?;
        }

        Ok(Self {
            base_seed,
            global: StdRng::seed_from_u64(base_seed),
            tracker,
        })
    }

    pub fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// The stream every rank draws identically from, e.g. to shuffle before sharding.
    pub fn global(&mut self) -> &mut StdRng {
        &mut self.global
    }

    /// A generator starting where the global stream currently is, for another consumer.
    ///
    /// Host side sampling, numeric initialization and compute kernels each take one so they
    /// all see the same sequence.
    pub fn fork_global(&self) -> StdRng {
        self.global.clone()
    }

    pub fn tracker(&mut self) -> &mut RngTracker {
        &mut self.tracker
    }

    pub fn is_model_parallel(&self) -> bool {
        self.tracker.contains(MODEL_PARALLEL_RNG)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::topology::Grid;

    fn draws(rng: &mut StdRng) -> Vec<u64> {
        (0..16).map(|_| rng.random()).collect()
    }

    fn model_parallel_draws(rank: usize, grid: Grid) -> Vec<u64> {
        let mp_rank = grid.model_parallel_rank(rank);
        let mut state = SeedState::synchronize(Some(1234), Some(mp_rank)).unwrap();
        state.tracker().fork(MODEL_PARALLEL_RNG, draws).unwrap()
    }

    #[test]
    fn global_stream_is_deterministic() {
        let mut first = SeedState::synchronize(Some(42), None).unwrap();
        let mut second = SeedState::synchronize(Some(42), Some(3)).unwrap();

        assert_eq!(draws(first.global()), draws(second.global()));
    }

    #[test]
    fn forked_global_repeats_the_sequence() {
        let mut state = SeedState::synchronize(Some(7), None).unwrap();

        let mut fork = state.fork_global();
        assert_eq!(draws(&mut fork), draws(state.global()));
    }

    #[test]
    fn replicas_of_a_shard_share_the_model_parallel_stream() {
        let grid = Grid::new(8, 2).unwrap();

        assert_eq!(grid.data_parallel_rank(1), 0);
        assert_eq!(grid.data_parallel_rank(3), 1);
        assert_eq!(model_parallel_draws(1, grid), model_parallel_draws(3, grid));
    }

    #[test]
    fn shards_of_a_replica_are_decorrelated() {
        let grid = Grid::new(8, 2).unwrap();

        assert_ne!(model_parallel_draws(0, grid), model_parallel_draws(1, grid));
        assert_ne!(model_parallel_seed(1234, 0), model_parallel_seed(1234, 1));
    }

    #[test]
    fn model_parallel_stream_differs_from_global() {
        let mut state = SeedState::synchronize(Some(99), Some(0)).unwrap();

        let global = draws(state.global());
        let sharded = state.tracker().fork(MODEL_PARALLEL_RNG, draws).unwrap();
        assert_ne!(global, sharded);
        assert!(state.is_model_parallel());
    }

    #[test]
    fn stream_only_exists_with_model_parallelism() {
        let mut state = SeedState::synchronize(Some(5), None).unwrap();

        assert!(!state.is_model_parallel());
        assert!(matches!(
            state.tracker().fork(MODEL_PARALLEL_RNG, draws),
            Err(InitErr::RngStream(_))
        ));
    }

    #[test]
    fn non_positive_or_missing_seed_is_rejected() {
        for seed in [Some(0), Some(-1), Some(i64::MIN), None] {
            let res = SeedState::synchronize(seed, Some(0));
            assert!(matches!(res, Err(InitErr::InvalidSeed(s)) if s == seed));
        }
    }

    #[test]
    fn tracker_rejects_reused_names_and_seeds() {
        let mut tracker = RngTracker::new();
        tracker.add("dropout", 10).unwrap();

        assert!(tracker.add("dropout", 11).is_err());
        assert!(tracker.add("init", 10).is_err());

        tracker.add("init", 11).unwrap();
        let names: Vec<_> = tracker.names().collect();
        assert_eq!(names, vec!["dropout", "init"]);
    }
}
