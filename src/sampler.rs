//! Deterministic, quota-aware selection of related identifiers.
//!
//! Every source reseeds the generator, so the order chosen for one source
//! never depends on how many sources were processed before it.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// What to do with a source that cited fewer identifiers than the quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnderQuota {
    /// Attempt nothing.
    #[default]
    Strict,
    /// Attempt every candidate.
    Available,
}

/// SplitMix64. Fixed so orderings are identical across builds and platforms.
struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64_internal(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl rand::RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.next_u64_internal() as u32
    }

    fn next_u64(&mut self) -> u64 {
        self.next_u64_internal()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut offset = 0;
        while offset < dest.len() {
            let bytes = self.next_u64_internal().to_le_bytes();
            let copy_len = (dest.len() - offset).min(bytes.len());
            dest[offset..offset + copy_len].copy_from_slice(&bytes[..copy_len]);
            offset += copy_len;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    pub quota: usize,
    pub seed: u64,
    pub policy: UnderQuota,
}

impl Sampler {
    pub fn new(quota: usize, seed: u64) -> Self {
        Self {
            quota,
            seed,
            policy: UnderQuota::Strict,
        }
    }

    pub fn with_policy(mut self, policy: UnderQuota) -> Self {
        self.policy = policy;
        self
    }

    /// Candidates in attempt order: de-duplicated, then shuffled with the
    /// seed. Empty under the strict policy when there are fewer distinct
    /// candidates than the quota.
    pub fn select(&self, candidates: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut pool: Vec<String> = candidates
            .iter()
            .filter(|c| seen.insert(c.as_str()))
            .cloned()
            .collect();

        if pool.len() < self.quota && self.policy == UnderQuota::Strict {
            return Vec::new();
        }

        let mut rng = DeterministicRng::new(self.seed);
        pool.shuffle(&mut rng);
        pool
    }

    pub fn run(&self, candidates: &[String]) -> SampleRun {
        let order = self.select(candidates);
        let target = self.quota.min(order.len());
        SampleRun {
            order,
            cursor: 0,
            accounted: 0,
            target,
        }
    }
}

/// Shorthand for a strict [`Sampler`].
pub fn select(candidates: &[String], quota: usize, seed: u64) -> Vec<String> {
    Sampler::new(quota, seed).select(candidates)
}

/// Walks a selection until the quota is accounted for.
///
/// The caller calls [`SampleRun::account`] for every candidate that already
/// has a record or was just completed; failed candidates don't count and the
/// walk moves on to the next one.
#[derive(Debug)]
pub struct SampleRun {
    order: Vec<String>,
    cursor: usize,
    accounted: usize,
    target: usize,
}

impl SampleRun {
    pub fn next_candidate(&mut self) -> Option<String> {
        if self.is_satisfied() {
            return None;
        }
        let next = self.order.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(next)
    }

    pub fn account(&mut self) {
        self.accounted += 1;
    }

    pub fn is_satisfied(&self) -> bool {
        self.accounted >= self.target
    }

    pub fn accounted(&self) -> usize {
        self.accounted
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn candidates(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("US{i:04}")).collect()
    }

    #[test]
    fn same_seed_same_order() {
        let candidates = ids(12);
        let a = select(&candidates, 5, 1999);
        let b = select(&candidates, 5, 1999);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);

        let mut sorted = a.clone();
        sorted.sort();
        assert_eq!(sorted, candidates);
    }

    #[test]
    fn different_seed_different_order() {
        let candidates = ids(12);
        assert_ne!(select(&candidates, 5, 1999), select(&candidates, 5, 2000));
    }

    #[test]
    fn fewer_candidates_than_quota_attempts_nothing() {
        assert!(select(&ids(4), 5, 1999).is_empty());
        assert!(select(&[], 5, 1999).is_empty());
        assert_eq!(select(&ids(5), 5, 1999).len(), 5);
    }

    #[test]
    fn duplicates_do_not_fill_the_quota() {
        let mut candidates = ids(4);
        candidates.push("US0000".into());
        assert!(select(&candidates, 5, 1999).is_empty());
    }

    #[test]
    fn available_policy_takes_what_there_is() {
        let sampler = Sampler::new(5, 1999).with_policy(UnderQuota::Available);
        let order = sampler.select(&ids(3));
        assert_eq!(order.len(), 3);
        assert_eq!(sampler.run(&ids(3)).target(), 3);
    }

    #[test]
    fn run_stops_once_quota_accounted() {
        let sampler = Sampler::new(2, 7);
        let mut run = sampler.run(&ids(6));
        let mut attempted = Vec::new();
        while let Some(id) = run.next_candidate() {
            attempted.push(id);
            // Every other attempt fails.
            if attempted.len() % 2 == 0 {
                run.account();
            }
        }
        assert_eq!(attempted.len(), 4);
        assert_eq!(run.accounted(), 2);
        assert!(run.is_satisfied());
        assert_eq!(attempted, sampler.select(&ids(6))[..4].to_vec());
    }

    #[test]
    fn run_exhausts_when_too_many_fail() {
        let mut run = Sampler::new(3, 7).run(&ids(4));
        let mut attempted = 0;
        while run.next_candidate().is_some() {
            attempted += 1;
        }
        assert_eq!(attempted, 4);
        assert!(!run.is_satisfied());
    }

    #[test]
    fn stop_point_is_deterministic() {
        let candidates = ids(9);
        let walk = || {
            let mut run = Sampler::new(3, 1999).run(&candidates);
            let mut seen = Vec::new();
            while let Some(id) = run.next_candidate() {
                if !id.ends_with('3') {
                    run.account();
                }
                seen.push(id);
            }
            seen
        };
        assert_eq!(walk(), walk());
    }
}
