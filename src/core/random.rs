use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Bernoulli;

use super::error::{Error, Result};
use super::next_sequential_number;

pub trait RandomSource {
    /// Fills `keep` with independent keep decisions, each `false` with
    /// probability `ratio`.
    fn fill(&mut self, keep: &mut [bool], ratio: f64) -> Result<()>;
}

pub trait Handle {
    type Source: RandomSource;

    fn identifier(&self) -> u64;
    fn generator(&self, seed: u64) -> Self::Source;
}

#[derive(Debug)]
pub struct CpuHandle {
    identifier: u64,
}

impl CpuHandle {
    pub fn new() -> Self {
        Self {
            identifier: next_sequential_number(),
        }
    }
}

impl Default for CpuHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Handle for CpuHandle {
    type Source = SeededSource;

    fn identifier(&self) -> u64 {
        self.identifier
    }

    fn generator(&self, seed: u64) -> SeededSource {
        SeededSource::new(seed)
    }
}

pub struct SeededSource {
    rng: StdRng,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededSource {
    fn fill(&mut self, keep: &mut [bool], ratio: f64) -> Result<()> {
        let distribution = Bernoulli::new(1.0 - ratio)
            .map_err(|e| Error::invalid_argument("random fill", e.to_string()))?;
        for slot in keep.iter_mut() {
            *slot = self.rng.sample(distribution);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_seeds_equal_streams() {
        let handle = CpuHandle::new();
        let mut first = handle.generator(100);
        let mut second = handle.generator(100);
        let mut a = vec![false; 64];
        let mut b = vec![false; 64];
        for _ in 0..3 {
            first.fill(&mut a, 0.3).unwrap();
            second.fill(&mut b, 0.3).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let handle = CpuHandle::new();
        let mut a = vec![false; 256];
        let mut b = vec![false; 256];
        handle.generator(0).fill(&mut a, 0.5).unwrap();
        handle.generator(1).fill(&mut b, 0.5).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_keep_rate_tracks_ratio() {
        let mut source = SeededSource::new(7);
        let mut keep = vec![false; 10_000];
        source.fill(&mut keep, 0.2).unwrap();
        let kept = keep.iter().filter(|&&k| k).count() as f64 / keep.len() as f64;
        assert!((kept - 0.8).abs() < 0.03, "kept fraction {}", kept);
    }

    #[test]
    fn test_zero_ratio_keeps_everything() {
        let mut source = SeededSource::new(0);
        let mut keep = vec![false; 100];
        source.fill(&mut keep, 0.0).unwrap();
        assert!(keep.iter().all(|&k| k));
    }

    #[test]
    fn test_handles_are_distinct() {
        assert_ne!(CpuHandle::new().identifier(), CpuHandle::new().identifier());
    }

    #[test]
    fn test_impossible_ratio_is_rejected() {
        let mut keep = vec![false; 4];
        assert!(matches!(
            SeededSource::new(0).fill(&mut keep, 1.5),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
