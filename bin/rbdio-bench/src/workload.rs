//! Request generator

use anyhow::{Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Offset selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Pattern {
    /// Consecutive offsets, wrapping at the image end
    Seq,
    /// Uniformly random aligned offsets
    Rand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

/// Produces `(kind, offset)` pairs aligned to the request size
pub struct Workload {
    pattern: Pattern,
    io_size: u64,
    slots: u64,
    read_percent: u32,
    next_slot: u64,
    rng: StdRng,
}

impl Workload {
    pub fn new(
        pattern: Pattern,
        image_size: u64,
        io_size: u64,
        read_percent: u8,
        seed: u64,
    ) -> Result<Self> {
        if io_size == 0 {
            bail!("io size must be positive");
        }
        if image_size < io_size {
            bail!("image of {image_size} bytes cannot hold a {io_size} byte request");
        }
        if read_percent > 100 {
            bail!("read percentage {read_percent} above 100");
        }
        Ok(Self {
            pattern,
            io_size,
            slots: image_size / io_size,
            read_percent: u32::from(read_percent),
            next_slot: 0,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn next_io(&mut self) -> (IoKind, u64) {
        let slot = match self.pattern {
            Pattern::Seq => {
                let slot = self.next_slot;
                self.next_slot = (self.next_slot + 1) % self.slots;
                slot
            }
            Pattern::Rand => self.rng.gen_range(0..self.slots),
        };
        let kind = if self.rng.gen_range(0..100) < self.read_percent {
            IoKind::Read
        } else {
            IoKind::Write
        };
        (kind, slot * self.io_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_wraps() {
        let mut workload = Workload::new(Pattern::Seq, 3 * 4096, 4096, 0, 1).unwrap();
        let offsets: Vec<u64> = (0..4).map(|_| workload.next_io().1).collect();
        assert_eq!(offsets, vec![0, 4096, 8192, 0]);
    }

    #[test]
    fn test_random_offsets_aligned_and_in_range() {
        let size = 1 << 20;
        let mut workload = Workload::new(Pattern::Rand, size, 4096, 50, 7).unwrap();
        for _ in 0..1000 {
            let (_, offset) = workload.next_io();
            assert_eq!(offset % 4096, 0);
            assert!(offset + 4096 <= size);
        }
    }

    #[test]
    fn test_read_mix_extremes() {
        let mut reads = Workload::new(Pattern::Rand, 1 << 20, 512, 100, 3).unwrap();
        let mut writes = Workload::new(Pattern::Rand, 1 << 20, 512, 0, 3).unwrap();
        for _ in 0..100 {
            assert_eq!(reads.next_io().0, IoKind::Read);
            assert_eq!(writes.next_io().0, IoKind::Write);
        }
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(Workload::new(Pattern::Seq, 4096, 0, 50, 0).is_err());
        assert!(Workload::new(Pattern::Seq, 512, 4096, 50, 0).is_err());
        assert!(Workload::new(Pattern::Seq, 4096, 512, 101, 0).is_err());
    }
}
