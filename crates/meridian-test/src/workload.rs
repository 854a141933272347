//! Seeded command streams.

use meridian_common::{Key, Value};
use meridian_txn::Command;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Shape of a generated workload.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// RNG seed; equal seeds produce equal streams.
    pub seed: u64,
    /// Number of distinct data keys.
    pub keys: usize,
    /// Number of distinct counter keys, touched only by increments.
    pub counters: usize,
    /// Fraction of commands that write.
    pub write_ratio: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            keys: 16,
            counters: 4,
            write_ratio: 0.5,
        }
    }
}

/// An endless, deterministic stream of commands over a small key space.
#[derive(Debug)]
pub struct Workload {
    rng: StdRng,
    config: WorkloadConfig,
}

impl Workload {
    /// Creates a workload.
    pub fn new(config: WorkloadConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    /// Returns data key `i`.
    pub fn data_key(i: usize) -> Key {
        Key::from(format!("key-{i:03}"))
    }

    /// Returns counter key `i`.
    pub fn counter_key(i: usize) -> Key {
        Key::from(format!("ctr-{i:03}"))
    }

    fn random_data_key(&mut self) -> Key {
        Self::data_key(self.rng.gen_range(0..self.config.keys.max(1)))
    }

    /// Generates the next command.
    pub fn next_command(&mut self) -> Command {
        if !self.rng.gen_bool(self.config.write_ratio.clamp(0.0, 1.0)) {
            if self.rng.gen_bool(0.2) {
                let a = self.random_data_key();
                let b = self.random_data_key();
                let (start, end) = if a <= b { (a, b.next()) } else { (b, a.next()) };
                return Command::scan(start, end, 0);
            }
            return Command::get(self.random_data_key());
        }

        match self.rng.gen_range(0..10) {
            0 => Command::delete(self.random_data_key()),
            1 | 2 if self.config.counters > 0 => {
                let key = Self::counter_key(self.rng.gen_range(0..self.config.counters));
                Command::increment(key, self.rng.gen_range(-5..=5))
            }
            _ => {
                let key = self.random_data_key();
                let value = Value::from(format!("v{}", self.rng.gen::<u32>()).into_bytes());
                Command::put(key, value)
            }
        }
    }

    /// Generates `n` commands.
    pub fn take_commands(&mut self, n: usize) -> Vec<Command> {
        (0..n).map(|_| self.next_command()).collect()
    }
}
