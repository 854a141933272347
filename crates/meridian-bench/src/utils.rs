//! Benchmark utilities and helpers.

use std::sync::Arc;
use std::time::Duration;

use meridian_common::config::NodeConfig;
use meridian_common::{Key, MeridianResult, Value};
use meridian_mvcc::HybridClock;
use meridian_txn::{Db, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generates sequential keys for benchmarks.
pub fn generate_sequential_keys(count: usize, prefix: &str) -> Vec<Key> {
    (0..count)
        .map(|i| Key::from(format!("{prefix}{i:08}")))
        .collect()
}

/// Generates `count` random keys drawn from a space of `space` keys.
pub fn generate_random_keys(count: usize, space: usize, prefix: &str) -> Vec<Key> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| Key::from(format!("{prefix}{:08}", rng.gen_range(0..space.max(1)))))
        .collect()
}

/// Generates a random value of `size` bytes.
pub fn random_value(rng: &mut StdRng, size: usize) -> Value {
    Value::from((0..size).map(|_| rng.gen()).collect::<Vec<u8>>())
}

/// Opens a single-node client on the system clock.
///
/// # Errors
///
/// Returns `InvalidConfig` if the default configuration does not
/// validate.
pub fn open_db() -> MeridianResult<Db> {
    let config = NodeConfig::default();
    let clock = Arc::new(HybridClock::system(Duration::ZERO));
    let store = Store::with_full_range(config, clock)?;
    Ok(Db::new(Arc::new(store)))
}
