//! Client facade over a store.

use std::sync::Arc;

use meridian_common::{Key, MeridianResult, Priority, Value};

use crate::coordinator::{Txn, TxnCoordinator, TxnOptions, TxnStats};
use crate::gate::{Command, Request, Response};
use crate::store::Store;

/// Key-value client.
///
/// Single-shot operations run outside any transaction at a timestamp
/// chosen by the store; their conflicts are returned to the caller
/// directly. [`Db::txn`] runs a retrying transaction.
#[derive(Debug)]
pub struct Db {
    coordinator: TxnCoordinator,
    user_priority: Option<Priority>,
}

impl Db {
    /// Creates a client over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        let user_priority = store.config().txn.user_priority.map(Priority::new);
        Self {
            coordinator: TxnCoordinator::new(store),
            user_priority,
        }
    }

    /// Sets the priority used by single-shot operations and transactions
    /// that do not choose their own.
    #[must_use]
    pub fn with_user_priority(mut self, priority: Priority) -> Self {
        self.user_priority = Some(priority);
        self
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<Store> {
        self.coordinator.store()
    }

    /// Returns transaction statistics.
    pub fn stats(&self) -> &TxnStats {
        self.coordinator.stats()
    }

    fn execute(&self, command: Command) -> MeridianResult<Response> {
        let mut request = Request::new(command);
        request.header.user_priority = self.user_priority;
        self.store().execute(request)
    }

    /// Reads `key`.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn get(&self, key: impl Into<Key>) -> MeridianResult<Option<Value>> {
        self.execute(Command::get(key))?.into_value()
    }

    /// Writes `key`.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> MeridianResult<()> {
        self.execute(Command::put(key, value)).map(|_| ())
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn delete(&self, key: impl Into<Key>) -> MeridianResult<()> {
        self.execute(Command::delete(key)).map(|_| ())
    }

    /// Reads up to `max_results` live keys in `[start, end)`; zero means
    /// unlimited.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn scan(
        &self,
        start: impl Into<Key>,
        end: impl Into<Key>,
        max_results: usize,
    ) -> MeridianResult<Vec<(Key, Value)>> {
        self.execute(Command::scan(start, end, max_results))?
            .into_rows()
    }

    /// Reads every live key starting with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn scan_prefix(&self, prefix: impl Into<Key>) -> MeridianResult<Vec<(Key, Value)>> {
        let start = prefix.into();
        let end = start.prefix_end();
        self.scan(start, end, 0)
    }

    /// Adds `delta` to the integer at `key` and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns the command's error.
    pub fn increment(&self, key: impl Into<Key>, delta: i64) -> MeridianResult<i64> {
        self.execute(Command::increment(key, delta))?.into_integer()
    }

    /// Writes `key` if its current value equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `ConditionFailed` if the value differs, or the command's
    /// error.
    pub fn conditional_put(
        &self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        expected: Option<Value>,
    ) -> MeridianResult<()> {
        self.execute(Command::conditional_put(key, value, expected))
            .map(|_| ())
    }

    /// Runs `body` as a transaction with default options.
    ///
    /// # Errors
    ///
    /// See [`TxnCoordinator::run`].
    pub fn txn<T, F>(&self, body: F) -> MeridianResult<T>
    where
        F: FnMut(&mut Txn<'_>) -> MeridianResult<T>,
    {
        self.txn_with(&TxnOptions::default(), body)
    }

    /// Runs `body` as a transaction with `opts`.
    ///
    /// # Errors
    ///
    /// See [`TxnCoordinator::run`].
    pub fn txn_with<T, F>(&self, opts: &TxnOptions, body: F) -> MeridianResult<T>
    where
        F: FnMut(&mut Txn<'_>) -> MeridianResult<T>,
    {
        if opts.user_priority.is_none() && self.user_priority.is_some() {
            let opts = TxnOptions {
                user_priority: self.user_priority,
                ..opts.clone()
            };
            return self.coordinator.run(&opts, body);
        }
        self.coordinator.run(opts, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::config::NodeConfig;
    use meridian_common::MeridianError;
    use meridian_mvcc::HybridClock;
    use std::time::Duration;

    fn db() -> Db {
        let clock = Arc::new(HybridClock::system(Duration::ZERO));
        let store = Store::with_full_range(NodeConfig::for_testing(), clock).unwrap();
        Db::new(Arc::new(store))
    }

    #[test]
    fn test_single_shot_operations() {
        let db = db();
        db.put("a", "1").unwrap();
        assert_eq!(db.get("a").unwrap(), Some(Value::from_str("1")));

        db.delete("a").unwrap();
        assert_eq!(db.get("a").unwrap(), None);

        assert_eq!(db.increment("n", 5).unwrap(), 5);
        assert_eq!(db.increment("n", -2).unwrap(), 3);
        assert_eq!(db.get("n").unwrap(), Some(Value::from_i64(3)));
    }

    #[test]
    fn test_conditional_put() {
        let db = db();
        db.conditional_put("a", "1", None).unwrap();
        let err = db.conditional_put("a", "2", None).unwrap_err();
        match err {
            MeridianError::ConditionFailed { actual, .. } => {
                assert_eq!(actual, Some(Value::from_str("1")));
            }
            other => panic!("unexpected error: {other}"),
        }
        db.conditional_put("a", "2", Some(Value::from_str("1")))
            .unwrap();
        assert_eq!(db.get("a").unwrap(), Some(Value::from_str("2")));
    }

    #[test]
    fn test_scan_prefix() {
        let db = db();
        for key in ["user/1", "user/2", "users", "zeta"] {
            db.put(key, key).unwrap();
        }
        db.delete("user/2").unwrap();

        let rows = db.scan_prefix("user/").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, Key::from_str("user/1"));

        let limited = db.scan("a", "z", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_increment_rejects_non_integer() {
        let db = db();
        db.put("a", "not a number").unwrap();
        let err = db.increment("a", 1).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidArgument { .. }));
    }

    #[test]
    fn test_txn_counts() {
        let db = db().with_user_priority(Priority::new(7));
        let priority = db
            .txn(|txn| {
                txn.increment("n", 1)?;
                Ok(txn.priority())
            })
            .unwrap();
        assert_eq!(priority, Priority::new(7));
        assert_eq!(db.get("n").unwrap(), Some(Value::from_i64(1)));
        assert_eq!(
            db.stats()
                .committed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
