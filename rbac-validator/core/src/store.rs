use crate::BoxError;
use thiserror::Error;

/// An object store with optimistic concurrency.
///
/// Objects carry the version they were read at; a write of an object whose
/// version is no longer current fails with [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait Versioned<K: Send + Sync> {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    async fn write(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the object was modified concurrently")]
    Conflict,

    #[error(transparent)]
    Api(BoxError),
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("update still conflicted after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The outcome of a [`read_modify_write`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update<K> {
    /// The object does not exist.
    Missing,

    /// The modification declined to change the freshly read object.
    Unchanged(K),

    /// The modified object was written.
    Written(K),
}

/// Reads the latest object, lets `modify` update it and writes it back with
/// the version that was read, starting over on conflict.
///
/// `modify` is called with a fresh copy on every attempt and returns false to
/// skip the write. At most `attempts` writes are tried.
pub async fn read_modify_write<K, S, F>(
    store: &S,
    namespace: &str,
    name: &str,
    attempts: usize,
    mut modify: F,
) -> Result<Update<K>, RetryError>
where
    K: Send + Sync,
    S: Versioned<K> + Sync + ?Sized,
    F: FnMut(&mut K) -> bool + Send,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        let mut object = match store.read(namespace, name).await? {
            Some(object) => object,
            None => return Ok(Update::Missing),
        };
        if !modify(&mut object) {
            return Ok(Update::Unchanged(object));
        }
        match store.write(namespace, name, &object).await {
            Ok(written) => return Ok(Update::Written(written)),
            Err(StoreError::Conflict) => {
                tracing::debug!(%namespace, %name, attempt, "Update conflicted");
            }
            Err(error) => return Err(error.into()),
        }
    }
    Err(RetryError::Exhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Clone, Debug, PartialEq, Eq)]
    struct Counter {
        version: u64,
        value: u64,
    }

    #[derive(Default)]
    struct Memory {
        object: Mutex<Option<Counter>>,
        conflicts: Mutex<usize>,
        writes: Mutex<usize>,
    }

    impl Memory {
        fn with(value: u64) -> Self {
            Self {
                object: Mutex::new(Some(Counter { version: 1, value })),
                ..Default::default()
            }
        }

        /// Simulates a concurrent writer bumping the stored version.
        fn bump(&self) {
            if let Some(obj) = self.object.lock().unwrap().as_mut() {
                obj.version += 1;
                obj.value += 100;
            }
        }
    }

    #[async_trait::async_trait]
    impl Versioned<Counter> for Memory {
        async fn read(&self, _: &str, _: &str) -> Result<Option<Counter>, StoreError> {
            Ok(self.object.lock().unwrap().clone())
        }

        async fn write(&self, _: &str, _: &str, obj: &Counter) -> Result<Counter, StoreError> {
            {
                let mut conflicts = self.conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    drop(conflicts);
                    self.bump();
                }
            }
            let mut stored = self.object.lock().unwrap();
            let current = stored.as_mut().ok_or(StoreError::Conflict)?;
            if current.version != obj.version {
                return Err(StoreError::Conflict);
            }
            *self.writes.lock().unwrap() += 1;
            *current = Counter {
                version: obj.version + 1,
                value: obj.value,
            };
            Ok(current.clone())
        }
    }

    #[tokio::test]
    async fn writes_modified_object() {
        let store = Memory::with(1);
        let update = read_modify_write(&store, "ns", "c", 5, |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(
            update,
            Update::Written(Counter {
                version: 2,
                value: 2
            })
        );
    }

    #[tokio::test]
    async fn retries_from_fresh_read_after_conflict() {
        let store = Memory::with(1);
        *store.conflicts.lock().unwrap() = 2;
        let mut seen = Vec::new();
        let update = read_modify_write(&store, "ns", "c", 5, |c: &mut Counter| {
            seen.push(c.value);
            c.value += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![1, 101, 201]);
        assert!(matches!(update, Update::Written(Counter { value: 202, .. })));
        assert_eq!(*store.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn declined_modification_skips_write() {
        let store = Memory::with(7);
        let update = read_modify_write(&store, "ns", "c", 5, |c: &mut Counter| c.value != 7)
            .await
            .unwrap();
        assert!(matches!(update, Update::Unchanged(Counter { value: 7, .. })));
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_object() {
        let store = Memory::default();
        let update = read_modify_write(&store, "ns", "c", 5, |_: &mut Counter| true)
            .await
            .unwrap();
        assert_eq!(update, Update::Missing);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_budget() {
        let store = Memory::with(1);
        *store.conflicts.lock().unwrap() = 10;
        let err = read_modify_write(&store, "ns", "c", 3, |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3 }));
        assert_eq!(*store.conflicts.lock().unwrap(), 7);
        assert_eq!(*store.writes.lock().unwrap(), 0);
    }
}
