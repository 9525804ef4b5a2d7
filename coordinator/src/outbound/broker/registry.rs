//! Explicit registry of named broker producers.
//!
//! The application builds one registry at startup, registers a producer per
//! broker connection, hands transactors and publishers out of it, and closes
//! it once on shutdown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::domain::ContextKey;
use crate::domain::ports::MessageProducer;

use super::buffered_transaction::BufferedTransactor;
use super::publisher::Publisher;

/// Errors surfaced by [`ProducerRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A producer is already registered under this name.
    #[error("producer `{name}` is already registered")]
    Duplicate { name: String },
    /// No producer is registered under this name.
    #[error("producer `{name}` is not registered")]
    Unknown { name: String },
    /// The registry has been closed.
    #[error("producer registry is closed")]
    Closed,
    /// One or more producers failed to close cleanly.
    #[error("failed to close producers: {names}")]
    CloseFailed { names: String },
}

#[derive(Clone)]
struct Entry {
    producer: Arc<dyn MessageProducer>,
    key: ContextKey,
    label: Arc<str>,
}

/// Named producers plus the context key each one's transactions live under.
#[derive(Default)]
pub struct ProducerRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
    closed: AtomicBool,
}

impl ProducerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Result<Entry, RegistryError> {
        let entries = self.entries.read().unwrap_or_else(|err| err.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::Unknown {
                name: name.to_owned(),
            })
    }

    /// Register `producer` under `name`.
    ///
    /// Each registration gets its own context key, so transactors for two
    /// brokers can take part in the same composite. Their errors name the
    /// registration as `broker:<name>`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] if `name` is taken, or
    /// [`RegistryError::Closed`] after [`ProducerRegistry::close`].
    pub fn register(
        &self,
        name: impl Into<String>,
        producer: Arc<dyn MessageProducer>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        if entries.contains_key(&name) {
            return Err(RegistryError::Duplicate { name });
        }
        let label: Arc<str> = Arc::from(format!("broker:{name}"));
        entries.insert(
            name,
            Entry {
                producer,
                key: ContextKey::new("broker"),
                label,
            },
        );
        Ok(())
    }

    /// Registered names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// The producer registered under `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] or [`RegistryError::Closed`].
    pub fn producer(&self, name: &str) -> Result<Arc<dyn MessageProducer>, RegistryError> {
        self.entry(name).map(|entry| entry.producer)
    }

    /// Transactor buffering messages for the producer under `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] or [`RegistryError::Closed`].
    pub fn transactor(&self, name: &str) -> Result<BufferedTransactor, RegistryError> {
        self.entry(name)
            .map(|entry| {
                BufferedTransactor::with_key(entry.producer, entry.key).with_label(entry.label)
            })
    }

    /// Publisher paired with [`ProducerRegistry::transactor`] for `name`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unknown`] or [`RegistryError::Closed`].
    pub fn publisher(&self, name: &str) -> Result<Publisher, RegistryError> {
        self.entry(name)
            .map(|entry| Publisher::new(entry.producer, entry.key).with_label(entry.label))
    }

    /// True once [`ProducerRegistry::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every registered producer.
    ///
    /// Only the first call closes anything; later calls return `Ok(())`.
    /// Every producer is closed even when some fail.
    ///
    /// # Errors
    ///
    /// [`RegistryError::CloseFailed`] naming the producers that failed.
    pub async fn close(&self) -> Result<(), RegistryError> {
        let entries = {
            let mut guard = self.entries.write().unwrap_or_else(|err| err.into_inner());
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            std::mem::take(&mut *guard)
        };

        let closing = entries.into_iter().map(|(name, entry)| async move {
            let outcome = entry.producer.close().await;
            (name, outcome)
        });
        let mut failed = Vec::new();
        for (name, outcome) in join_all(closing).await {
            match outcome {
                Ok(()) => info!(producer = %name, "producer closed"),
                Err(error) => {
                    warn!(producer = %name, error = %error, "producer close failed");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::CloseFailed {
                names: failed.join(", "),
            })
        }
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("names", &self.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}
