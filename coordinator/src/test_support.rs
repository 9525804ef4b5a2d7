//! Test utilities for the coordinator crate.
//!
//! This module provides in-memory doubles shared by unit tests (in `src/`)
//! and integration tests (in `tests/`). It is only compiled for tests or with
//! the `test-support` feature.

pub mod producer {
    //! In-memory message producer.

    use std::sync::{Mutex, MutexGuard};

    use async_trait::async_trait;

    use crate::domain::ports::{MessageProducer, OutboundMessage, ProducerError};

    #[derive(Debug, Default)]
    struct ProducerState {
        delivered: Vec<OutboundMessage>,
        batches: usize,
        close_calls: usize,
        limit: Option<usize>,
        unavailable: bool,
    }

    /// Producer that records every delivered message in order.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use coordinator::domain::ports::{MessageProducer, OutboundMessage};
    /// use coordinator::test_support::producer::InMemoryProducer;
    ///
    /// # tokio::runtime::Runtime::new().expect("runtime").block_on(async {
    /// let producer = InMemoryProducer::failing_after(1);
    /// let batch = [OutboundMessage::new("a", Vec::new()), OutboundMessage::new("b", Vec::new())];
    ///
    /// let error = producer.send(&batch).await.expect_err("limit reached");
    /// assert_eq!(error.delivered(), 1);
    /// assert_eq!(producer.delivered_topics(), vec!["a".to_owned()]);
    /// # });
    /// ```
    #[derive(Debug, Default)]
    pub struct InMemoryProducer {
        state: Mutex<ProducerState>,
    }

    impl InMemoryProducer {
        /// Producer accepting everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Producer that accepts `limit` messages in total, then rejects the
        /// rest of the batch that crosses the limit.
        #[must_use]
        pub fn failing_after(limit: usize) -> Self {
            let producer = Self::default();
            producer.state().limit = Some(limit);
            producer
        }

        /// Producer whose broker cannot be reached.
        #[must_use]
        pub fn unavailable() -> Self {
            let producer = Self::default();
            producer.state().unavailable = true;
            producer
        }

        fn state(&self) -> MutexGuard<'_, ProducerState> {
            self.state.lock().unwrap_or_else(|err| err.into_inner())
        }

        /// Messages delivered so far, in delivery order.
        #[must_use]
        pub fn delivered(&self) -> Vec<OutboundMessage> {
            self.state().delivered.clone()
        }

        /// Topics of the delivered messages, in delivery order.
        #[must_use]
        pub fn delivered_topics(&self) -> Vec<String> {
            self.state()
                .delivered
                .iter()
                .map(|message| message.topic.clone())
                .collect()
        }

        /// Number of `send` calls that reached the broker.
        #[must_use]
        pub fn batches(&self) -> usize {
            self.state().batches
        }

        /// Number of `close` calls.
        #[must_use]
        pub fn close_calls(&self) -> usize {
            self.state().close_calls
        }
    }

    #[async_trait]
    impl MessageProducer for InMemoryProducer {
        async fn send(&self, messages: &[OutboundMessage]) -> Result<(), ProducerError> {
            let mut state = self.state();
            if state.unavailable {
                return Err(ProducerError::unavailable("broker offline"));
            }
            state.batches += 1;

            let room = state
                .limit
                .map_or(usize::MAX, |limit| limit.saturating_sub(state.delivered.len()));
            if messages.len() <= room {
                state.delivered.extend_from_slice(messages);
                return Ok(());
            }

            state.delivered.extend(messages.iter().take(room).cloned());
            Err(ProducerError::rejected(room, "delivery limit reached"))
        }

        async fn close(&self) -> Result<(), ProducerError> {
            self.state().close_calls += 1;
            Ok(())
        }
    }
}

pub mod recording {
    //! Transactor double that counts calls and injects failures.

    use std::any::Any;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::domain::ports::{Finalize, Transaction, TransactionError, Transactor, finalize_attached};
    use crate::domain::{Context, ContextKey};

    /// Snapshot of the calls a [`RecordingTransactor`] has seen.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CallCounts {
        /// `begin` invocations, including failed ones.
        pub begin: usize,
        /// `commit` invocations on handles, including failed ones.
        pub commit: usize,
        /// `rollback` invocations on handles, including failed ones.
        pub rollback: usize,
    }

    #[derive(Debug, Default)]
    struct Calls {
        begin: AtomicUsize,
        commit: AtomicUsize,
        rollback: AtomicUsize,
    }

    #[derive(Debug, Clone, Copy, Default)]
    struct Failures {
        begin: bool,
        commit: bool,
        rollback: bool,
    }

    /// Transactor whose handles only record what happens to them.
    #[derive(Debug, Clone)]
    pub struct RecordingTransactor {
        name: &'static str,
        key: ContextKey,
        calls: Arc<Calls>,
        failures: Failures,
        begin_delay: Option<Duration>,
        finalize_delay: Option<Duration>,
    }

    impl RecordingTransactor {
        /// Transactor with a fresh key of its own.
        #[must_use]
        pub fn new(name: &'static str) -> Self {
            Self::with_key(name, ContextKey::new(name))
        }

        /// Transactor storing its handles under `key`.
        #[must_use]
        pub fn with_key(name: &'static str, key: ContextKey) -> Self {
            Self {
                name,
                key,
                calls: Arc::default(),
                failures: Failures::default(),
                begin_delay: None,
                finalize_delay: None,
            }
        }

        /// Make every `begin` fail.
        #[must_use]
        pub const fn failing_begin(mut self) -> Self {
            self.failures.begin = true;
            self
        }

        /// Make every handle's `commit` fail.
        #[must_use]
        pub const fn failing_commit(mut self) -> Self {
            self.failures.commit = true;
            self
        }

        /// Make every handle's `rollback` fail.
        #[must_use]
        pub const fn failing_rollback(mut self) -> Self {
            self.failures.rollback = true;
            self
        }

        /// Sleep for `delay` before answering `begin`.
        #[must_use]
        pub const fn with_begin_delay(mut self, delay: Duration) -> Self {
            self.begin_delay = Some(delay);
            self
        }

        /// Sleep for `delay` before answering a handle's `commit` or `rollback`.
        #[must_use]
        pub const fn with_finalize_delay(mut self, delay: Duration) -> Self {
            self.finalize_delay = Some(delay);
            self
        }

        /// Key this transactor stores its handles under.
        #[must_use]
        pub const fn key(&self) -> ContextKey {
            self.key
        }

        /// Calls recorded so far, shared across clones.
        #[must_use]
        pub fn counts(&self) -> CallCounts {
            CallCounts {
                begin: self.calls.begin.load(Ordering::SeqCst),
                commit: self.calls.commit.load(Ordering::SeqCst),
                rollback: self.calls.rollback.load(Ordering::SeqCst),
            }
        }
    }

    #[async_trait]
    impl Transactor for RecordingTransactor {
        fn name(&self) -> &str {
            self.name
        }

        async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError> {
            self.calls.begin.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.begin_delay {
                tokio::time::sleep(delay).await;
            }
            if self.failures.begin {
                return Err(TransactionError::begin(self.name, "injected failure"));
            }
            let transaction: Arc<dyn Transaction> = Arc::new_cyclic(|this| RecordingTransaction {
                this: this.clone(),
                origin: ctx.clone(),
                transactor: self.clone(),
                finalized: AtomicBool::new(false),
            });
            Ok(transaction)
        }

        async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
            finalize_attached(ctx, &self.key, self.name, Finalize::Commit).await
        }

        async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
            finalize_attached(ctx, &self.key, self.name, Finalize::Rollback).await
        }
    }

    /// Handle opened by [`RecordingTransactor`].
    #[derive(Debug)]
    pub struct RecordingTransaction {
        this: Weak<Self>,
        origin: Context,
        transactor: RecordingTransactor,
        finalized: AtomicBool,
    }

    impl RecordingTransaction {
        async fn finalize(
            &self,
            fail: bool,
            error: TransactionError,
        ) -> Result<(), TransactionError> {
            if let Some(delay) = self.transactor.finalize_delay {
                tokio::time::sleep(delay).await;
            }
            if self.finalized.swap(true, Ordering::SeqCst) {
                return Err(TransactionError::already_finalized(self.transactor.name));
            }
            if fail { Err(error) } else { Ok(()) }
        }
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        fn backend(&self) -> &str {
            self.transactor.name
        }

        async fn commit(&self) -> Result<(), TransactionError> {
            self.transactor.calls.commit.fetch_add(1, Ordering::SeqCst);
            self.finalize(
                self.transactor.failures.commit,
                TransactionError::commit(self.transactor.name, "injected failure"),
            )
            .await
        }

        async fn rollback(&self) -> Result<(), TransactionError> {
            self.transactor.calls.rollback.fetch_add(1, Ordering::SeqCst);
            self.finalize(
                self.transactor.failures.rollback,
                TransactionError::rollback(self.transactor.name, "injected failure"),
            )
            .await
        }

        fn context(&self) -> Context {
            match self.this.upgrade() {
                Some(this) => self.origin.with_transaction(self.transactor.key, this),
                None => self.origin.clone(),
            }
        }

        fn is_finalized(&self) -> bool {
            self.finalized.load(Ordering::SeqCst)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}

pub mod memory_table {
    //! Key-value table with staged, transactional writes.
    //!
    //! Stands in for a relational backend in scenarios that must not need a
    //! database: writes made under a transaction stay invisible until commit.

    use std::any::Any;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, MutexGuard, Weak};

    use async_trait::async_trait;

    use crate::domain::ports::{Finalize, Transaction, TransactionError, Transactor, finalize_attached};
    use crate::domain::{Context, ContextKey};

    type Rows = Arc<Mutex<BTreeMap<String, String>>>;

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Transactor and client for one in-memory table.
    #[derive(Debug, Clone)]
    pub struct MemoryTable {
        name: &'static str,
        key: ContextKey,
        rows: Rows,
    }

    impl MemoryTable {
        /// Empty table with a fresh key.
        #[must_use]
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                key: ContextKey::new(name),
                rows: Rows::default(),
            }
        }

        /// Key this table stores its handles under.
        #[must_use]
        pub const fn key(&self) -> ContextKey {
            self.key
        }

        /// Committed value for `row`.
        #[must_use]
        pub fn get(&self, row: &str) -> Option<String> {
            lock(&self.rows).get(row).cloned()
        }

        /// Number of committed rows.
        #[must_use]
        pub fn len(&self) -> usize {
            lock(&self.rows).len()
        }

        /// True when nothing has been committed.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            lock(&self.rows).is_empty()
        }

        /// Write `row`, staged in the context's transaction when there is one.
        ///
        /// # Errors
        ///
        /// [`TransactionError::Closed`] once the transaction is finalized, or
        /// [`TransactionError::ForeignHandle`] if the key holds another
        /// backend's handle.
        pub fn insert(
            &self,
            ctx: &Context,
            row: impl Into<String>,
            value: impl Into<String>,
        ) -> Result<(), TransactionError> {
            let (row, value) = (row.into(), value.into());
            let Some(handle) = ctx.active_transaction(&self.key) else {
                lock(&self.rows).insert(row, value);
                return Ok(());
            };
            let Some(transaction) = handle.as_any().downcast_ref::<MemoryTableTransaction>() else {
                return Err(TransactionError::foreign_handle(self.name));
            };
            match lock(&transaction.staged).as_mut() {
                Some(staged) => {
                    staged.push((row, value));
                    Ok(())
                }
                None => Err(TransactionError::closed(self.name)),
            }
        }
    }

    #[async_trait]
    impl Transactor for MemoryTable {
        fn name(&self) -> &str {
            self.name
        }

        async fn begin(&self, ctx: &Context) -> Result<Arc<dyn Transaction>, TransactionError> {
            if let Some(reason) = ctx.err() {
                return Err(TransactionError::begin(self.name, reason.to_string()));
            }
            let transaction: Arc<dyn Transaction> =
                Arc::new_cyclic(|this| MemoryTableTransaction {
                    this: this.clone(),
                    origin: ctx.clone(),
                    table: self.clone(),
                    staged: Mutex::new(Some(Vec::new())),
                });
            Ok(transaction)
        }

        async fn commit_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
            finalize_attached(ctx, &self.key, self.name, Finalize::Commit).await
        }

        async fn rollback_ctx(&self, ctx: &Context) -> Result<(), TransactionError> {
            finalize_attached(ctx, &self.key, self.name, Finalize::Rollback).await
        }
    }

    /// Staged writes against a [`MemoryTable`].
    #[derive(Debug)]
    pub struct MemoryTableTransaction {
        this: Weak<Self>,
        origin: Context,
        table: MemoryTable,
        staged: Mutex<Option<Vec<(String, String)>>>,
    }

    impl MemoryTableTransaction {
        fn take_staged(&self) -> Result<Vec<(String, String)>, TransactionError> {
            lock(&self.staged)
                .take()
                .ok_or_else(|| TransactionError::already_finalized(self.table.name))
        }
    }

    #[async_trait]
    impl Transaction for MemoryTableTransaction {
        fn backend(&self) -> &str {
            self.table.name
        }

        async fn commit(&self) -> Result<(), TransactionError> {
            let staged = self.take_staged()?;
            lock(&self.table.rows).extend(staged);
            Ok(())
        }

        async fn rollback(&self) -> Result<(), TransactionError> {
            self.take_staged().map(drop)
        }

        fn context(&self) -> Context {
            match self.this.upgrade() {
                Some(this) => self.origin.with_transaction(self.table.key, this),
                None => self.origin.clone(),
            }
        }

        fn is_finalized(&self) -> bool {
            lock(&self.staged).is_none()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
