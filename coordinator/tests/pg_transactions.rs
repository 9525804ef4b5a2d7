//! Integration tests for the PostgreSQL transactor against embedded PostgreSQL.
//!
//! Opt-in: run with `RUN_PG_EMBEDDED=1 cargo test -- --ignored`.

use std::sync::Arc;

use coordinator::domain::ports::{OutboundMessage, TransactionError, Transactor};
use coordinator::domain::{CompositeTransactor, Context};
use coordinator::outbound::broker::BufferedTransactor;
use coordinator::outbound::persistence::{
    DbPool, PgExecutor, PgExecutorError, PgTransactor, PoolConfig,
};
use coordinator::test_support::producer::InMemoryProducer;
use diesel::QueryableByName;
use diesel::sql_types::{BigInt, Text};
use diesel_async::RunQueryDsl;
use diesel_async::scoped_futures::ScopedFutureExt as _;
use pg_embedded_setup_unpriv::TestCluster;
use rstest::{fixture, rstest};
use tokio::runtime::Runtime;

#[path = "support/pg_embed.rs"]
mod pg_embed;

use pg_embed::{embedded_postgres_enabled, test_cluster};

#[derive(QueryableByName)]
struct Total {
    #[diesel(sql_type = BigInt)]
    total: i64,
}

struct PgContext {
    runtime: Runtime,
    _cluster: TestCluster,
    transactor: PgTransactor,
}

impl PgContext {
    fn executor(&self) -> PgExecutor {
        self.transactor.executor()
    }
}

async fn record(executor: &PgExecutor, ctx: &Context, entry: &str) -> Result<(), PgExecutorError> {
    let entry = entry.to_owned();
    executor
        .run(ctx, move |conn| {
            async move {
                diesel::sql_query("INSERT INTO ledger (entry) VALUES ($1)")
                    .bind::<Text, _>(entry)
                    .execute(conn)
                    .await
                    .map(drop)
            }
            .scope_boxed()
        })
        .await
}

async fn ledger_rows(executor: &PgExecutor) -> i64 {
    executor
        .run(&Context::background(), |conn| {
            async move {
                diesel::sql_query("SELECT COUNT(*) AS total FROM ledger")
                    .get_result::<Total>(conn)
                    .await
                    .map(|row| row.total)
            }
            .scope_boxed()
        })
        .await
        .expect("count ledger rows")
}

fn setup_context() -> Result<PgContext, String> {
    let runtime = Runtime::new().map_err(|err| err.to_string())?;
    let cluster = test_cluster()?;
    let database_url = cluster.connection().database_url("postgres");
    let config = PoolConfig::new(database_url)
        .with_max_size(4)
        .with_min_idle(Some(1));
    let pool = runtime
        .block_on(DbPool::new(config))
        .map_err(|err| err.to_string())?;
    let transactor = PgTransactor::new(pool);

    runtime
        .block_on(transactor.executor().run(&Context::background(), |conn| {
            async move {
                diesel::sql_query("CREATE TABLE IF NOT EXISTS ledger (entry TEXT PRIMARY KEY)")
                    .execute(conn)
                    .await
                    .map(drop)
            }
            .scope_boxed()
        }))
        .map_err(|err| err.to_string())?;

    Ok(PgContext {
        runtime,
        _cluster: cluster,
        transactor,
    })
}

#[fixture]
fn pg_context() -> Option<PgContext> {
    if !embedded_postgres_enabled() {
        eprintln!("SKIP-TEST-CLUSTER: set RUN_PG_EMBEDDED=1 to run");
        return None;
    }
    match setup_context() {
        Ok(context) => Some(context),
        Err(reason) => panic!("Test cluster setup failed: {reason}"),
    }
}

#[rstest]
#[ignore = "requires embedded Postgres binaries; opt-in via RUN_PG_EMBEDDED=1"]
fn committed_writes_become_visible(pg_context: Option<PgContext>) {
    let Some(context) = pg_context else {
        return;
    };
    let executor = context.executor();

    context.runtime.block_on(async {
        let ctx = context
            .transactor
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        record(&executor, &ctx, "committed").await.expect("insert");
        assert_eq!(ledger_rows(&executor).await, 0, "uncommitted row is hidden");

        context.transactor.commit_ctx(&ctx).await.expect("commit");
        assert_eq!(ledger_rows(&executor).await, 1);
    });
}

#[rstest]
#[ignore = "requires embedded Postgres binaries; opt-in via RUN_PG_EMBEDDED=1"]
fn rolled_back_writes_disappear(pg_context: Option<PgContext>) {
    let Some(context) = pg_context else {
        return;
    };
    let executor = context.executor();

    context.runtime.block_on(async {
        let ctx = context
            .transactor
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        record(&executor, &ctx, "discarded").await.expect("insert");

        context.transactor.rollback_ctx(&ctx).await.expect("rollback");
        assert_eq!(ledger_rows(&executor).await, 0);
    });
}

#[rstest]
#[ignore = "requires embedded Postgres binaries; opt-in via RUN_PG_EMBEDDED=1"]
fn finalized_transaction_refuses_further_use(pg_context: Option<PgContext>) {
    let Some(context) = pg_context else {
        return;
    };
    let executor = context.executor();

    context.runtime.block_on(async {
        let ctx = context
            .transactor
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        context.transactor.commit_ctx(&ctx).await.expect("commit");

        assert_eq!(
            record(&executor, &ctx, "late").await,
            Err(PgExecutorError::Transaction(TransactionError::closed(
                "postgres"
            )))
        );
        assert_eq!(
            context.transactor.commit_ctx(&ctx).await,
            Err(TransactionError::already_finalized("postgres"))
        );
    });
}

#[rstest]
#[ignore = "requires embedded Postgres binaries; opt-in via RUN_PG_EMBEDDED=1"]
fn opt_out_writes_auto_commit(pg_context: Option<PgContext>) {
    let Some(context) = pg_context else {
        return;
    };
    let executor = context.executor();

    context.runtime.block_on(async {
        let ctx = context
            .transactor
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        record(&executor, &ctx.without_transaction(), "audit")
            .await
            .expect("direct insert");

        context.transactor.rollback_ctx(&ctx).await.expect("rollback");
        assert_eq!(ledger_rows(&executor).await, 1);
    });
}

#[rstest]
#[ignore = "requires embedded Postgres binaries; opt-in via RUN_PG_EMBEDDED=1"]
fn composite_spans_postgres_and_broker(pg_context: Option<PgContext>) {
    let Some(context) = pg_context else {
        return;
    };
    let executor = context.executor();
    let producer = Arc::new(InMemoryProducer::new());
    let broker = BufferedTransactor::new(producer.clone());
    let publisher = broker.publisher();
    let composite = CompositeTransactor::builder()
        .with(context.transactor.clone())
        .with(broker)
        .build();

    context.runtime.block_on(async {
        let rolled_back = composite
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        record(&executor, &rolled_back, "first").await.expect("insert");
        publisher
            .publish_one(&rolled_back, OutboundMessage::new("ledger", Vec::new()))
            .await
            .expect("buffered");
        composite.rollback_ctx(&rolled_back).await.expect("rollback");
        assert_eq!(ledger_rows(&executor).await, 0);
        assert!(producer.delivered().is_empty());

        let committed = composite
            .begin_ctx(&Context::background())
            .await
            .expect("begin succeeds");
        record(&executor, &committed, "second").await.expect("insert");
        publisher
            .publish_one(&committed, OutboundMessage::new("ledger", Vec::new()))
            .await
            .expect("buffered");
        composite.commit_ctx(&committed).await.expect("commit");
        assert_eq!(ledger_rows(&executor).await, 1);
        assert_eq!(producer.delivered_topics(), vec!["ledger".to_owned()]);
    });
}
