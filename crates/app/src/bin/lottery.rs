use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use txevents_app::{LotteryAppConfig, shutdown};
use txevents_infra::{
    CappedLinearBackoff, OutboxRelay, OutboxTables, PostgresOutbox, PostgresWinnerStore,
    RedisStreamsBus, connect, migrate,
};
use txevents_lottery::{LotteryConfig, LotteryService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = LotteryAppConfig::from_env().context("invalid configuration")?;
    txevents_observability::tracing::init(config.log_format);

    info!(
        service = "lottery",
        project_id = config.outbox.project_id.as_deref().unwrap_or("-"),
        forwarder_topic = %config.outbox.forwarder_topic,
        event_topic = %config.outbox.event_topic,
        db = ?config.db,
        "starting"
    );

    let tables = OutboxTables::for_topic(&config.outbox.forwarder_topic)?;

    let mut backoff = CappedLinearBackoff::default();
    let pool = connect(&config.db.postgres_dsn(), &mut backoff)
        .await
        .context("connecting to Postgres")?;
    migrate(&pool, &tables).await.context("migrating outbox schema")?;
    let pool = Arc::new(pool);

    let bus = RedisStreamsBus::new(&config.outbox.bus_url).context("configuring the bus")?;
    let outbox = PostgresOutbox::from_shared(pool.clone(), tables.clone());
    let relay = OutboxRelay::new(outbox, bus, config.outbox.relay.clone()).spawn();

    let store = PostgresWinnerStore::from_shared(pool.clone(), tables, config.outbox.event_topic.clone());
    let first_lottery_id = store.next_free_id().await.context("reading the last lottery id")?;
    info!(service = "lottery", first_lottery_id, "resuming lottery ids");
    let mut service = LotteryService::new(
        store,
        LotteryConfig::default()
            .with_interval(config.lottery_interval)
            .with_first_lottery_id(first_lottery_id),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let draws = tokio::spawn(async move { service.run(shutdown_rx).await });

    shutdown::signal().await;
    let _ = shutdown_tx.send(true);
    draws.await.context("lottery task failed")?;

    let stats = relay.stats();
    relay.shutdown().await;
    pool.close().await;

    info!(service = "lottery", forwarded = stats.published, "stopped");
    Ok(())
}
