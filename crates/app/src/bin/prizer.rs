use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use txevents_app::{PrizerAppConfig, shutdown};
use txevents_infra::RedisStreamsBus;
use txevents_prizer::PrizeSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = PrizerAppConfig::from_env().context("invalid configuration")?;
    txevents_observability::tracing::init(config.log_format);

    info!(
        service = "prizer",
        event_topic = %config.event_topic,
        consumer_group = %config.consumer_group,
        "starting"
    );

    let bus = RedisStreamsBus::new(&config.bus_url)
        .context("configuring the bus")?
        .with_consumer(config.consumer_group.clone(), config.consumer_name.clone());

    let mut prizer = PrizeSender::new(config.event_topic.clone());
    let subscription = prizer.subscribe(&bus).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = tokio::spawn(async move {
        prizer.run(subscription, shutdown_rx).await;
        prizer.sent()
    });

    shutdown::signal().await;
    let _ = shutdown_tx.send(true);
    let sent = consumer.await.context("prizer task failed")?;

    info!(service = "prizer", sent, "stopped");
    Ok(())
}
