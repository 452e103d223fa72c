use anyhow::{Context as _, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use grownode::broker::{self, BrokerHandle};
use grownode::event::{Event, EventKind};
use grownode::leaves;
use grownode::maintenance::ProcessMaintenance;
use grownode::protocol::Topics;
use grownode::{settings, web, Context, Node, Status, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,grownode=debug")),
        )
        .init();

    // ── Settings ────────────────────────────────────────────────────
    let settings_path = env::var("GROWNODE_CONFIG").unwrap_or_else(|_| "grownode.toml".to_string());
    let settings = settings::load(&settings_path)?;

    // ── Store ───────────────────────────────────────────────────────
    let store = Store::connect(&settings.store.url)
        .await
        .with_context(|| format!("failed to open store {}", settings.store.url))?;

    // ── Broker outbox + context ─────────────────────────────────────
    let topics = Topics::new(&settings.node.base_topic);
    let (broker_handle, outbox) = BrokerHandle::channel(topics.clone(), settings.mqtt.outbox_capacity);
    let ctx = Context::new(
        settings.clone(),
        store,
        broker_handle,
        Arc::new(ProcessMaintenance::default()),
    );
    ctx.init().await.context("context init failed")?;

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        settings.mqtt.client_id.clone(),
        settings.mqtt.host.clone(),
        settings.mqtt.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    tokio::spawn(broker::forward(client.clone(), outbox));
    tokio::spawn(broker::run_event_loop(
        eventloop,
        client,
        topics,
        ctx.bus().clone(),
    ));
    // The host network is up once we are running; the broker connection is
    // reported by the event loop.
    ctx.bus()
        .post(Event::new(EventKind::NetworkConnected))
        .await?;

    // ── Node + leaves ───────────────────────────────────────────────
    let node = Node::create(&ctx, &settings.node.name).await?;
    for entry in &settings.leaves {
        let Some(leaf_type) = leaves::build(entry, &settings.watering) else {
            warn!(leaf = %entry.name, kind = %entry.kind, "skipping leaf of unknown kind");
            continue;
        };
        node.add_leaf(&entry.name, leaf_type.as_ref())
            .await
            .with_context(|| format!("failed to add leaf {}", entry.name))?;
    }

    if let Err(e) = node.start().await {
        ctx.set_status(Status::Error).await;
        error!("{e}");
        return Err(e).context("node start failed");
    }
    info!(
        node = %node.name(),
        leaves = node.len().await,
        "node started"
    );

    // ── Status API ──────────────────────────────────────────────────
    if settings.web.enabled {
        let web_ctx = ctx.clone();
        let port = settings.web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_ctx, port).await {
                error!("status api stopped: {e:#}");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    node.destroy().await;
    Ok(())
}
