//! Order service binary.
//!
//! `order-service place <user-id> <amount> [description]` places one order
//! and exits; the running service harvests its payment request.
//!
//! Without arguments it wires the Postgres stores, the Redpanda publisher
//! and subscriber and the Courier workers, then runs until Ctrl+C or SIGTERM.

use courier_core::broker::{Publisher, Subscriber};
use courier_core::environment::SystemClock;
use courier_core::handler::{InboxHandler, JsonFieldId};
use courier_core::store::{InboxStore, OutboxStore};
use courier_postgres::{PgDatabase, PgTx, PostgresInboxStore, PostgresOutboxStore};
use courier_redpanda::{RedpandaPublisher, RedpandaSubscriber};
use courier_runtime::metrics::MetricsServer;
use courier_runtime::{
    ApplyConfig, HarvesterConfig, InboxApplier, InboxIngest, IngestConfig, OutboxHarvester,
    WorkerSet,
};
use order_demo::{Config, OrderService, OrderStore, PaymentCompletedHandler, PostgresOrderStore};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "order_service=info,order_demo=info,courier=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting order service");

    let config = Config::from_env();
    info!(
        brokers = %config.redpanda.brokers,
        inbox_topic = %config.redpanda.inbox_topic,
        consumer_group = %config.redpanda.consumer_group,
        "Configuration loaded"
    );

    // Database
    let db = Arc::new(PgDatabase::connect(&config.postgres.url, config.postgres.max_connections).await?);
    courier_postgres::run_migrations(db.pool()).await?;
    order_demo::run_migrations(db.pool()).await?;
    info!("Database ready");

    let orders: Arc<dyn OrderStore<Tx = PgTx>> = Arc::new(PostgresOrderStore::new(db.pool().clone()));
    let outbox: Arc<dyn OutboxStore<Tx = PgTx>> =
        Arc::new(PostgresOutboxStore::new(db.pool().clone()));

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        anyhow::ensure!(command == "place", "unknown command '{command}'");
        let user_id: uuid::Uuid = args
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing user id"))?
            .parse()?;
        let amount: i64 = args
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing amount"))?
            .parse()?;
        let description = args.collect::<Vec<_>>().join(" ");

        let service = OrderService::new(db, orders, outbox, config.redpanda.outbox_topic.clone());
        let order = service.create_order(user_id, description, amount).await?;
        println!("{}", order.id);
        return Ok(());
    }

    // Metrics
    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start()?;

    // Stores
    let inbox: Arc<dyn InboxStore<Tx = PgTx>> = Arc::new(PostgresInboxStore::new(db.pool().clone()));

    // Broker
    let publisher: Arc<dyn Publisher> = Arc::new(RedpandaPublisher::new(&config.redpanda.brokers)?);
    let subscriber: Arc<dyn Subscriber> = Arc::new(
        RedpandaSubscriber::builder()
            .brokers(&config.redpanda.brokers)
            .topic(&config.redpanda.inbox_topic)
            .consumer_group(&config.redpanda.consumer_group)
            .build()?,
    );

    // Workers
    let ingest = InboxIngest::new(
        Arc::clone(&inbox),
        subscriber,
        Arc::new(JsonFieldId::new("order_id")),
        IngestConfig::default(),
    );
    let handler: Arc<dyn InboxHandler<PgTx>> = Arc::new(PaymentCompletedHandler::new(orders));
    let applier = InboxApplier::new(
        Arc::clone(&db),
        inbox,
        handler,
        ApplyConfig::default()
            .with_period(config.workers.apply_period())
            .with_batch_size(config.workers.batch_size),
    );
    let harvester = OutboxHarvester::new(
        db,
        outbox,
        publisher,
        Arc::new(SystemClock),
        HarvesterConfig::default()
            .with_period(config.workers.outbox_period())
            .with_batch_size(config.workers.batch_size),
    );

    let mut workers = WorkerSet::new();
    workers.spawn("inbox-ingest", config.workers.ingest, move |index, shutdown| {
        ingest
            .clone()
            .with_name(format!("inbox-ingest-{index}"))
            .run(shutdown)
    });
    workers.spawn("inbox-apply", config.workers.apply, move |index, shutdown| {
        applier
            .clone()
            .with_name(format!("inbox-apply-{index}"))
            .run(shutdown)
    });
    workers.spawn("outbox-harvester", config.workers.outbox, move |index, shutdown| {
        harvester
            .clone()
            .with_name(format!("outbox-harvester-{index}"))
            .run(shutdown)
    });
    info!(workers = workers.len(), "Order service running");

    shutdown_signal().await;
    let failed = workers.shutdown().await;
    if failed > 0 {
        error!(failed, "Some workers died before shutdown");
    }

    info!("Order service stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
