use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use traffic_router::application::gateway::PaymentGateway;
use traffic_router::application::lifecycle::{LifecycleManager, Receipt};
use traffic_router::application::processor::OrderProcessor;
use traffic_router::application::settings::{
    MAX_RETRIES, RETRY_DELAY_MAX_SECONDS, RETRY_DELAY_SECONDS, SESSION_TTL_SECONDS, Settings,
};
use traffic_router::application::worker::ProcessOrderTask;
use traffic_router::domain::actor::{Actor, Role};
use traffic_router::domain::order::{OrderHistory, OrderRef};
use traffic_router::domain::ports::{
    ConfigRef, QueueRef, SinkRef, StorageRef, Store, StoreRef,
};
use traffic_router::infrastructure::in_memory::InMemoryStore;
use traffic_router::infrastructure::queue::{TokioTaskQueue, WorkerPool};
use traffic_router::infrastructure::support::{InMemoryObjectStorage, TracingSink};
use traffic_router::interfaces::csv::order_reader::OrderReader;
use traffic_router::interfaces::csv::report_writer::{Report, ReportWriter};
use traffic_router::interfaces::fixtures::World;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Replays merchant orders through the traffic router", long_about = None)]
struct Cli {
    /// JSON world file: stores, traders, requisites, commissions, rates and settings
    #[arg(long)]
    world: PathBuf,

    /// Orders CSV file (type, merchant, store, amount, method, customer, hosted)
    #[arg(long)]
    orders: PathBuf,

    /// Number of background workers routing orders
    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, env = "PAYMENT_BASE_URL", default_value = "http://localhost:8080")]
    payment_base_url: String,

    /// Overrides the world's `session_ttl_seconds`
    #[arg(long)]
    session_ttl_secs: Option<u64>,

    /// Overrides the world's `max_retries`
    #[arg(long)]
    max_retries: Option<u32>,

    /// Base retry delay; replays default to retrying immediately
    #[arg(long, default_value_t = 0)]
    retry_delay_secs: u64,

    /// Confirm every assigned order as its client and trader, settling balances
    #[arg(long)]
    auto_confirm: bool,

    /// Route against PostgreSQL instead of the in-memory store seeded from the world
    #[cfg(feature = "storage-postgres")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,traffic_router=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

#[cfg(feature = "storage-postgres")]
async fn open_store(cli: &Cli, world: &World) -> Result<StoreRef> {
    use traffic_router::infrastructure::in_memory::DEFAULT_LOCK_TIMEOUT;
    use traffic_router::infrastructure::postgres::PostgresStore;

    if let Some(url) = &cli.database_url {
        let store = PostgresStore::connect(url, DEFAULT_LOCK_TIMEOUT)
            .await
            .into_diagnostic()?;
        store.migrate().await.into_diagnostic()?;
        return Ok(Arc::new(store));
    }
    Ok(seeded(world).await)
}

#[cfg(not(feature = "storage-postgres"))]
async fn open_store(_cli: &Cli, world: &World) -> Result<StoreRef> {
    Ok(seeded(world).await)
}

async fn seeded(world: &World) -> StoreRef {
    let store = InMemoryStore::new();
    world.seed(&store).await;
    Arc::new(store)
}

fn auto_receipt(name: &str, id: i64) -> Receipt {
    Receipt {
        bytes: format!("auto-confirmed {name} {id}").into_bytes(),
        filename: format!("{name}-{id}.txt"),
    }
}

async fn assigned_orders(store: &dyn Store) -> traffic_router::error::Result<Vec<OrderHistory>> {
    let mut tx = store.begin().await?;
    let mut assigned = Vec::new();
    for order in tx.list_incoming_orders().await? {
        if let Some(history) = tx.find_order_history(order.id).await? {
            assigned.push(history);
        }
    }
    Ok(assigned)
}

async fn confirm_all(lifecycle: &LifecycleManager, store: &dyn Store) -> Result<()> {
    for history in assigned_orders(store).await.into_diagnostic()? {
        if history.status.awaits_client()
            && let Err(e) = lifecycle
                .confirm_by_client(
                    OrderRef::Id(history.incoming_order_id),
                    &Actor::client(),
                    Some(auto_receipt("client", history.id)),
                )
                .await
        {
            eprintln!("Error confirming order {}: {}", history.incoming_order_id, e);
            continue;
        }
        let trader = Actor::new(Role::Trader, history.trader_id);
        match lifecycle
            .confirm_by_trader(history.id, &trader, auto_receipt("trader", history.id))
            .await
        {
            Ok(_) => {}
            Err(e) => eprintln!("Error completing order {}: {}", history.incoming_order_id, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let world = World::from_reader(File::open(&cli.world).into_diagnostic()?).into_diagnostic()?;
    let mut config = world
        .config()
        .with(RETRY_DELAY_SECONDS, cli.retry_delay_secs.to_string())
        .with(
            RETRY_DELAY_MAX_SECONDS,
            (cli.retry_delay_secs * 10).to_string(),
        );
    if let Some(max_retries) = cli.max_retries {
        config = config.with(MAX_RETRIES, max_retries.to_string());
    }
    if let Some(ttl) = cli.session_ttl_secs {
        config = config.with(SESSION_TTL_SECONDS, ttl.to_string());
    }
    let config: ConfigRef = Arc::new(config);
    let settings = Settings::new(config);

    let store = open_store(&cli, &world).await?;
    let sink: SinkRef = Arc::new(TracingSink);
    let storage: StorageRef = Arc::new(InMemoryObjectStorage::new());
    let (task_queue, receiver) = TokioTaskQueue::channel();
    let queue: QueueRef = Arc::new(task_queue.clone());

    let processor = OrderProcessor::new(store.clone(), settings.clone(), sink.clone());
    let task = ProcessOrderTask::new(processor, queue.clone(), settings.clone());
    let pool = WorkerPool::start(cli.workers, receiver, task);

    let gateway = PaymentGateway::new(
        store.clone(),
        queue.clone(),
        settings,
        sink.clone(),
        cli.payment_base_url.clone(),
    );
    let lifecycle = LifecycleManager::new(store.clone(), storage, queue, sink);

    let mut hosted = Vec::new();
    let file = File::open(&cli.orders).into_diagnostic()?;
    for row in OrderReader::new(file).orders() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                eprintln!("Error reading order: {}", e);
                continue;
            }
        };
        match gateway.submit(row.into_submission()).await {
            Ok(submitted) => {
                if let Some(token) = submitted.payment_token {
                    hosted.push(token);
                }
            }
            Err(e) => eprintln!("Error submitting order: {}", e),
        }
    }

    if cli.auto_confirm {
        for token in hosted {
            if let Err(e) = lifecycle
                .confirm_by_client(OrderRef::Token(token), &Actor::client(), None)
                .await
            {
                eprintln!("Error confirming payment session: {}", e);
            }
        }
    } else if !hosted.is_empty() {
        warn!(
            sessions = hosted.len(),
            "Hosted orders wait for client confirmation and stay unrouted"
        );
    }

    task_queue.drain().await;
    if cli.auto_confirm {
        confirm_all(&lifecycle, store.as_ref()).await?;
    }
    pool.shutdown().await;
    info!("Replay finished");

    let report = Report::collect(store.as_ref()).await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_report(&report).into_diagnostic()?;

    Ok(())
}
