//! Calc service CLI
//!
//! `serve` answers range requests over NATS until interrupted. `call` and
//! `last` talk to a running service; `local` runs the calculation in-process.

use std::sync::Arc;

use anyhow::{Context, Result};
use calc_service::calc::CalcRouter;
use calc_service::{reply_router, CalcGateway, CalcServer, CalculateRange, Config, RangeHistory};
use clap::{Parser, Subcommand};
use switchyard::{start_buses, BusLifecycle, ConnectionManager, Dispatcher};
use switchyard_nats::{NatsConnector, NatsLink, NatsQueueSender, NatsStrategyFactory};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "calc-service")]
#[command(about = "Range calculation over a switchyard bus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve range requests until interrupted
    Serve,

    /// Ask a running service for the range of VALUES
    Call {
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<i64>,
    },

    /// Ask a running service for the last announced range
    Last,

    /// Calculate in-process, without a broker
    Local {
        #[arg(required = true, allow_negative_numbers = true)]
        values: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyard=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Serve => serve(&config).await,
        Commands::Call { values } => {
            let gateway = gateway(&config).await?;
            let outcome = gateway.calculate(values).await;
            gateway.shutdown().await?;
            let range = outcome.context("range request failed")?;
            println!("{}", serde_json::to_string(&range)?);
            Ok(())
        }
        Commands::Last => {
            let gateway = gateway(&config).await?;
            let outcome = gateway.last_range().await;
            gateway.shutdown().await?;
            let last = outcome.context("last range request failed")?;
            println!("{}", serde_json::to_string(&last)?);
            Ok(())
        }
        Commands::Local { values } => {
            let calc = Dispatcher::builder(config.service_name.clone())
                .router(CalcRouter::new(config.bus.clone(), RangeHistory::default()))
                .build()?;
            let range = calc.send(CalculateRange { values }).await?;
            println!("{}", serde_json::to_string(&range)?);
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> Result<Arc<ConnectionManager<NatsLink>>> {
    let manager = Arc::new(ConnectionManager::new());
    manager
        .connect(&NatsConnector::with_name(config.service_name.clone()), &config.bus_settings())
        .await
        .with_context(|| format!("Failed to connect bus {}", config.bus))?;
    Ok(manager)
}

async fn serve(config: &Config) -> Result<()> {
    tracing::info!(service = %config.service_name, bus = %config.bus, "Starting calc service");

    let manager = connect(config).await?;
    let replies = reply_router(&config.bus, &manager, Arc::new(NatsQueueSender));
    let server = CalcServer::new(
        &config.service_name,
        &config.bus,
        manager.clone(),
        &NatsStrategyFactory,
        &replies,
    )?;

    let report = start_buses(&[server.driver() as &dyn BusLifecycle]).await;
    let started = report.into_result().context("Failed to start buses")?;
    tracing::info!(buses = ?started, "calc service ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    server.driver().shutdown().await?;
    manager.close(&config.bus);
    Ok(())
}

async fn gateway(config: &Config) -> Result<CalcGateway<NatsLink>> {
    let manager = connect(config).await?;
    CalcGateway::start(
        &format!("{}-cli", config.service_name),
        &config.bus,
        manager,
        &NatsStrategyFactory,
        config.rpc_settings(),
    )
    .await
}
