//! claimboard
//!
//! Multi-agent task claiming and collaboration scheduler over a shared
//! SQLite backlog.

use anyhow::Result;
use clap::Parser;
use claimboard::cli::{CallArgs, Cli, Command, ReapArgs, ServeArgs};
use claimboard::config::Config;
use claimboard::error::ToolError;
use claimboard::hub::Hub;
use claimboard::logging::{LogDestination, init_logging};
use claimboard::mirror::{BacklogMirror, spawn_mirror};
use claimboard::pool::{CommandExecutor, WorkerPool, spawn_dispatcher};
use claimboard::reaper::spawn_reaper;
use claimboard::tools::{ToolHandler, respond};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogDestination::parse(&cli.log), cli.verbose)?;

    let mut config = Config::discover(cli.config.as_deref())?;
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.clone();
    }

    match cli.command {
        Some(Command::Call(args)) => run_call(config, args),
        Some(Command::Reap(args)) => run_reap(config, args),
        Some(Command::Tools) => run_tools(config),
        Some(Command::Serve(args)) => run_server(config, args).await,
        None => run_server(config, ServeArgs::default()).await,
    }
}

fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

fn run_call(config: Config, args: CallArgs) -> Result<()> {
    let handler = ToolHandler::new(Hub::open(config)?);
    let result = match serde_json::from_str::<Value>(&args.arguments) {
        Ok(arguments) if arguments.is_object() => handler.call_tool_json(&args.tool, arguments),
        Ok(_) => respond(Err(ToolError::invalid_value(
            "arguments",
            "Arguments must be a JSON object",
        ))),
        Err(e) => respond(Err(ToolError::invalid_value(
            "arguments",
            format!("Arguments are not valid JSON: {}", e),
        ))),
    };
    print_json(&result, args.pretty)
}

fn run_reap(config: Config, args: ReapArgs) -> Result<()> {
    let hub = Hub::open(config)?;
    let result = hub
        .reap_stale(args.timeout.map(Duration::from_secs))
        .map(|summary| json!({ "success": true, "released": summary }));
    print_json(&respond(result), false)
}

fn run_tools(config: Config) -> Result<()> {
    let handler = ToolHandler::new(Hub::in_memory(config)?);
    print_json(&serde_json::to_value(handler.get_tools())?, true)
}

async fn run_server(mut config: Config, args: ServeArgs) -> Result<()> {
    if args.command.is_some() {
        config.pool.command = args.command;
    }
    if args.no_mirror {
        config.mirror.enabled = false;
    }

    let hub = Hub::open(config)?;
    let config = hub.config().clone();
    info!(db = %config.server.db_path.display(), "claimboard serving");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = spawn_reaper(hub.clone(), shutdown_rx.clone());

    let mirror = config.mirror.enabled.then(|| {
        spawn_mirror(
            Arc::clone(hub.db()),
            hub.bus(),
            BacklogMirror::new(&config.mirror.path),
            shutdown_rx.clone(),
        )
    });

    let pool = config.pool.command.as_ref().map(|command| {
        let pool = Arc::new(WorkerPool::new(
            hub.clone(),
            Arc::new(CommandExecutor::new(command.clone())),
            config.pool.clone(),
        ));
        pool.start();
        let dispatcher = spawn_dispatcher(hub.clone(), Arc::clone(&pool), shutdown_rx.clone());
        (pool, dispatcher)
    });
    if pool.is_none() {
        info!("No pool.command configured; serving without a worker pool");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if let Some((pool, dispatcher)) = pool {
        match dispatcher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Dispatcher exited with error"),
            Err(e) => warn!(error = %e, "Dispatcher task failed"),
        }
        pool.stop().await;
        // Anything the pool still holds goes back to the queue
        if let Err(e) = hub.check_out(&config.pool.worker_id) {
            if !e.code.is_not_found() {
                warn!(error = %e, "Pool check-out failed");
            }
        }
    }

    if let Err(e) = reaper.await {
        warn!(error = %e, "Reaper task failed");
    }
    if let Some(mirror) = mirror {
        if let Err(e) = mirror.await {
            warn!(error = %e, "Mirror task failed");
        }
    }

    Ok(())
}
