//! `gateway` / `stop`: process lifecycle for the agent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use nanobot_agent::AgentLoop;
use nanobot_bus::MessageBus;
use nanobot_channels::ChannelManager;
use nanobot_core::{AuditLog, FailureStore, NanobotConfig};
use nanobot_cron::{CronService, CronStore};

use crate::pid;

const BUS_CAPACITY: usize = 100;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub fn run_gateway(port: Option<u16>, verbose: bool) -> i32 {
    let config_path = nanobot_core::paths::config_path();
    let mut config = match NanobotConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            return 1;
        }
    };
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let _log_guard = crate::logging::init(verbose, &config.gateway.log_level);

    if let Err(e) = pid::acquire() {
        error!("{e}");
        eprintln!("{e}");
        return 1;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime error: {e}");
            pid::release();
            return 1;
        }
    };
    let exit = runtime.block_on(run_agent_process(config));
    pid::release();
    exit
}

async fn run_agent_process(config: NanobotConfig) -> i32 {
    let workspace = nanobot_core::paths::workspace_dir();
    let audit = AuditLog::default_location();
    let failures = FailureStore::default_location();

    let bus = Arc::new(MessageBus::new(BUS_CAPACITY));
    let tz: chrono_tz::Tz = config
        .brain
        .timezone
        .parse()
        .unwrap_or(chrono_tz::Asia::Shanghai);
    let cron = Arc::new(CronService::new(
        CronStore::new(nanobot_core::paths::cron_jobs_path()),
        tz,
        audit.clone(),
    ));

    let agent = AgentLoop::new(&config, &workspace, bus.clone(), cron.clone(), audit.clone(), failures);
    cron.set_callback(agent.cron_callback());

    // Channel adapters register here; none ship in-tree. Transports plug in
    // through the `Channel` trait and the bus.
    let mut channels = ChannelManager::new();
    channels.connect_all().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let dispatcher = tokio::spawn(bus.clone().dispatch_outbound());
    let cron_task = tokio::spawn(cron.clone().run(shutdown_rx.clone()));
    let agent_task = tokio::spawn(agent.clone().run(shutdown_rx.clone()));
    let heartbeat = tokio::spawn(agent.clone().run_heartbeat(
        workspace.clone(),
        HEARTBEAT_INTERVAL,
        audit,
        shutdown_rx,
    ));

    info!(
        port = config.gateway.port,
        workspace = %workspace.display(),
        model = %config.brain.model,
        "nanobot gateway started"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("signal handler failed: {e}"),
    }

    // Top-down shutdown: channels stop first, then the tickers exit.
    channels.disconnect_all().await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = agent_task.await;
        let _ = cron_task.await;
        let _ = heartbeat.await;
    })
    .await;
    dispatcher.abort();
    info!("nanobot gateway stopped");
    0
}

pub fn stop_gateway(timeout_secs: u64, force: bool) -> i32 {
    let Some(running) = pid::read_pid() else {
        println!("no gateway PID file; nothing to stop");
        return 0;
    };
    if !pid::is_alive(running) {
        println!("gateway not running (stale pid {running}); cleaning up");
        let _ = std::fs::remove_file(nanobot_core::paths::pid_path());
        return 0;
    }

    println!("stopping gateway (pid {running})...");
    if !pid::signal(running, "-TERM") {
        eprintln!("failed to signal pid {running}");
        return 1;
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    while std::time::Instant::now() < deadline {
        if !pid::is_alive(running) {
            println!("gateway stopped");
            return 0;
        }
        std::thread::sleep(Duration::from_millis(250));
    }

    if force {
        println!("still alive after {timeout_secs}s; killing");
        if pid::signal(running, "-KILL") {
            let _ = std::fs::remove_file(nanobot_core::paths::pid_path());
            return 0;
        }
        eprintln!("failed to kill pid {running}");
        return 1;
    }

    eprintln!("gateway still running after {timeout_secs}s (use --force)");
    1
}
