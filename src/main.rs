mod cli;

use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use magi_comm::{CommClient, CommClientConfig, ControllerMessage, MessageLog, ProcessEvent};
use magi_config::Config;
use magi_controller::Controller;
use magi_core::{run_agent, Agent, CostTracker, PauseController, RunContext};
use magi_model::{Message, ModelRotation, ProviderRegistry};
use magi_overseer::{overseer_registry, MemoryStore, Overseer};
use magi_supervisor::{
    apply_system_command, mint_process_id, ProcessTracker, RecordingPtyBus, TaskSupervisor,
};
use magi_tools::{RunningToolTracker, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(magi_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&*config).unwrap_or_default());
            Ok(())
        }
        Commands::Controller { port } => run_controller(config, port).await,
        Commands::Engine {
            process_id,
            controller_port,
            task_prompt,
            test,
        } => run_engine(config, process_id, controller_port, task_prompt, test).await,
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ─── Controller mode ──────────────────────────────────────────────────────────

async fn run_controller(config: Arc<Config>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = (*config).clone();
    if let Some(port) = port {
        config.controller.port = port;
    }
    let config = Arc::new(config);

    let core_process_id = mint_process_id();
    info!(core = %core_process_id, "starting controller");
    let controller = Controller::new(Arc::clone(&config), &core_process_id);

    // The overseer engine is launched like any worker, before serving so it
    // can start reconnect-polling the socket immediately.
    let exe = std::env::current_exe().context("resolving engine binary")?;
    let mut overseer_child = tokio::process::Command::new(exe)
        .arg("engine")
        .arg("--process-id")
        .arg(&core_process_id)
        .arg("--controller-port")
        .arg(config.controller.port.to_string())
        .stdin(std::process::Stdio::null())
        .spawn()
        .context("launching overseer engine")?;

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.controller.port)).await?;
    tokio::select! {
        served = controller.serve(listener) => served,
        status = overseer_child.wait() => {
            anyhow::bail!("overseer engine exited unexpectedly: {status:?}")
        }
    }
}

// ─── Engine mode ──────────────────────────────────────────────────────────────

async fn run_engine(
    config: Arc<Config>,
    process_id: Option<String>,
    controller_port: Option<u16>,
    task_prompt: Option<String>,
    test: bool,
) -> anyhow::Result<()> {
    let process_id = process_id.unwrap_or_else(mint_process_id);
    let port = controller_port.unwrap_or(config.controller.port);
    let test_mode = test || config.engine.test_mode;

    let log = Arc::new(MessageLog::open(
        Path::new(&config.engine.output_dir),
        &process_id,
    )?);
    let mut client_config =
        CommClientConfig::new(&process_id, &config.engine.controller_host, port);
    client_config.test_mode = test_mode;
    let (client, inbound) = CommClient::start(client_config, Some(log));

    if !test_mode {
        spawn_disconnect_watchdog(&client, config.engine.disconnect_exit_secs);
    }

    let providers = Arc::new(ProviderRegistry::from_config(&config.models)?);
    let rotation = Arc::new(ModelRotation::from_config(&config.models));
    let running_tools = Arc::new(RunningToolTracker::new());
    let pause = PauseController::new();
    let cost = Arc::new(CostTracker::new());

    match task_prompt {
        Some(prompt) => {
            run_task_worker(
                process_id,
                prompt,
                client,
                inbound,
                providers,
                rotation,
                running_tools,
                pause,
                cost,
            )
            .await
        }
        None => {
            run_overseer(
                config,
                process_id,
                client,
                inbound,
                providers,
                rotation,
                running_tools,
                pause,
                cost,
            )
            .await
        }
    }
}

fn spawn_disconnect_watchdog(client: &CommClient, threshold_secs: u64) {
    let mut watch = client.connection_watch();
    tokio::spawn(async move {
        loop {
            if *watch.borrow() {
                if watch.changed().await.is_err() {
                    return;
                }
                continue;
            }
            let reconnected = tokio::time::timeout(
                std::time::Duration::from_secs(threshold_secs),
                async {
                    loop {
                        if watch.changed().await.is_err() {
                            return false;
                        }
                        if *watch.borrow() {
                            return true;
                        }
                    }
                },
            )
            .await;
            match reconnected {
                Ok(true) => continue,
                Ok(false) => return,
                Err(_) => {
                    warn!("controller unreachable for {threshold_secs}s, exiting");
                    std::process::exit(1);
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_overseer(
    config: Arc<Config>,
    process_id: String,
    client: CommClient,
    inbound: mpsc::UnboundedReceiver<ControllerMessage>,
    providers: Arc<ProviderRegistry>,
    rotation: Arc<ModelRotation>,
    running_tools: Arc<RunningToolTracker>,
    pause: PauseController,
    cost: Arc<CostTracker>,
) -> anyhow::Result<()> {
    info!(process_id = %process_id, "starting overseer engine");

    let tracker = Arc::new(ProcessTracker::new());
    tracker.set_core_process_id(&process_id);
    let supervisor = Arc::new(TaskSupervisor::new(
        tracker,
        Arc::clone(&running_tools),
        pause.clone(),
        client.clone(),
        Arc::new(RecordingPtyBus::new()),
        config.tasks.health_stall_secs,
    ));

    let memory_dir = Path::new(&config.engine.output_dir).join(&process_id);
    let memory = Arc::new(MemoryStore::open(&memory_dir)?);
    let thought_delay = Arc::new(AtomicU64::new(config.overseer.thought_delay_secs));

    let tools = overseer_registry(
        &config.overseer.user_name,
        client.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&memory),
        Arc::clone(&thought_delay),
        config.tasks.wait_timeout_secs,
    );

    let ctx = RunContext {
        providers,
        rotation,
        tools: Arc::new(tools),
        running_tools,
        pause,
        cost,
    };

    let overseer = Overseer::new(ctx, config, supervisor, memory, thought_delay, client);
    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_on_signal.cancel();
        }
    });
    overseer.run(inbound, shutdown).await
}

#[allow(clippy::too_many_arguments)]
async fn run_task_worker(
    process_id: String,
    prompt: String,
    client: CommClient,
    mut inbound: mpsc::UnboundedReceiver<ControllerMessage>,
    providers: Arc<ProviderRegistry>,
    rotation: Arc<ModelRotation>,
    running_tools: Arc<RunningToolTracker>,
    pause: PauseController,
    cost: Arc<CostTracker>,
) -> anyhow::Result<()> {
    info!(process_id = %process_id, "starting task worker");
    client.send(ProcessEvent::ProcessRunning {
        process_id: process_id.clone(),
    });

    // Worker tool surfaces (shell, browser, design pipelines) plug in from
    // outside the engine; the worker itself runs a bare reasoning loop.
    let ctx = RunContext {
        providers,
        rotation,
        tools: Arc::new(ToolRegistry::new()),
        running_tools: Arc::clone(&running_tools),
        pause: pause.clone(),
        cost,
    };

    // Pause/resume applies immediately; guidance is collected and folded
    // into the final report so the overseer sees it was received.
    let inbound_pause = pause.clone();
    let inbound_running = Arc::clone(&running_tools);
    let (guidance_tx, mut guidance_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let pty = RecordingPtyBus::new();
        while let Some(message) = inbound.recv().await {
            match message {
                ControllerMessage::SystemCommand { command } => {
                    apply_system_command(command, &inbound_pause, &inbound_running, &pty);
                }
                ControllerMessage::SystemMessage { message } => {
                    let _ = guidance_tx.send(message);
                }
                _ => {}
            }
        }
    });

    let agent = Agent::new(&process_id)
        .with_description("isolated task worker")
        .with_instructions(
            "You are a focused worker agent. Complete the task you were given \
             and finish with a clear report of the outcome.",
        )
        .with_max_tool_rounds(25);

    let mut conversation = agent.base_conversation();
    conversation.push(Message::user(&prompt));

    let (tx, mut rx) = mpsc::channel(256);
    let stream_client = client.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            stream_client.send(magi_comm::EngineEvent::Stream(event));
        }
    });

    let result = run_agent(&ctx, &agent, conversation, tx, CancellationToken::new()).await;
    let _ = forwarder.await;

    let mut guidance = Vec::new();
    while let Ok(message) = guidance_rx.try_recv() {
        guidance.push(message);
    }

    match result {
        Ok(conversation) => {
            let output = conversation
                .messages
                .iter()
                .rev()
                .find(|m| {
                    m.role == magi_model::Role::Assistant
                        && m.item_type == magi_model::ItemType::Message
                        && m.content.as_deref().is_some_and(|c| !c.is_empty())
                })
                .and_then(|m| m.content.clone())
                .unwrap_or_else(|| "(task produced no final report)".into());
            let output = if guidance.is_empty() {
                output
            } else {
                format!("{output}\n\n[guidance received: {}]", guidance.join("; "))
            };
            client.send(ProcessEvent::ProcessDone {
                process_id: process_id.clone(),
                output,
            });
            info!(process_id = %process_id, "task worker finished");
            // Let the comm client flush before the process exits.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Ok(())
        }
        Err(e) => {
            client.send(ProcessEvent::ProcessFailed {
                process_id: process_id.clone(),
                error: format!("{e:#}"),
            });
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Err(e)
        }
    }
}
