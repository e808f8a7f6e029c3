use crate::config::GatewayConfig;
use crate::plugin::{HookContext, HookPoint};
use crate::server::{self, GatewayState};
use crate::upstream::health::run_health_checks;
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
}

/// Gateway lifecycle: init → spawn loops → serve → drain → teardown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = GatewayConfig::load(&args.config_path)?;
    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", config.port));

    let state = GatewayState::new(config)?;
    let shutdown = Arc::new(Notify::new());

    // Background loops — all owned here, all stop on shutdown.
    state.limiter.start_gc();
    start_monitor(&state, &shutdown);
    start_health_check_loop(&state, &shutdown);
    start_judge_loop(&state, &shutdown);
    start_optimizer_loop(&state, &shutdown);
    start_budget_reset_timer(&state, &shutdown);
    start_budget_event_logger(&state, &shutdown);

    tracing::info!(
        "server: starting gateway, listen={}, upstreams={}",
        listen,
        state.upstreams.len()
    );

    let server_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        let listen = listen.clone();
        async move { server::run_server(&listen, state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    // Teardown: flush pending shadows through the judge, then run shutdown
    // hooks.
    if state.judge.enabled() && state.shadow.queue_len() > 0 {
        tracing::info!(
            "shutdown: flushing {} pending shadow comparisons",
            state.shadow.queue_len()
        );
        state
            .judge
            .run_once(&state.shadow, &state.collector, Some(&state.inspector))
            .await;
    }
    let mut ctx = HookContext::new("shutdown", "shutdown", (*state.config).context.clone());
    state.plugins.execute(HookPoint::OnShutdown, &mut ctx);

    if let Err(e) = server_handle.await {
        tracing::error!("server: task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, returning `true` if shutdown fired first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_monitor(state: &GatewayState, shutdown: &Arc<Notify>) {
    let monitor = state.monitor.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        monitor.run(shutdown).await;
    });
}

fn start_health_check_loop(state: &GatewayState, shutdown: &Arc<Notify>) {
    let upstreams = state.upstreams.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(HEALTH_CHECK_INTERVAL, &shutdown).await {
                return;
            }
            run_health_checks(&upstreams).await;
        }
    });
}

fn start_judge_loop(state: &GatewayState, shutdown: &Arc<Notify>) {
    if !state.judge.enabled() {
        tracing::info!("judge: disabled");
        return;
    }
    let state = state.clone();
    let shutdown = shutdown.clone();
    let interval = Duration::from_secs(state.config.judge.interval_secs.max(1));
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            let judged = state
                .judge
                .run_once(&state.shadow, &state.collector, Some(&state.inspector))
                .await;
            if judged > 0 {
                tracing::debug!("judge: pass completed, judged={}", judged);
            }
        }
    });
}

fn start_optimizer_loop(state: &GatewayState, shutdown: &Arc<Notify>) {
    if !state.config.optimizer.enabled {
        tracing::info!("optimizer: disabled");
        return;
    }
    let state = state.clone();
    let shutdown = shutdown.clone();
    let interval = Duration::from_secs(state.optimizer.update_interval_secs().max(1));
    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            let report = state.optimizer.run_once();
            tracing::info!(
                "optimizer: scheduled run completed, changes={}",
                report.changes.len()
            );
        }
    });
}

/// Fire `reset_all` at each period boundary.
fn start_budget_reset_timer(state: &GatewayState, shutdown: &Arc<Notify>) {
    if !state.budget.enabled() {
        return;
    }
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let next = state.budget.next_reset_unix();
            let wait = Duration::from_secs(next.saturating_sub(now).max(1));
            if sleep_or_shutdown(wait, &shutdown).await {
                return;
            }
            state.budget.reset_all();
        }
    });
}

/// Surface budget warning/exceeded events in the logs.
fn start_budget_event_logger(state: &GatewayState, shutdown: &Arc<Notify>) {
    if !state.budget.enabled() {
        return;
    }
    let mut rx = state.budget.subscribe();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(ev) => {
                        tracing::warn!(
                            "budget: {:?}, key={}, tokens={}/{}, cost={:.4}/{:.2}",
                            ev.kind,
                            ev.api_key,
                            ev.tokens_used,
                            ev.token_limit,
                            ev.cost_used,
                            ev.cost_limit
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.notified() => return,
            }
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
