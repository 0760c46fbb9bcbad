use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tunergate_core::admission::Admission;
use tunergate_core::breaker::CircuitBreaker;
use tunergate_core::bus::EventBus;
use tunergate_core::clock::{Clock, SystemClock};
use tunergate_core::hwcaps::HwCaps;
use tunergate_core::metrics::Metrics;
use tunergate_core::pipeline::PipelineAdapter;
use tunergate_core::preflight::Preflight;
use tunergate_core::receiver::HttpReceiverClient;
use tunergate_core::recordings::RecordingPaths;
use tunergate_core::sessions::{SessionOrchestrator, SessionStore};
use tunergate_core::urlpolicy::UrlPolicy;

use crate::http::AppState;
use crate::monitor::BackgroundMonitor;
use crate::settings::Settings;

mod http;
mod monitor;
mod settings;

#[derive(Parser, Debug)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("TUNERGATE").separator("__"))
        .build()?;
    let settings: Settings = builder.try_deserialize()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let metrics = Metrics::new()?;
    let policy = Arc::new(UrlPolicy::new(&settings.outbound));
    let bus = Arc::new(EventBus::new(settings.bus_capacity, metrics.clone()));

    let breaker = Arc::new(
        CircuitBreaker::new(
            settings.breaker.failure_threshold,
            Duration::from_secs(settings.breaker.reset_timeout_secs),
            clock.clone(),
        )
        .with_metrics(metrics.clone()),
    );
    let receiver = Arc::new(HttpReceiverClient::new(
        &settings.receiver_config(),
        breaker.clone(),
        policy.clone(),
    )?);

    // Verify hardware encoders once before any session can ask for them
    let hwcaps = Arc::new(HwCaps::new(settings.hwcaps_config()));
    let hw = hwcaps.init().await;
    info!(
        ready = hw.ready,
        verified = ?hw.verified_encoders,
        "hardware encoder verification finished"
    );

    let recordings = Arc::new(
        RecordingPaths::new(settings.recordings.mappings.clone())
            .context("invalid recording path mappings")?,
    );
    let preflight = Preflight::new(settings.preflight_config(), policy.clone())?;
    let adapter = Arc::new(PipelineAdapter::new(
        settings.pipeline_config(),
        receiver.clone(),
        preflight,
        hwcaps.clone(),
        recordings.clone(),
        bus.clone(),
        clock.clone(),
        metrics.clone(),
    ));

    let store = Arc::new(SessionStore::new(clock.clone()));
    let admission = Arc::new(Admission::new(settings.admission_config(), metrics.clone()));
    let orchestrator = SessionOrchestrator::new(
        store.clone(),
        bus.clone(),
        admission,
        adapter.clone(),
        clock.clone(),
    );

    let token = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<Result<()>>> = vec![];

    // Orchestrator event loop
    {
        let orchestrator = orchestrator.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator.run(token).await;
            Ok(())
        }));
    }

    // HTTP server
    {
        let state = Arc::new(AppState {
            orchestrator: orchestrator.clone(),
            adapter: adapter.clone(),
            recordings,
            lifecycle: settings.lifecycle_policy(),
            clock: clock.clone(),
            metrics: metrics.clone(),
            idle_timeout_secs: settings.limits.idle_timeout_secs,
        });
        let app = http::router(state, &settings.output_dir);
        let addr: SocketAddr = settings
            .listen_http
            .parse()
            .with_context(|| format!("bad listen address: {}", settings.listen_http))?;
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            info!(%addr, "http server listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await?;
            Ok(())
        }));
    }

    // Background housekeeping
    {
        let mut bg = BackgroundMonitor::new(store, clock, settings.limits.idle_timeout_secs);
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            let interval = bg.interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(interval) => {
                        if let Err(e) = bg.check().await {
                            error!("session sweep failed: {e}");
                        }
                    }
                }
            }
            Ok(())
        }));
    }

    // Shutdown on ctrl-c
    {
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            token.cancel();
            Ok(())
        }));
    }

    for handle in tasks {
        if let Err(e) = handle.await? {
            error!("{e}");
        }
    }
    info!("server closed");
    Ok(())
}
