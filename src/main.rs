//! dialserver - Surface Dial to WebSocket bridge
//!
//! Pushes `{"button":"down"|"up"}` and `{"degrees":n}` messages to every
//! client connected to the WebSocket port.

use dialserver::{aggregator::DebounceAggregator, config, device, hub, web};

use anyhow::Result;
use clap::Parser;
use dialserver::device::{DeviceMonitor, DialBackend, ReconnectSupervisor};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt};

/// Events buffered between the device session and the aggregator
const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Parser)]
#[command(name = "dialserver")]
#[command(about = "Surface Dial to WebSocket bridge", long_about = None)]
#[command(version = env!("DIALSERVER_VERSION"))]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Enable buzz on wake-up
    #[arg(short, long)]
    buzz: bool,

    /// Web sockets port (ws://)
    #[arg(short, long)]
    port: Option<u16>,

    /// Web server port (http://), 0 disables the debug page
    #[arg(short, long)]
    web: Option<u16>,

    /// Config file (default: <config dir>/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "dialserver=trace,tower_http=debug"
        } else if self.debug {
            "dialserver=debug"
        } else {
            "dialserver=info"
        }
    }

    fn overrides(&self) -> config::ConfigOverrides {
        config::ConfigOverrides {
            config_file: self.config.clone(),
            ws_port: self.port,
            html_port: self.web,
            buzz: self.buzz,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.default_log_filter().into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(ChronoLocal::new("%Y-%m-%dT%H:%M:%S%.3f%:z".to_string())),
        )
        .init();

    tracing::info!(
        "Starting dialserver v{} ({})",
        env!("DIALSERVER_VERSION"),
        env!("DIALSERVER_GIT_SHA")
    );

    // Load configuration
    let config = config::load_config(&cli.overrides())?;
    tracing::debug!("config: {:?}", config);

    let shutdown = CancellationToken::new();
    let hub = hub::create_hub(config.consumer_queue);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    // Bind before starting the pipeline so a busy port fails fast
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
    tracing::info!("WebSocket server listening on ws://{}", ws_addr);

    let aggregator = tokio::spawn(DebounceAggregator::new(config.aggregator_settings()).run(
        events_rx,
        hub.clone(),
        shutdown.clone(),
    ));
    let heartbeat = tokio::spawn(hub.clone().run_heartbeat(config.keepalive(), shutdown.clone()));
    let supervisor = spawn_device_supervisor(&config, events_tx, shutdown.clone())?;

    if config.html_port != 0 {
        spawn_web_server(config.html_port, config.ws_port, shutdown.clone()).await;
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    axum::serve(ws_listener, hub::ws::router(hub.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    // Cleanup: wait for the pipeline to drain
    tracing::info!("Shutting down...");
    for (name, task) in [
        ("device supervisor", supervisor),
        ("aggregator", aggregator),
        ("heartbeat", heartbeat),
    ] {
        if let Err(e) = task.await {
            tracing::warn!("{} task failed: {}", name, e);
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Build the configured backend and run it under the reconnect supervisor
fn spawn_device_supervisor(
    config: &config::Config,
    events: mpsc::Sender<dialserver::protocol::SemanticEvent>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let device_config = &config.device;

    match device_config.input {
        #[cfg(feature = "hid")]
        config::InputKind::Hid => {
            let backend =
                device::hid::HidBackend::new(device_config.vendor_id, device_config.product_id)?;
            Ok(supervise(backend, config, events, shutdown))
        }

        #[cfg(not(feature = "hid"))]
        config::InputKind::Hid => {
            anyhow::bail!("built without HID support, set device.input = \"evdev\"")
        }

        #[cfg(not(unix))]
        config::InputKind::Evdev => {
            anyhow::bail!("evdev input is only available on Unix, set device.input = \"hid\"")
        }

        #[cfg(unix)]
        config::InputKind::Evdev => {
            let backend = device::evdev::EvdevBackend::new(
                &device_config.name,
                device_config.event_file.clone(),
            );

            #[cfg(feature = "hid")]
            let control =
                device::hid::HidBackend::new(device_config.vendor_id, device_config.product_id);
            #[cfg(feature = "hid")]
            let backend = match control {
                Ok(control) => backend.with_control(control),
                Err(e) => {
                    tracing::warn!("HID control unavailable, keeping device defaults: {}", e);
                    backend
                }
            };

            Ok(supervise(backend, config, events, shutdown))
        }
    }
}

fn supervise<B: DialBackend>(
    backend: B,
    config: &config::Config,
    events: mpsc::Sender<dialserver::protocol::SemanticEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tracing::info!("Using {} device access", backend.name());
    let monitor = DeviceMonitor::new(backend, config.monitor_settings(), events);
    let supervisor = ReconnectSupervisor::new(monitor, config.retry_config(), shutdown);
    tokio::spawn(supervisor.run())
}

/// Serve the debug page. A bind failure only disables the page.
async fn spawn_web_server(html_port: u16, ws_port: u16, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], html_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Web server cannot listen on {}: {}", addr, e);
            return;
        }
    };
    tracing::debug!("Web server listening on http://{}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, web::router(ws_port))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        {
            tracing::error!("Web server failed: {}", e);
        }
    });
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
