use camgate_server::{retention, server, GatewayConfig, GatewayState, SqliteCatalog};
use camgate_supervisor::output::wipe_hls_root;
use camgate_supervisor::{
    locate_ffmpeg, probe_ffmpeg, CameraRegistry, Gateway, HealthMonitor, HlsSupervisor,
    IntervalSchedule, ProcessLauncher, RecordingSupervisor, Schedule, SegmentCatalog,
    TokioLauncher, EVENT_CHANNEL_CAPACITY,
};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,camgate_server=debug,camgate_supervisor=debug".into()),
        )
        .init();

    std::panic::set_hook(Box::new(|panic| {
        error!("💥 {}", panic);
    }));

    if let Err(e) = run().await {
        error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = GatewayConfig::from_env()?;

    // STORAGE_DIR structure:
    //   - recordings/ (continuous and manual .mp4 segments)
    //   - media/live/<camera>/ (HLS playlists and segments)
    //   - videos.db (SQLite catalog)
    std::fs::create_dir_all(config.recordings_dir())?;
    std::fs::create_dir_all(config.hls_root())?;

    let ffmpeg = match locate_ffmpeg(config.ffmpeg.as_deref()) {
        Ok(path) => {
            if let Err(e) = probe_ffmpeg(&path).await {
                warn!("⚠️ ffmpeg at {} did not respond: {}", path.display(), e);
            }
            path
        }
        Err(e) => {
            // Keep serving the API; launches will report the missing binary
            warn!("⚠️ {}", e);
            config.ffmpeg.clone().unwrap_or_else(|| PathBuf::from("ffmpeg"))
        }
    };

    let catalog: Arc<dyn SegmentCatalog> = Arc::new(SqliteCatalog::new(config.database_path())?);
    let launcher: Arc<dyn ProcessLauncher> = Arc::new(TokioLauncher);
    let schedule: Arc<dyn Schedule> = Arc::new(IntervalSchedule);
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let removed = wipe_hls_root(&config.hls_root()).await?;
    if removed > 0 {
        info!("🧹 Removed {} stale HLS file(s) from a previous run", removed);
    }

    let hls = HlsSupervisor::new(
        Arc::clone(&launcher),
        config.hls_config(ffmpeg.clone()),
        events.clone(),
    );
    let recording = RecordingSupervisor::new(
        Arc::clone(&launcher),
        Arc::clone(&catalog),
        Arc::clone(&schedule),
        config.recording_config(ffmpeg),
        events.clone(),
    );
    let registry = Arc::new(CameraRegistry::new(config.cameras.iter().cloned()));
    let monitor_config = config.monitor_config();
    let gateway = Gateway::new(
        Arc::clone(&registry),
        hls.clone(),
        recording,
        &events,
        monitor_config.freshness_window,
    );

    let health = HealthMonitor::new(hls, registry, events.clone(), monitor_config).spawn(schedule.as_ref());
    let sweep = retention::spawn(
        Arc::clone(&catalog),
        config.retention,
        schedule.as_ref(),
        config.sweep_interval,
    );

    let state = Arc::new(GatewayState {
        gateway: gateway.clone(),
        catalog,
        rtmp_app: config.rtmp_app.clone(),
        recordings_dir: config.recordings_dir(),
    });

    // Create and run the server
    let app = server::create_app(state);

    let addr = SocketAddr::new(config.bind_addr, config.api_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("📡 Camera gateway listening on http://{} (HTTP/1.1 + HTTP/2)", addr);
    info!("Storage directory: {}", config.storage_dir.display());
    info!(
        "Ingest {} for {} camera(s), media HTTP port {}",
        config.ingest_base_url(),
        config.cameras.len(),
        config.http_port
    );

    // Use hyper's auto-negotiating server to support both HTTP/1.1 and HTTP/2
    let conn_builder = ConnBuilder::new(hyper_util::rt::TokioExecutor::new());

    loop {
        let (stream, addr) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl-C received, shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
        };
        debug!("New connection from: {}", addr);
        let io = TokioIo::new(stream);
        let app_clone = app.clone();
        let conn_builder = conn_builder.clone();

        tokio::spawn(async move {
            if let Err(err) = conn_builder
                .serve_connection_with_upgrades(
                    io,
                    hyper::service::service_fn(move |req| app_clone.clone().call(req)),
                )
                .await
            {
                // Check if the error is an io::Error indicating a normal close
                let is_normal_close = err
                    .source()
                    .and_then(|e| e.downcast_ref::<io::Error>())
                    .map(|io_err| {
                        matches!(
                            io_err.kind(),
                            io::ErrorKind::ConnectionReset
                                | io::ErrorKind::BrokenPipe
                                | io::ErrorKind::UnexpectedEof
                        )
                    })
                    .unwrap_or(false);

                if is_normal_close {
                    debug!("Connection from {} closed normally", addr);
                } else {
                    error!("Error serving connection from {}: {}", addr, err);
                }
            } else {
                debug!("Connection from {} completed successfully", addr);
            }
        });
    }

    tokio::join!(health.shutdown(), sweep.shutdown());
    gateway.shutdown().await;
    info!("👋 Camera gateway stopped");
    Ok(())
}
