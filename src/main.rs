//! camfeed: capture from a V4L2 camera and serve the latest frame over HTTP

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camfeed::capture::{CaptureDevice, CaptureLoop, V4l2Source};
use camfeed::pipeline::FrameStore;
use camfeed::server::{self, AppState};
use camfeed::{utils, Config};
use color_eyre::{eyre::eyre, Result};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let config = Config::load()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(uptime())
        .init();

    info!("camfeed launching...");
    config.validate()?;

    let path = if config.capture.device.is_empty() {
        utils::auto_detect_device(config.capture.format)?
    } else {
        config.capture.device.clone()
    };
    info!("Using capture device: {}", path);

    // Store first, then the configured device, then the loop that joins them.
    let store = Arc::new(if config.capture.format.is_jpeg() {
        FrameStore::new()
    } else {
        FrameStore::passthrough()
    });
    let device = Arc::new(CaptureDevice::new(V4l2Source::configure(
        &path,
        &config.capture,
    )?));
    device.start()?;

    let capture = CaptureLoop::new(Arc::clone(&device), Arc::clone(&store))
        .with_poll_timeout(config.capture.poll_timeout());
    let shutdown = capture.shutdown_handle();
    let capture_done = capture.spawn(config.capture.cpu_core)?;

    let (fatal_tx, fatal_rx) = flume::unbounded();
    let state = AppState {
        store,
        device: Arc::clone(&device),
        content_type: config.capture.format.content_type(),
        stream_frames: config.server.stream_limit(),
        wait_timeout: config.server.wait_timeout(),
        consumers: Arc::new(AtomicUsize::new(0)),
        fatal: fatal_tx,
    };
    let consumers = Arc::clone(&state.consumers);
    let mut http = tokio::spawn(server::serve(config.server.listen, state));

    let outcome: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
        finished = capture_done.recv_async() => match finished {
            Ok(Ok(stats)) => Err(eyre!("capture stopped unexpectedly after {} frames", stats.captured)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(eyre!("capture thread exited without a result")),
        },
        Ok(e) = fatal_rx.recv_async() => Err(e.into()),
        served = &mut http => match served {
            Ok(Ok(())) => Err(eyre!("HTTP server stopped")),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(eyre!("HTTP server task failed: {}", e)),
        },
    };

    // Orderly shutdown: no new consumers, stop the loop, then the device.
    shutdown.store(true, Ordering::Release);
    http.abort();
    let grace = config.capture.poll_timeout() * 2 + Duration::from_secs(1);
    match tokio::time::timeout(grace, capture_done.recv_async()).await {
        Ok(Ok(Ok(stats))) => info!(captured = stats.captured, "capture loop joined"),
        Ok(Ok(Err(e))) => warn!("capture loop ended with: {}", e),
        Ok(Err(_)) => {}
        Err(_) => warn!("capture loop did not stop within {:?}", grace),
    }
    if let Err(e) = device.stop() {
        error!("failed to stop capture: {}", e);
    }
    info!(
        consumers = consumers.load(Ordering::Relaxed),
        "camfeed shutting down"
    );
    drop(device);

    outcome
}
