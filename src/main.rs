use std::time::Duration;

use tokio_util::sync::CancellationToken;

mod config;
mod pipeline;
mod session;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("cloud_bus", log::LevelFilter::Debug)
        .init();
}

/// Periodic diagnostics: one line per incoming tile.
fn log_stats(session: &session::Session) {
    for (index, preparer) in session.receive_pipeline().preparers().iter().enumerate() {
        preparer.latch_frame();
        log::info!(
            "tile {}: timestamp {} queued {}ms dropped {} pointsize {:.4}",
            index,
            preparer.current_timestamp(),
            preparer.queue_duration(),
            preparer.dropped(),
            preparer.point_size(),
        );
    }
}

/// Runs a self-loopback session: the default configuration points the
/// peer endpoints at our own listeners, so the synthetic capture is
/// compressed, transmitted, received and decoded within one process.
#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::SessionConfig::from_env();
    let mut session = session::Session::start(config).await.unwrap_or_else(|e| {
        eprintln!("Error starting session: {}", e);
        std::process::exit(1);
    });
    log::info!(
        "session up: media {:?} control {}",
        session.media_addr(),
        session.control_addr()
    );

    let cancel = CancellationToken::new();
    let mut stats = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            _ = stats.tick() => {
                log_stats(&session);
            },
            _ = tokio::time::sleep(Duration::from_millis(50)), if !session.receive_active() => {
                session.poll().await;
            },
        }
    }

    session.stop_and_wait().await;
    std::process::exit(0);
}
