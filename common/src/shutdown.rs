use sd_notify::NotifyState;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info};

const FORCED_EXIT_DELAY: Duration = Duration::from_secs(10);

/// Report readiness to the service manager and fire the notifier once a
/// termination signal arrives. Waiters must create their `notified()` future
/// before this returns control to the event loop.
pub fn watch(notifier: Arc<Notify>) {
    tokio::spawn(handle_signals(notifier));
    tokio::spawn(async {
        if let Err(e) = sd_notify::notify(false, &[NotifyState::Ready]) {
            error!("notify ready: {}", e);
        }
    });
}

async fn handle_signals(notifier: Arc<Notify>) {
    let mut interrupt = signal(SignalKind::interrupt()).unwrap();
    let mut terminate = signal(SignalKind::terminate()).unwrap();
    let mut quit = signal(SignalKind::quit()).unwrap();

    tokio::select! {
        _ = interrupt.recv() => {
            info!("received interrupt signal");
        },
        _ = terminate.recv() => {
            info!("received terminate signal");
        },
        _ = quit.recv() => {
            info!("received quit signal");
        },
    }

    let _ = sd_notify::notify(true, &[NotifyState::Stopping]);
    notifier.notify_waiters();

    // A connection that never closes must not keep the process alive forever.
    sleep(FORCED_EXIT_DELAY).await;
    error!("graceful shutdown did not complete, exiting");
    process::exit(1);
}
