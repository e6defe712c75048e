/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both request a stop: watchers and the
/// orchestrator are cancelled and joined before the process exits.
use tokio::signal::unix::{signal, SignalKind};

/// Which signal requested shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
}

/// Wait until SIGINT or SIGTERM arrives.
pub async fn wait_for_shutdown() -> std::io::Result<Shutdown> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let received = tokio::select! {
        _ = interrupt.recv() => Shutdown::Interrupt,
        _ = terminate.recv() => Shutdown::Terminate,
    };
    tracing::info!(signal = ?received, "shutdown requested");
    Ok(received)
}
