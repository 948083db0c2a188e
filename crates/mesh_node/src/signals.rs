//! Shutdown signal handling for the node binary.

use std::fmt;
use tokio::signal;

/// Signal that asked the node to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    #[cfg_attr(not(unix), allow(dead_code))]
    Interrupt,
    #[cfg_attr(not(unix), allow(dead_code))]
    Terminate,
    #[cfg_attr(unix, allow(dead_code))]
    CtrlC,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::CtrlC => "Ctrl+C",
        })
    }
}

/// Resolves with the first shutdown signal the process receives.
///
/// SIGINT and SIGTERM on Unix, Ctrl+C elsewhere. Fails only if the signal
/// handlers cannot be installed.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let received = tokio::select! {
            _ = interrupt.recv() => ShutdownSignal::Interrupt,
            _ = terminate.recv() => ShutdownSignal::Terminate,
        };
        Ok(received)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok(ShutdownSignal::CtrlC)
    }
}
