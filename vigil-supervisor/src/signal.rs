//! Shutdown signals

use tracing::debug;

/// Resolve on the next interrupt (Ctrl-C) or, on unix, SIGTERM
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let name = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                "SIGINT"
            }
            _ = terminate.recv() => "SIGTERM",
        };
        debug!(signal = name, "Received shutdown signal");
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        debug!("Received Ctrl-C");
        Ok("ctrl-c")
    }
}
