//! # OS termination signals.
//!
//! [`wait_for_shutdown_signal`] completes when the process is asked to stop and
//! names the signal, so the orchestrator can log what interrupted the run.
//!
//! - **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT`
//! - **Other platforms:** Ctrl-C via [`tokio::signal::ctrl_c`]

/// Waits for a termination signal; returns its name.
///
/// Fails if a signal listener cannot be registered.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv()  => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Waits for a termination signal; returns its name.
///
/// Fails if a signal listener cannot be registered.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
