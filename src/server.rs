//! Server role: run `iperf3 -s` as the counterpart for remote clients.
//!
//! Nothing is recorded or published in this mode. The call blocks until
//! iperf3 exits or the process receives Ctrl-C / SIGTERM, in which case the
//! child is stopped with SIGTERM and, after 5 seconds, SIGKILL.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::ServerSettings;
use crate::throughput::iperf;

/// Run the iperf3 listener until it exits or a shutdown signal arrives.
pub async fn serve(settings: &ServerSettings) -> Result<()> {
    println!("Starting iperf3 server on port {}", settings.port);
    if let Some(iface) = &settings.bind_interface {
        println!("Bound to interface: {}", iface);
    }
    println!("Waiting for connections...\n");

    let args = iperf::server_args(settings.port, settings.bind_interface.as_deref());
    info!(iperf3 = %settings.iperf3_path, ?args, "starting iperf3 server");

    let mut child = Command::new(&settings.iperf3_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn '{}'", settings.iperf3_path))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.context("failed to wait for iperf3 server")?;
            if !status.success() {
                anyhow::bail!("iperf3 server exited with {}", status);
            }
            warn!("iperf3 server exited");
            Ok(())
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping iperf3 server");
            terminate_child(&mut child).await;
            Ok(())
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
///
/// Also guards the client loop: as PID 1 in a container the process gets
/// no default SIGTERM handling.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// SIGTERM, wait up to 5 seconds, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on our own child's pid.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => {
            debug!(exit_code = status.code(), "iperf3 exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "error waiting for iperf3 after SIGTERM");
        }
        Err(_) => {
            warn!("iperf3 did not exit after SIGTERM, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to SIGKILL iperf3");
            }
        }
    }
}
