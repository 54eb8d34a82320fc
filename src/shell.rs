//! Glue between the two services: what happens when a clap is heard.

use std::future::Future;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::bridge::BridgeClient;

/// What the shell did with one clap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClapResponse {
    /// No bridge paired yet; the clap was ignored
    NotConnected,
    Toggled { turn_on: bool, lights: usize },
    /// Some or all lights could not be switched
    Failed { switched: usize, reason: String },
}

/// Toggle the lights in response to a clap and report the result.
pub async fn handle_clap(bridge: &mut BridgeClient) -> ClapResponse {
    if !bridge.is_connected() {
        log::warn!("Clap ignored: not connected to a bridge. Run `handclap pair` first.");
        return ClapResponse::NotConnected;
    }

    match bridge.toggle_all_lights_report().await {
        Some(report) if report.is_complete() => {
            log::info!(
                "Lights toggled {} ({} light(s))",
                if report.turn_on { "on" } else { "off" },
                report.applied.len()
            );
            ClapResponse::Toggled {
                turn_on: report.turn_on,
                lights: report.applied.len(),
            }
        }
        Some(report) => {
            let reason = format!(
                "light {} did not respond: {}",
                report.failed.as_deref().unwrap_or("?"),
                report.error.as_deref().unwrap_or("unknown error")
            );
            log::error!(
                "Failed to toggle lights ({} switched before the failure): {}",
                report.applied.len(),
                reason
            );
            ClapResponse::Failed {
                switched: report.applied.len(),
                reason,
            }
        }
        None => {
            log::error!("Failed to toggle lights: could not communicate with the bridge");
            ClapResponse::Failed {
                switched: 0,
                reason: "could not communicate with the bridge".to_string(),
            }
        }
    }
}

/// Why [`relay_claps`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Shutdown,
    /// The detector dropped its sender, so no more claps will arrive
    DetectorStopped,
}

/// Toggle the lights for every clap until `shutdown` resolves or the
/// detector hangs up.
///
/// `shutdown` also interrupts a toggle stuck on an unresponsive bridge.
/// Claps queued while a toggle was in flight are discarded.
pub async fn relay_claps<S>(
    bridge: &mut BridgeClient,
    claps: &mut UnboundedReceiver<()>,
    shutdown: S,
) -> RelayEnd
where
    S: Future,
{
    tokio::pin!(shutdown);

    loop {
        let clap = tokio::select! {
            clap = claps.recv() => clap,
            _ = &mut shutdown => return RelayEnd::Shutdown,
        };
        if clap.is_none() {
            return RelayEnd::DetectorStopped;
        }

        log::info!("Clap detected");
        tokio::select! {
            _ = handle_clap(bridge) => {}
            _ = &mut shutdown => return RelayEnd::Shutdown,
        }

        let mut skipped = 0usize;
        while claps.try_recv().is_ok() {
            skipped += 1;
        }
        if skipped > 0 {
            log::debug!("Dropped {} clap(s) heard during the toggle", skipped);
        }
    }
}
