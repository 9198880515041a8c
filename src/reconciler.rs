use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::config::SwitchConfig;
use crate::tv::RemoteControl;

/// Drives the TV toward the state implied by keyboard presence.
///
/// `last_applied` is the presence value a command sequence was last issued
/// for; it is owned exclusively by this struct and only touched from the
/// single consumer loop, so transitions can never race. It advances even when
/// the remote calls fail: a flapping or unreachable TV must not turn every
/// duplicate event into another connection attempt. The next genuine
/// transition tries again.
pub struct Reconciler<C> {
    client: C,
    config: SwitchConfig,
    last_applied: Option<bool>,
}

impl<C: RemoteControl> Reconciler<C> {
    pub fn new(client: C, config: SwitchConfig) -> Self {
        Reconciler {
            client,
            config,
            last_applied: None,
        }
    }

    /// Runs the command sequence for presence value `present` if it differs
    /// from the last applied value. `last_applied` is only assigned after the
    /// sequence has run to completion, so an attempt cancelled mid-flight is
    /// retried on the next received value rather than counted as applied.
    pub async fn apply(&mut self, present: bool) {
        if self.last_applied == Some(present) {
            // The monitor already collapses duplicates; this is the authority
            // check in case it ever lets one through.
            return;
        }

        let target = if present {
            &self.config.connected_input
        } else {
            &self.config.disconnected_input
        };
        info!(
            "Keyboard {}, switching input to {target}",
            if present { "present" } else { "absent" }
        );

        match self.client.set_input(target).await {
            Ok(()) => info!("Switched input to {target}"),
            Err(err) => error!("Failed to switch input to {target}: {err}"),
        }

        if present && self.config.wake_screen {
            match self.client.set_power(true).await {
                Ok(()) => info!("TV screen turned on"),
                Err(err) => warn!("Could not turn TV screen on: {err}"),
            }
        }
        // No power-off on disconnect, ever.

        self.last_applied = Some(present);
    }

    /// Consumes presence values one at a time until the channel closes. Each
    /// value is fully reconciled (command sequence and outcome) before the
    /// next recv, which serializes all remote commands.
    pub async fn run(mut self, mut rx: mpsc::Receiver<bool>) {
        while let Some(present) = rx.recv().await {
            self.apply(present).await;
        }
        info!("Presence channel closed, reconciler exiting");
    }

    #[cfg(test)]
    fn last_applied(&self) -> Option<bool> {
        self.last_applied
    }
}
