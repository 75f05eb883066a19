//! Desktop notifications via notify-rust (D-Bus).

use notify_rust::Notification;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::orchestrator::TurnEvent;

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn notify(&self, summary: &str, body: &str) {
        if !self.enabled {
            return;
        }

        debug!("Notification: {summary}");

        if let Err(e) = Notification::new()
            .summary(summary)
            .body(body)
            .icon("audio-volume-high")
            .timeout(3000)
            .show()
        {
            warn!("Failed to show notification: {e}");
        }
    }

    /// Forward turn failures until the event channel closes.
    pub async fn watch(self, mut events: broadcast::Receiver<TurnEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some((summary, body)) = describe(&event) {
                        self.notify(summary, &body);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => debug!("Notifier skipped {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn describe(event: &TurnEvent) -> Option<(&'static str, String)> {
    match event {
        TurnEvent::Failed { turn, reason } => Some(("Doris stopped speaking", format!("{turn}: {reason}"))),
        _ => None,
    }
}
