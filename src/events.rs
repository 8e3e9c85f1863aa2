use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::compliance::RejectReason;
use crate::http::build_client;
use crate::learning::LearningReport;

/// Out-of-band notifications. Delivery is best-effort: a down webhook or a
/// full channel must never slow down or fail the request path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    PhotoRejected {
        draft_id: String,
        filename: String,
        reason: RejectReason,
    },
    DraftRejected {
        draft_id: String,
    },
    LearningSnapshot {
        report: LearningReport,
    },
}

#[derive(Clone)]
pub struct NotifySink {
    tx: mpsc::Sender<NotifyEvent>,
}

impl NotifySink {
    /// Spawns the delivery worker. With no `NOTIFY_WEBHOOK_URL` set, events
    /// are logged and dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<NotifyEvent>(notify_capacity_from_env());
        let webhook_url = std::env::var("NOTIFY_WEBHOOK_URL").ok();
        let http = build_client();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(target = "magpie.events", event = ?event, "delivering event");
                let Some(url) = webhook_url.as_deref() else {
                    continue;
                };
                if let Err(err) = http.post(url).json(&event).send().await {
                    warn!(
                        target = "magpie.events",
                        error = %err,
                        "webhook delivery failed, dropping event"
                    );
                }
            }
        });

        (Self { tx }, handle)
    }

    pub fn emit(&self, event: NotifyEvent) {
        if self.tx.try_send(event).is_err() {
            warn!(
                target = "magpie.events",
                "notification channel full, dropping event"
            );
        }
    }
}

fn notify_capacity_from_env() -> usize {
    std::env::var("NOTIFY_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256)
}
