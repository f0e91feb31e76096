use std::{sync::Arc, time::Duration};

use chrono::Local;
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, error, info, warn};

use crate::{
    db::models::ScheduleConfig,
    reconcile::Trigger,
    schedule::next_transition,
    store::{StateStore, StoreEvent},
};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Bridges store change notifications into the reconciler.
///
/// Schedule changes refresh the cached copy the reconciler reads; manual
/// commands are forwarded as-is.
pub struct CommandWatcher {
    store: Arc<dyn StateStore>,
    schedule: watch::Sender<Option<ScheduleConfig>>,
    mailbox: mpsc::Sender<Trigger>,
}

impl CommandWatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        schedule: watch::Sender<Option<ScheduleConfig>>,
        mailbox: mpsc::Sender<Trigger>,
    ) -> Self {
        Self { store, schedule, mailbox }
    }

    /// Runs until the reconciler's mailbox is closed.
    pub async fn run(self) {
        info!("Store watcher started");
        loop {
            match self.store.watch().await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        if !self.apply(event).await {
                            info!("Reconciler gone; store watcher stopping");
                            return;
                        }
                    }
                    warn!("Store watch ended; resubscribing");
                }
                Err(e) => error!(error = %e, "Failed to subscribe to store changes"),
            }
            if self.mailbox.is_closed() {
                return;
            }
            time::sleep(RESUBSCRIBE_DELAY).await;
        }
    }

    /// Returns `false` once the mailbox is closed.
    async fn apply(&self, event: StoreEvent) -> bool {
        let trigger = match event {
            StoreEvent::Schedule(schedule) => {
                self.schedule.send_replace(self.checked(schedule));
                Trigger::Reevaluate
            }
            StoreEvent::Command(cmd) => {
                debug!(present = cmd.is_some(), "Manual command changed");
                Trigger::Command(cmd)
            }
        };
        self.mailbox.send(trigger).await.is_ok()
    }

    /// A schedule that fails validation is treated as absent.
    fn checked(&self, schedule: Option<ScheduleConfig>) -> Option<ScheduleConfig> {
        let schedule = schedule?;
        if let Err(e) = schedule.validate() {
            warn!(error = %e, "Ignoring invalid schedule");
            return None;
        }
        if schedule.enabled {
            match next_transition(Local::now().naive_local(), &schedule) {
                Some((at, on)) => info!(next_at = %at, turns_on = on, "Schedule updated"),
                None => info!("Schedule updated; no upcoming transition"),
            }
        } else {
            info!("Schedule updated; disabled");
        }
        Some(schedule)
    }
}
