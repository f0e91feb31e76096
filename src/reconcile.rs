use std::{future::Future, sync::Arc, time::Duration};

use anyhow::anyhow;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    db::models::{CurrentStatus, ManualCommand, PowerSource, ScheduleConfig},
    device::DeviceClient,
    error::DeviceError,
    schedule::is_desired_on_by_schedule,
    store::StateStore,
};

/// Work posted to the reconciler's mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Full cycle: fetch, persist, decide, command.
    Poll,
    /// The stored manual command changed (`None` once it is gone).
    Command(Option<ManualCommand>),
    /// The cached schedule changed; decide and command only.
    Reevaluate,
}

/// Where the current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Fetching,
    Persisting,
    Deciding,
    Commanding,
    Faulted,
}

/// The target power state and what asked for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub desired_on: bool,
    pub source: PowerSource,
}

/// A pending manual command wins; otherwise an enabled, well-formed schedule
/// decides. With neither there is nothing to enforce.
pub fn decide(
    pending: Option<&ManualCommand>,
    schedule: Option<&ScheduleConfig>,
    now: NaiveDateTime,
) -> Option<Decision> {
    if let Some(cmd) = pending {
        return Some(Decision { desired_on: cmd.desired_on, source: PowerSource::Manual });
    }
    let schedule = schedule.filter(|s| s.enabled && s.validate().is_ok())?;
    Some(Decision {
        desired_on: is_desired_on_by_schedule(now, Some(schedule)),
        source: PowerSource::Schedule,
    })
}

type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Single owner of the plug's power decisions.
///
/// Every trigger goes through one mailbox and is handled to completion
/// before the next, so two decisions never act on the same stale
/// `last_known` value.
pub struct Reconciler {
    device: DeviceClient,
    store: Arc<dyn StateStore>,
    schedule: watch::Receiver<Option<ScheduleConfig>>,
    call_timeout: Duration,
    clock: Clock,
    state: CycleState,
    /// Last observed or successfully commanded relay state.
    last_known: Option<bool>,
    pending: Option<ManualCommand>,
    /// `issued_at` of the most recently consumed command.
    last_consumed: Option<DateTime<Utc>>,
}

impl Reconciler {
    pub fn new(
        device: DeviceClient,
        store: Arc<dyn StateStore>,
        schedule: watch::Receiver<Option<ScheduleConfig>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            device,
            store,
            schedule,
            call_timeout,
            clock: Box::new(|| Local::now().naive_local()),
            state: CycleState::Idle,
            last_known: None,
            pending: None,
            last_consumed: None,
        }
    }

    /// Replace the local wall clock used for schedule evaluation.
    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn last_known(&self) -> Option<bool> {
        self.last_known
    }

    pub fn pending(&self) -> Option<&ManualCommand> {
        self.pending.as_ref()
    }

    /// Polls every `poll_interval` and processes mailbox triggers until every
    /// sender is gone.
    ///
    /// The first poll completes before the mailbox is read, so `last_known`
    /// comes from the device before any command is decided. After that a
    /// queued trigger is served ahead of a due tick; ticks that fall due
    /// while a cycle is running are skipped, not queued.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<Trigger>, poll_interval: Duration) {
        info!(interval_secs = poll_interval.as_secs(), "Reconciler started");
        let mut ticker = time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        self.handle(Trigger::Poll).await;

        loop {
            tokio::select! {
                biased;
                trigger = mailbox.recv() => match trigger {
                    Some(trigger) => self.handle(trigger).await,
                    None => break,
                },
                _ = ticker.tick() => self.handle(Trigger::Poll).await,
            }
        }
        info!("Reconciler mailbox closed; stopping");
    }

    pub async fn handle(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Poll => self.poll_cycle().await,
            Trigger::Command(cmd) => {
                self.accept_command(cmd);
                self.reconcile().await;
            }
            Trigger::Reevaluate => self.reconcile().await,
        }
    }

    fn enter(&mut self, next: CycleState) {
        debug!(from = ?self.state, to = ?next, "Reconciler state");
        self.state = next;
    }

    fn accept_command(&mut self, cmd: Option<ManualCommand>) {
        match cmd {
            None => {
                if self.pending.take().is_some() {
                    info!("Pending manual command withdrawn");
                }
            }
            Some(cmd) if Some(cmd.issued_at) == self.last_consumed => {
                debug!(issued_at = %cmd.issued_at, "Ignoring already consumed manual command");
            }
            Some(cmd) => {
                info!(desired_on = cmd.desired_on, issued_at = %cmd.issued_at, "Manual command received");
                self.pending = Some(cmd);
            }
        }
    }

    async fn poll_cycle(&mut self) {
        self.enter(CycleState::Fetching);
        let telemetry = match self.device_call(self.device.fetch_telemetry()).await {
            Ok(t) => t,
            Err(e) => {
                self.enter(CycleState::Faulted);
                warn!(error = %e, "Telemetry fetch failed; marking device offline");
                let message = e.to_string();
                if let Err(e) = self.store_call(self.store.mark_offline(&message, Utc::now())).await {
                    error!(error = %e, "Failed to mark device offline");
                }
                self.enter(CycleState::Idle);
                return;
            }
        };

        self.enter(CycleState::Persisting);
        self.last_known = Some(telemetry.device_reported_on);
        let persisted = async {
            self.store_call(self.store.append_reading(&telemetry)).await?;
            self.store_call(self.store.set_status(&CurrentStatus::online(&telemetry))).await
        }
        .await;
        if let Err(e) = persisted {
            error!(error = %e, "Failed to persist telemetry");
            let message = format!("persisting telemetry failed: {e}");
            if let Err(e) = self.store_call(self.store.mark_offline(&message, Utc::now())).await {
                warn!(error = %e, "Failed to record persistence error");
            }
        } else {
            debug!(
                power = telemetry.power,
                relay_on = telemetry.device_reported_on,
                load_active = telemetry.load_active(),
                "Telemetry persisted"
            );
        }

        self.reconcile().await;
    }

    /// Decide and, when the target differs from `last_known`, command.
    async fn reconcile(&mut self) {
        self.enter(CycleState::Deciding);
        let schedule = self.schedule.borrow().clone();
        let now = (self.clock)();

        let Some(decision) = decide(self.pending.as_ref(), schedule.as_ref(), now) else {
            self.enter(CycleState::Idle);
            return;
        };

        if Some(decision.desired_on) == self.last_known {
            if decision.source == PowerSource::Manual {
                debug!(desired_on = decision.desired_on, "Manual command already satisfied");
                self.consume_command().await;
            }
            self.enter(CycleState::Idle);
            return;
        }

        self.enter(CycleState::Commanding);
        info!(
            desired_on = decision.desired_on,
            source = %decision.source,
            last_known = ?self.last_known,
            "Switching plug"
        );
        match self
            .device_call(self.device.set_power(decision.desired_on, decision.source))
            .await
        {
            Ok(()) => {
                self.last_known = Some(decision.desired_on);
                if decision.source == PowerSource::Manual {
                    self.consume_command().await;
                }
            }
            Err(e) => {
                error!(error = %e, source = %decision.source, "Power command failed");
                let message = format!("power command ({}) failed: {e}", decision.source);
                if let Err(e) = self.store_call(self.store.record_error(&message, Utc::now())).await {
                    warn!(error = %e, "Failed to record power command error");
                }
            }
        }
        self.enter(CycleState::Idle);
    }

    async fn consume_command(&mut self) {
        let Some(cmd) = self.pending.take() else {
            return;
        };
        self.last_consumed = Some(cmd.issued_at);
        if let Err(e) = self.store_call(self.store.clear_command(cmd.issued_at)).await {
            warn!(error = %e, "Failed to clear consumed manual command");
        }
    }

    async fn device_call<T>(
        &self,
        fut: impl Future<Output = Result<T, DeviceError>>,
    ) -> Result<T, DeviceError> {
        time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| DeviceError::Timeout(self.call_timeout))?
    }

    async fn store_call<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| anyhow!("store call timed out after {}s", self.call_timeout.as_secs()))?
    }
}
