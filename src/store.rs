use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::db::models::{CurrentStatus, LastAction, ManualCommand, Reading, ScheduleConfig, Telemetry};

/// A change to an externally authored record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Schedule(Option<ScheduleConfig>),
    Command(Option<ManualCommand>),
}

/// Where telemetry, status and control records live.
///
/// The reconciler writes through it; the mobile client (via the HTTP API)
/// authors `schedule` and `control/command`; [`watch`](Self::watch)
/// delivers those changes back without polling.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Append a sample to the immutable `readings` log.
    async fn append_reading(&self, telemetry: &Telemetry) -> Result<()>;

    /// Newest-first slice of the `readings` log.
    async fn readings(&self, limit: i64) -> Result<Vec<Reading>>;

    /// Overwrite `status/current`.
    async fn set_status(&self, status: &CurrentStatus) -> Result<()>;

    /// Flag `status/current` offline with `error`, keeping the last sample.
    async fn mark_offline(&self, error: &str, at: DateTime<Utc>) -> Result<()>;

    /// Attach `error` to `status/current` without changing `device_online`.
    async fn record_error(&self, error: &str, at: DateTime<Utc>) -> Result<()>;

    async fn status(&self) -> Result<Option<CurrentStatus>>;

    async fn schedule(&self) -> Result<Option<ScheduleConfig>>;

    async fn set_schedule(&self, schedule: &ScheduleConfig) -> Result<()>;

    async fn pending_command(&self) -> Result<Option<ManualCommand>>;

    async fn set_command(&self, command: &ManualCommand) -> Result<()>;

    /// Remove `control/command` so it cannot be replayed after a restart.
    ///
    /// Only the command issued at `issued_at` is removed; a newer one that
    /// arrived in the meantime stays pending.
    async fn clear_command(&self, issued_at: DateTime<Utc>) -> Result<()>;

    async fn record_last_action(&self, action: &LastAction) -> Result<()>;

    async fn last_action(&self) -> Result<Option<LastAction>>;

    /// Subscribe to changes of `schedule` and `control/command`.
    ///
    /// The current values of both are delivered first, so a subscriber
    /// never misses state written before it subscribed.
    async fn watch(&self) -> Result<mpsc::Receiver<StoreEvent>>;
}

#[cfg(test)]
pub(crate) mod memory {
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    #[derive(Default)]
    struct State {
        readings: Vec<Reading>,
        status: Option<CurrentStatus>,
        schedule: Option<ScheduleConfig>,
        command: Option<ManualCommand>,
        last_action: Option<LastAction>,
        watchers: Vec<mpsc::Sender<StoreEvent>>,
        fail_writes: bool,
        fail_last_action: bool,
    }

    /// In-process [`StateStore`] for tests.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        state: Mutex<State>,
    }

    impl MemoryStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Makes every write fail, as if the database were unreachable.
        pub(crate) fn fail_writes(&self, fail: bool) {
            self.state.lock().unwrap().fail_writes = fail;
        }

        /// Makes only the audit write fail.
        pub(crate) fn fail_last_action(&self, fail: bool) {
            self.state.lock().unwrap().fail_last_action = fail;
        }

        pub(crate) fn reading_count(&self) -> usize {
            self.state.lock().unwrap().readings.len()
        }

        pub(crate) fn current_status(&self) -> Option<CurrentStatus> {
            self.state.lock().unwrap().status.clone()
        }

        pub(crate) fn current_command(&self) -> Option<ManualCommand> {
            self.state.lock().unwrap().command.clone()
        }

        pub(crate) fn current_last_action(&self) -> Option<LastAction> {
            self.state.lock().unwrap().last_action.clone()
        }

        fn write(&self) -> Result<std::sync::MutexGuard<'_, State>> {
            let state = self.state.lock().unwrap();
            if state.fail_writes {
                bail!("store unavailable");
            }
            Ok(state)
        }

        fn notify(state: &mut State, event: StoreEvent) {
            state.watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    #[async_trait]
    impl StateStore for MemoryStore {
        async fn append_reading(&self, telemetry: &Telemetry) -> Result<()> {
            self.write()?.readings.push(Reading::new("plug1", telemetry));
            Ok(())
        }

        async fn readings(&self, limit: i64) -> Result<Vec<Reading>> {
            let state = self.state.lock().unwrap();
            Ok(state.readings.iter().rev().take(limit.max(0) as usize).cloned().collect())
        }

        async fn set_status(&self, status: &CurrentStatus) -> Result<()> {
            self.write()?.status = Some(status.clone());
            Ok(())
        }

        async fn mark_offline(&self, error: &str, at: DateTime<Utc>) -> Result<()> {
            self.write()?
                .status
                .get_or_insert_with(CurrentStatus::default)
                .mark_offline(error, at);
            Ok(())
        }

        async fn record_error(&self, error: &str, at: DateTime<Utc>) -> Result<()> {
            self.write()?
                .status
                .get_or_insert_with(CurrentStatus::default)
                .record_error(error, at);
            Ok(())
        }

        async fn status(&self) -> Result<Option<CurrentStatus>> {
            Ok(self.state.lock().unwrap().status.clone())
        }

        async fn schedule(&self) -> Result<Option<ScheduleConfig>> {
            Ok(self.state.lock().unwrap().schedule.clone())
        }

        async fn set_schedule(&self, schedule: &ScheduleConfig) -> Result<()> {
            let mut state = self.write()?;
            state.schedule = Some(schedule.clone());
            Self::notify(&mut state, StoreEvent::Schedule(Some(schedule.clone())));
            Ok(())
        }

        async fn pending_command(&self) -> Result<Option<ManualCommand>> {
            Ok(self.state.lock().unwrap().command.clone())
        }

        async fn set_command(&self, command: &ManualCommand) -> Result<()> {
            let mut state = self.write()?;
            state.command = Some(command.clone());
            Self::notify(&mut state, StoreEvent::Command(Some(command.clone())));
            Ok(())
        }

        async fn clear_command(&self, issued_at: DateTime<Utc>) -> Result<()> {
            let mut state = self.write()?;
            if state.command.as_ref().is_some_and(|c| c.issued_at == issued_at) {
                state.command = None;
                Self::notify(&mut state, StoreEvent::Command(None));
            }
            Ok(())
        }

        async fn record_last_action(&self, action: &LastAction) -> Result<()> {
            let mut state = self.write()?;
            if state.fail_last_action {
                bail!("audit write rejected");
            }
            state.last_action = Some(action.clone());
            Ok(())
        }

        async fn last_action(&self) -> Result<Option<LastAction>> {
            Ok(self.state.lock().unwrap().last_action.clone())
        }

        async fn watch(&self) -> Result<mpsc::Receiver<StoreEvent>> {
            let (tx, rx) = mpsc::channel(16);
            let mut state = self.state.lock().unwrap();
            tx.try_send(StoreEvent::Schedule(state.schedule.clone()))?;
            tx.try_send(StoreEvent::Command(state.command.clone()))?;
            state.watchers.push(tx);
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn watch_replays_current_values_then_changes() {
        let store = MemoryStore::new();
        let cmd = ManualCommand { desired_on: true, issued_at: Utc::now() };
        store.set_command(&cmd).await.unwrap();

        let mut rx = store.watch().await.unwrap();
        assert_eq!(rx.recv().await, Some(StoreEvent::Schedule(None)));
        assert_eq!(rx.recv().await, Some(StoreEvent::Command(Some(cmd.clone()))));

        store.clear_command(cmd.issued_at).await.unwrap();
        assert_eq!(rx.recv().await, Some(StoreEvent::Command(None)));
    }

    #[tokio::test]
    async fn clear_keeps_a_newer_command() {
        let store = MemoryStore::new();
        let old = ManualCommand { desired_on: true, issued_at: Utc::now() };
        let new = ManualCommand { desired_on: false, issued_at: old.issued_at + chrono::Duration::seconds(1) };
        store.set_command(&new).await.unwrap();

        store.clear_command(old.issued_at).await.unwrap();

        assert_eq!(store.current_command(), Some(new));
    }
}
