pub mod models;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    PgPool,
};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::store::{StateStore, StoreEvent};

use self::models::{CurrentStatus, LastAction, ManualCommand, Reading, ScheduleConfig, Telemetry};

const SCHEDULE_CHANNEL: &str = "schedule_changed";
const COMMAND_CHANNEL: &str = "control_command_changed";
const LISTENER_RETRY: Duration = Duration::from_secs(5);

pub async fn create_pool(database_url: &str, acquire_timeout: Duration) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .context("Failed to connect to the database")?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// [`StateStore`] backed by PostgreSQL, scoped to one device.
///
/// Watches ride on LISTEN/NOTIFY: triggers on `schedule` and
/// `control_command` publish the device id, and the row is re-read on each
/// notification.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    device_id: String,
}

impl PgStore {
    pub fn new(pool: PgPool, device_id: impl Into<String>) -> Self {
        Self { pool, device_id: device_id.into() }
    }

    async fn snapshot(&self, tx: &mpsc::Sender<StoreEvent>) -> Result<()> {
        let schedule = StoreEvent::Schedule(self.schedule().await?);
        let command = StoreEvent::Command(self.pending_command().await?);
        tx.send(schedule).await.context("watch receiver dropped")?;
        tx.send(command).await.context("watch receiver dropped")?;
        Ok(())
    }

    async fn event_for(&self, channel: &str) -> Result<Option<StoreEvent>> {
        Ok(match channel {
            SCHEDULE_CHANNEL => Some(StoreEvent::Schedule(self.schedule().await?)),
            COMMAND_CHANNEL => Some(StoreEvent::Command(self.pending_command().await?)),
            _ => None,
        })
    }

    /// Forwards notifications until the receiver goes away. A dropped
    /// connection is re-established by the listener; changes made while it
    /// was down are recovered by sending a fresh snapshot.
    async fn forward(self, mut listener: PgListener, tx: mpsc::Sender<StoreEvent>) {
        loop {
            match listener.try_recv().await {
                Ok(Some(notification)) => {
                    if notification.payload() != self.device_id {
                        continue;
                    }
                    debug!(channel = notification.channel(), "Store change notification");
                    match self.event_for(notification.channel()).await {
                        Ok(Some(event)) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Failed to read changed record"),
                    }
                }
                Ok(None) => {
                    warn!("Store listener connection lost; resynchronising");
                    tokio::time::sleep(LISTENER_RETRY).await;
                    if let Err(e) = self.snapshot(&tx).await {
                        if tx.is_closed() {
                            return;
                        }
                        warn!(error = %e, "Failed to resynchronise watched records");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Store listener failed");
                    if tx.is_closed() {
                        return;
                    }
                    tokio::time::sleep(LISTENER_RETRY).await;
                }
            }
        }
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn append_reading(&self, telemetry: &Telemetry) -> Result<()> {
        let r = Reading::new(&self.device_id, telemetry);
        sqlx::query(
            r#"
            INSERT INTO readings
                (id, device_id, voltage, current, power, device_reported_on, load_active, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(r.id)
        .bind(&r.device_id)
        .bind(r.voltage)
        .bind(r.current)
        .bind(r.power)
        .bind(r.device_reported_on)
        .bind(r.load_active)
        .bind(r.observed_at)
        .execute(&self.pool)
        .await
        .context("Failed to append reading")?;
        Ok(())
    }

    async fn readings(&self, limit: i64) -> Result<Vec<Reading>> {
        let rows = sqlx::query_as::<_, Reading>(
            r#"
            SELECT id, device_id, voltage, current, power, device_reported_on, load_active, observed_at
            FROM readings
            WHERE device_id = $1
            ORDER BY observed_at DESC
            LIMIT $2
            "#,
        )
        .bind(&self.device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load readings")?;
        Ok(rows)
    }

    async fn set_status(&self, s: &CurrentStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status
                (device_id, device_online, voltage, current, power, device_reported_on,
                 load_active, observed_at, last_error, error_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (device_id) DO UPDATE SET
                device_online      = EXCLUDED.device_online,
                voltage            = EXCLUDED.voltage,
                current            = EXCLUDED.current,
                power              = EXCLUDED.power,
                device_reported_on = EXCLUDED.device_reported_on,
                load_active        = EXCLUDED.load_active,
                observed_at        = EXCLUDED.observed_at,
                last_error         = EXCLUDED.last_error,
                error_at           = EXCLUDED.error_at,
                updated_at         = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.device_id)
        .bind(s.device_online)
        .bind(s.voltage)
        .bind(s.current)
        .bind(s.power)
        .bind(s.device_reported_on)
        .bind(s.load_active)
        .bind(s.observed_at)
        .bind(&s.last_error)
        .bind(s.error_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to write current status")?;
        Ok(())
    }

    async fn mark_offline(&self, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status (device_id, device_online, last_error, error_at, updated_at)
            VALUES ($1, FALSE, $2, $3, $3)
            ON CONFLICT (device_id) DO UPDATE SET
                device_online = FALSE,
                last_error    = EXCLUDED.last_error,
                error_at      = EXCLUDED.error_at,
                updated_at    = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.device_id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to mark device offline")?;
        Ok(())
    }

    async fn record_error(&self, error: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status (device_id, device_online, last_error, error_at, updated_at)
            VALUES ($1, FALSE, $2, $3, $3)
            ON CONFLICT (device_id) DO UPDATE SET
                last_error = EXCLUDED.last_error,
                error_at   = EXCLUDED.error_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.device_id)
        .bind(error)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to record device error")?;
        Ok(())
    }

    async fn status(&self) -> Result<Option<CurrentStatus>> {
        let row = sqlx::query_as::<_, CurrentStatus>(
            r#"
            SELECT device_online, voltage, current, power, device_reported_on, load_active,
                   observed_at, last_error, error_at, updated_at
            FROM device_status
            WHERE device_id = $1
            "#,
        )
        .bind(&self.device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load current status")?;
        Ok(row)
    }

    async fn schedule(&self) -> Result<Option<ScheduleConfig>> {
        let row = sqlx::query_as::<_, ScheduleConfig>(
            "SELECT enabled, active_days, start_time, end_time FROM schedule WHERE device_id = $1",
        )
        .bind(&self.device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load schedule")?;
        Ok(row)
    }

    async fn set_schedule(&self, s: &ScheduleConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO schedule (device_id, enabled, active_days, start_time, end_time, updated_at)
            VALUES ($1, $2, $3, $4, $5, now())
            ON CONFLICT (device_id) DO UPDATE SET
                enabled     = EXCLUDED.enabled,
                active_days = EXCLUDED.active_days,
                start_time  = EXCLUDED.start_time,
                end_time    = EXCLUDED.end_time,
                updated_at  = EXCLUDED.updated_at
            "#,
        )
        .bind(&self.device_id)
        .bind(s.enabled)
        .bind(&s.active_days)
        .bind(&s.start_time)
        .bind(&s.end_time)
        .execute(&self.pool)
        .await
        .context("Failed to write schedule")?;
        Ok(())
    }

    async fn pending_command(&self) -> Result<Option<ManualCommand>> {
        let row = sqlx::query_as::<_, ManualCommand>(
            "SELECT desired_on, issued_at FROM control_command WHERE device_id = $1",
        )
        .bind(&self.device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load manual command")?;
        Ok(row)
    }

    async fn set_command(&self, c: &ManualCommand) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO control_command (device_id, desired_on, issued_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (device_id) DO UPDATE SET
                desired_on = EXCLUDED.desired_on,
                issued_at  = EXCLUDED.issued_at
            "#,
        )
        .bind(&self.device_id)
        .bind(c.desired_on)
        .bind(c.issued_at)
        .execute(&self.pool)
        .await
        .context("Failed to write manual command")?;
        Ok(())
    }

    async fn clear_command(&self, issued_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("DELETE FROM control_command WHERE device_id = $1 AND issued_at = $2")
            .bind(&self.device_id)
            .bind(issued_at)
            .execute(&self.pool)
            .await
            .context("Failed to clear manual command")?;
        Ok(())
    }

    async fn record_last_action(&self, a: &LastAction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO last_action (device_id, desired_on, source, at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (device_id) DO UPDATE SET
                desired_on = EXCLUDED.desired_on,
                source     = EXCLUDED.source,
                at         = EXCLUDED.at
            "#,
        )
        .bind(&self.device_id)
        .bind(a.desired_on)
        .bind(a.source)
        .bind(a.at)
        .execute(&self.pool)
        .await
        .context("Failed to record last action")?;
        Ok(())
    }

    async fn last_action(&self) -> Result<Option<LastAction>> {
        let row = sqlx::query_as::<_, LastAction>(
            "SELECT desired_on, source, at FROM last_action WHERE device_id = $1",
        )
        .bind(&self.device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load last action")?;
        Ok(row)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<StoreEvent>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("Failed to open store listener")?;
        listener
            .listen_all([SCHEDULE_CHANNEL, COMMAND_CHANNEL])
            .await
            .context("Failed to LISTEN on store channels")?;

        // Subscribed before the snapshot, so nothing written in between is lost.
        let (tx, rx) = mpsc::channel(16);
        self.snapshot(&tx).await?;
        tokio::spawn(self.clone().forward(listener, tx));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
