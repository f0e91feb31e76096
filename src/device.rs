use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    db::models::{LastAction, PowerSource, Telemetry},
    error::DeviceError,
    store::StateStore,
    tuya::{
        models::{Command, PlugStatus},
        TuyaClient,
    },
};

/// The physical plug as the reconciler sees it.
#[async_trait]
pub trait PlugDevice: Send + Sync {
    async fn fetch_telemetry(&self) -> Result<Telemetry, DeviceError>;

    /// Close (`true`) or open the relay.
    async fn switch(&self, on: bool) -> Result<(), DeviceError>;
}

/// One Tuya plug reached through a shared [`TuyaClient`].
#[derive(Debug, Clone)]
pub struct TuyaPlug {
    client: TuyaClient,
    device_id: String,
}

impl TuyaPlug {
    pub fn new(client: TuyaClient, device_id: impl Into<String>) -> Self {
        Self { client, device_id: device_id.into() }
    }
}

#[async_trait]
impl PlugDevice for TuyaPlug {
    async fn fetch_telemetry(&self) -> Result<Telemetry, DeviceError> {
        let dps = self.client.get_device_status(&self.device_id).await?;
        let status = PlugStatus::try_from(dps.as_slice())?;
        Ok(status.into_telemetry(Utc::now()))
    }

    async fn switch(&self, on: bool) -> Result<(), DeviceError> {
        let accepted = self
            .client
            .send_commands(&self.device_id, vec![Command::switch(on)])
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(DeviceError::Rejected(format!("switch_1={on}")))
        }
    }
}

/// Device access with the audit trail attached: a power command only
/// counts as done once its [`LastAction`] is stored.
#[derive(Clone)]
pub struct DeviceClient {
    plug: Arc<dyn PlugDevice>,
    store: Arc<dyn StateStore>,
}

impl DeviceClient {
    pub fn new(plug: Arc<dyn PlugDevice>, store: Arc<dyn StateStore>) -> Self {
        Self { plug, store }
    }

    pub async fn fetch_telemetry(&self) -> Result<Telemetry, DeviceError> {
        self.plug.fetch_telemetry().await
    }

    /// Switches the plug and records `{desired_on, source, at}`.
    ///
    /// When the audit write fails the plug has already switched, yet the call
    /// reports [`DeviceError::Audit`].
    pub async fn set_power(&self, desired_on: bool, source: PowerSource) -> Result<(), DeviceError> {
        self.plug.switch(desired_on).await?;
        info!(desired_on, source = %source, "Plug switched");

        let action = LastAction { desired_on, source, at: Utc::now() };
        if let Err(e) = self.store.record_last_action(&action).await {
            warn!(error = %e, desired_on, "Plug switched but the audit record was not written");
            return Err(DeviceError::Audit(e));
        }
        Ok(())
    }
}
