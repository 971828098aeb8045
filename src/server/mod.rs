//! Outbound BLE peripheral servers.
//!
//! One [`GattServer`] per advertising adapter, holding the CPS/CSC/HR GATT
//! tree; [`MultiServer`] fans metric updates out to every active adapter and
//! treats partial startup as success.

pub mod advertising;
pub mod cps;
pub mod csc;
pub mod hrs;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bluer::adv::AdvertisementHandle;
use bluer::gatt::local::{
    Application, ApplicationHandle, CharacteristicNotifier, CharacteristicRead,
};
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::pipeline::{CrankEvent, WheelEvent};
use advertising::AdvertisingData;
use csc::CscMeasurement;

const POWER_ON_TIMEOUT: Duration = Duration::from_secs(30);
const POWER_ON_POLL: Duration = Duration::from_millis(500);

/// Errors from the peripheral side.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("adapter did not power on")]
    PowerOn,

    #[error("no server adapter could be started")]
    AllFailed,

    #[error(transparent)]
    Bluetooth(#[from] bluer::Error),
}

/// Server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Holds the notifier of a subscribed client, if any.
///
/// Updates sent while nobody subscribes are dropped silently; notification
/// order for one characteristic follows the order of `send` calls.
#[derive(Clone, Default)]
pub struct NotifySlot {
    notifier: Arc<Mutex<Option<CharacteristicNotifier>>>,
    sessions: Arc<AtomicUsize>,
}

impl NotifySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the subscription callback for the characteristic definition.
    pub(crate) fn install(
        &self,
    ) -> Box<
        dyn Fn(CharacteristicNotifier) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync,
    > {
        let slot = self.clone();
        Box::new(move |notifier| {
            let slot = slot.clone();
            async move {
                slot.sessions.fetch_add(1, Ordering::SeqCst);
                *slot.notifier.lock().await = Some(notifier);
            }
            .boxed()
        })
    }

    /// Notify the subscriber, dropping the value when there is none.
    pub async fn send(&self, value: Vec<u8>) {
        let mut slot = self.notifier.lock().await;
        let Some(notifier) = slot.as_mut() else { return };
        if notifier.is_stopped() {
            *slot = None;
            self.sessions.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if let Err(err) = notifier.notify(value).await {
            tracing::debug!("notify failed: {}", err);
            *slot = None;
            self.sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of live subscriptions (0 or 1 per characteristic).
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

/// Mutable characteristic value for read requests.
#[derive(Clone, Default)]
pub struct ValueSlot {
    value: Arc<Mutex<Vec<u8>>>,
}

impl ValueSlot {
    pub fn new(initial: Vec<u8>) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    pub async fn set(&self, value: Vec<u8>) {
        *self.value.lock().await = value;
    }

    pub async fn get(&self) -> Vec<u8> {
        self.value.lock().await.clone()
    }
}

/// Read handler serving a fixed value.
pub(crate) fn read_value(value: Vec<u8>) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |_req| {
            let value = value.clone();
            async move { Ok(value) }.boxed()
        }),
        ..Default::default()
    }
}

/// Read handler serving the current content of a [`ValueSlot`].
pub(crate) fn read_slot(slot: ValueSlot) -> CharacteristicRead {
    CharacteristicRead {
        read: true,
        fun: Box::new(move |_req| {
            let slot = slot.clone();
            async move { Ok(slot.get().await) }.boxed()
        }),
        ..Default::default()
    }
}

/// Per-adapter peripheral server.
pub struct GattServer {
    name: String,
    adapter_name: Option<String>,
    state: ServerState,
    adv_handle: Option<AdvertisementHandle>,
    app_handle: Option<ApplicationHandle>,
    cps_measurement: NotifySlot,
    csc_measurement: NotifySlot,
    hr_measurement: NotifySlot,
    csc_feature: ValueSlot,
}

impl GattServer {
    /// `adapter_name` of `None` selects the default adapter.
    pub fn new(name: &str, adapter_name: Option<&str>) -> Self {
        Self {
            name: name.to_owned(),
            adapter_name: adapter_name.map(str::to_owned),
            state: ServerState::Stopped,
            adv_handle: None,
            app_handle: None,
            cps_measurement: NotifySlot::new(),
            csc_measurement: NotifySlot::new(),
            hr_measurement: NotifySlot::new(),
            csc_feature: ValueSlot::new(csc::FEATURE_CRANK_ONLY.to_vec()),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter_name.as_deref().unwrap_or("default")
    }

    /// Power on the adapter, register the advertisement and serve the GATT
    /// tree.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        self.state = ServerState::Starting;
        let result = self.start_inner().await;
        self.state = match &result {
            Ok(()) => ServerState::Started,
            Err(_) => ServerState::Stopped,
        };
        result
    }

    async fn start_inner(&mut self) -> Result<(), ServerError> {
        let session = bluer::Session::new().await?;
        let adapter = match &self.adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        // Unauthorized or unsupported adapters fail here and are fatal for
        // this entry; a powered-off adapter gets a grace period.
        let _ = adapter.set_powered(true).await;
        let deadline = Instant::now() + POWER_ON_TIMEOUT;
        while !adapter.is_powered().await? {
            if Instant::now() >= deadline {
                return Err(ServerError::PowerOn);
            }
            tokio::time::sleep(POWER_ON_POLL).await;
        }

        let advertising = AdvertisingData::new(&self.name).with_uuids16(&[
            0x1818, // Cycling Power
            0x1816, // Cycling Speed and Cadence
            0x180d, // Heart Rate
        ]);
        let payload = advertising.encode_advertisement();
        tracing::debug!(
            "advertisement payload is {} bytes: {:02x?}",
            payload.len(),
            payload
        );
        self.adv_handle = Some(adapter.advertise(advertising::build_advertisement(&advertising)).await?);

        let app = Application {
            services: vec![
                cps::build_service(self.cps_measurement.clone()),
                csc::build_service(self.csc_measurement.clone(), self.csc_feature.clone()),
                hrs::build_service(self.hr_measurement.clone()),
            ],
            ..Default::default()
        };
        self.app_handle = Some(adapter.serve_gatt_application(app).await?);
        if let Some(limit) = crate::ble::adapter::max_connections() {
            tracing::debug!("inbound connection limit: {}", limit);
        }

        tracing::info!(
            "GATT server {} up on adapter {}",
            self.name,
            self.adapter_name()
        );
        Ok(())
    }

    /// Unregister the advertisement and the GATT tree.
    pub async fn stop(&mut self) {
        if self.state != ServerState::Started {
            return;
        }
        self.state = ServerState::Stopping;
        let sessions = self.cps_measurement.sessions()
            + self.csc_measurement.sessions()
            + self.hr_measurement.sessions();
        if sessions > 0 {
            tracing::info!("dropping {} subscriber(s)", sessions);
        }
        self.app_handle.take();
        self.adv_handle.take();
        self.state = ServerState::Stopped;
    }

    /// Notify a Cycling Power Measurement.
    pub async fn update_power(&self, power: i16, crank: &CrankEvent) {
        self.cps_measurement
            .send(cps::encode_measurement(power, crank).to_vec())
            .await;
    }

    /// Notify a CSC Measurement.
    pub async fn update_csc(&self, measurement: &CscMeasurement) {
        self.csc_measurement
            .send(csc::encode_measurement(measurement))
            .await;
    }

    /// Notify a Heart Rate Measurement.
    pub async fn update_heart_rate(&self, bpm: u8) {
        self.hr_measurement
            .send(hrs::encode_measurement(bpm).to_vec())
            .await;
    }

    /// Upgrade the CSC feature value once wheel data is available.
    pub async fn ensure_csc_capabilities(&self, wheel: bool) {
        if wheel {
            self.csc_feature
                .set(csc::FEATURE_WHEEL_AND_CRANK.to_vec())
                .await;
        }
    }
}

/// Fan-out over every configured server adapter.
pub struct MultiServer {
    entries: Vec<GattServer>,
}

impl MultiServer {
    pub fn new(entries: Vec<GattServer>) -> Self {
        Self { entries }
    }

    /// Start every entry, tolerating partial failure.
    ///
    /// Succeeds when at least one adapter comes up; the rest are logged.
    pub async fn start(&mut self) -> Result<usize, ServerError> {
        let mut started = 0;
        for entry in &mut self.entries {
            match entry.start().await {
                Ok(()) => started += 1,
                Err(err) => {
                    tracing::warn!(
                        "server on adapter {} failed to start: {}",
                        entry.adapter_name(),
                        err
                    );
                }
            }
        }
        if started == 0 {
            return Err(ServerError::AllFailed);
        }
        Ok(started)
    }

    pub async fn stop(&mut self) {
        for entry in &mut self.entries {
            entry.stop().await;
        }
    }

    fn active(&self) -> impl Iterator<Item = &GattServer> {
        self.entries
            .iter()
            .filter(|entry| entry.state == ServerState::Started)
    }

    /// Number of entries currently serving.
    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub async fn update_power(&self, power: i16, crank: &CrankEvent) {
        for entry in self.active() {
            entry.update_power(power, crank).await;
        }
    }

    pub async fn update_csc(
        &self,
        wheel: Option<WheelEvent>,
        crank: Option<CrankEvent>,
    ) {
        let measurement = CscMeasurement { wheel, crank };
        for entry in self.active() {
            entry.update_csc(&measurement).await;
        }
    }

    pub async fn update_heart_rate(&self, bpm: u8) {
        for entry in self.active() {
            entry.update_heart_rate(bpm).await;
        }
    }

    pub async fn ensure_csc_capabilities(&self, wheel: bool) {
        for entry in self.active() {
            entry.ensure_csc_capabilities(wheel).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_slot_drops_without_subscriber() {
        let slot = NotifySlot::new();
        // Nothing to deliver to; must not error or block.
        slot.send(vec![1, 2, 3]).await;
        assert_eq!(slot.sessions(), 0);
    }

    #[tokio::test]
    async fn test_value_slot_upgrade() {
        let slot = ValueSlot::new(csc::FEATURE_CRANK_ONLY.to_vec());
        assert_eq!(slot.get().await, vec![0x02, 0x00]);
        slot.set(csc::FEATURE_WHEEL_AND_CRANK.to_vec()).await;
        assert_eq!(slot.get().await, vec![0x03, 0x00]);
    }

    #[test]
    fn test_server_initial_state() {
        let server = GattServer::new("Gymnasticon", None);
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.adapter_name(), "default");
    }

    #[test]
    fn test_multi_server_active_count() {
        let multi = MultiServer::new(vec![
            GattServer::new("Gymnasticon", Some("hci0")),
            GattServer::new("Gymnasticon", Some("hci1")),
        ]);
        assert_eq!(multi.active_count(), 0);
    }
}
