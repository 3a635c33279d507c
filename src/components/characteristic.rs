//! Notification Characteristic
//!
//! Subscription lifecycle of one notifying characteristic: resolves it, negotiates
//! notifications, and pumps every received payload through a decoder.
use crate::api::platform::{GattService, NotificationConfig, WriteStatus};
use crate::core::error::HrpError;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use log::{debug, trace, warn};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Decoding strategy turning a raw payload into a sample.
pub type Decoder<T> = fn(&[u8], OffsetDateTime) -> Result<T, HrpError>;

/// Forwarded for every received payload, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum CharacteristicUpdate<T> {
    /// The payload decoded into a new value.
    Value(T),
    /// The payload could not be decoded.
    Corrupted(HrpError),
}

/// Result of a successful [`NotificationCharacteristic::setup`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Notifications are enabled.
    Subscribed,
    /// The configuration write did not reach the device; the caller should wait for
    /// the device to reappear and call [`NotificationCharacteristic::enable_notifications`].
    AwaitingPresence,
}

/// Manages the notification subscription of one characteristic.
///
/// # Type Parameters
/// - `S`: The opened GATT service owning the characteristic
/// - `T`: The decoded value type
pub struct NotificationCharacteristic<S: GattService, T> {
    service: S,
    uuid: Uuid,
    index: usize,
    decoder: Decoder<T>,
    handle: Mutex<Option<S::Characteristic>>,
    last_value: Arc<Mutex<Option<T>>>,
    packets_received: Arc<AtomicU64>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<S: GattService, T> Drop for NotificationCharacteristic<S, T> {
    /// Stops the notification pump if teardown never ran.
    fn drop(&mut self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

impl<S: GattService, T> Debug for NotificationCharacteristic<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Characteristic:{}, Index:{}", self.uuid, self.index)
    }
}

impl<S: GattService, T: Clone + Send + 'static> NotificationCharacteristic<S, T> {
    /// Creates a characteristic wrapper; nothing is requested from the device yet.
    ///
    /// # Arguments
    /// - `service`: The service the characteristic belongs to.
    /// - `uuid`: The characteristic UUID.
    /// - `index`: Which of the characteristics sharing `uuid` to bind, in enumeration order.
    /// - `decoder`: Payload decoder.
    pub fn new(service: S, uuid: Uuid, index: usize, decoder: Decoder<T>) -> Self {
        Self {
            service,
            uuid,
            index,
            decoder,
            handle: Mutex::new(None),
            last_value: Arc::new(Mutex::new(None)),
            packets_received: Arc::new(AtomicU64::new(0)),
            pump: Mutex::new(None),
        }
    }

    /// Resolves the characteristic and negotiates notifications.
    ///
    /// Decoded payloads are forwarded to `updates` until teardown.
    ///
    /// # Errors
    /// [`HrpError::CharacteristicNotFound`] when the index is out of range, any platform
    /// failure otherwise. An unreachable device is reported as
    /// [`SetupOutcome::AwaitingPresence`], not as an error.
    pub async fn setup(&self, updates: UnboundedSender<CharacteristicUpdate<T>>) -> Result<SetupOutcome> {
        let characteristic = self
            .service
            .characteristics(self.uuid)
            .await?
            .into_iter()
            .nth(self.index)
            .ok_or(HrpError::CharacteristicNotFound {
                uuid: self.uuid,
                index: self.index,
            })?;
        debug!("{:?} resolved to {:?}", self, characteristic);

        if let Err(e) = self.service.require_encryption(&characteristic).await {
            debug!("{:?} continues without encryption: {}", self, e);
        }

        let stream = self.service.value_changes(&characteristic).await?;
        let decoder = self.decoder;
        let last_value = self.last_value.clone();
        let packets = self.packets_received.clone();
        let pump = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(change) = stream.next().await {
                packets.fetch_add(1, Ordering::SeqCst);
                let update = match decoder(&change.value, change.timestamp) {
                    Ok(value) => {
                        if let Ok(mut last) = last_value.lock() {
                            *last = Some(value.clone());
                        }
                        CharacteristicUpdate::Value(value)
                    }
                    Err(e) => {
                        trace!("dropping payload {:02x?}: {}", change.value, e);
                        CharacteristicUpdate::Corrupted(e)
                    }
                };
                if updates.send(update).is_err() {
                    break;
                }
            }
            trace!("notification pump terminated");
        });
        if let Some(old) = self.lock_pump()?.replace(pump) {
            old.abort();
        }
        *self.lock_handle()? = Some(characteristic.clone());

        // Reading is usually served from the platform cache, so check before writing.
        match self.service.read_notification_config(&characteristic).await {
            Ok(NotificationConfig::Notify) => {
                debug!("{:?} already configured for notifications", self);
                return Ok(SetupOutcome::Subscribed);
            }
            Ok(current) => trace!("{:?} configuration is {:?}", self, current),
            Err(e) => trace!("{:?} configuration unreadable: {}", self, e),
        }

        match self
            .service
            .write_notification_config(&characteristic, NotificationConfig::Notify)
            .await?
        {
            WriteStatus::Success => Ok(SetupOutcome::Subscribed),
            WriteStatus::Unreachable => {
                warn!("{:?}: {}", self, HrpError::DeviceUnreachable);
                Ok(SetupOutcome::AwaitingPresence)
            }
        }
    }

    /// Repeats the notification configuration write on an already resolved characteristic.
    pub async fn enable_notifications(&self) -> Result<WriteStatus> {
        let characteristic = self
            .lock_handle()?
            .clone()
            .ok_or_else(|| anyhow!("{:?} is not set up", self))?;
        self.service
            .write_notification_config(&characteristic, NotificationConfig::Notify)
            .await
    }

    /// Stops forwarding payloads and releases the platform subscription. Idempotent.
    pub async fn teardown(&self) {
        if let Some(pump) = self.lock_pump().ok().and_then(|mut p| p.take()) {
            pump.abort();
        }
        let handle = self.lock_handle().ok().and_then(|mut h| h.take());
        if let Some(characteristic) = handle {
            if let Err(e) = self.service.release(&characteristic).await {
                warn!("{:?} could not be released: {}", self, e);
            }
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::SeqCst)
    }

    pub fn last_value(&self) -> Option<T> {
        self.last_value.lock().ok().and_then(|v| v.clone())
    }

    pub fn is_set_up(&self) -> bool {
        self.lock_handle().map(|h| h.is_some()).unwrap_or(false)
    }

    fn lock_handle(&self) -> Result<std::sync::MutexGuard<'_, Option<S::Characteristic>>> {
        self.handle.lock().map_err(|_| anyhow!("characteristic handle poisoned"))
    }

    fn lock_pump(&self) -> Result<std::sync::MutexGuard<'_, Option<JoinHandle<()>>>> {
        self.pump.lock().map_err(|_| anyhow!("notification pump poisoned"))
    }
}
