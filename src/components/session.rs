//! Heart Rate Profile Session
//!
//! Drives one Bluetooth heart rate sensor: subscribes to its measurement characteristic,
//! derives the session statistics and guards the subscription with a watchdog and a
//! presence watcher.
//!
//! States: `Stopped -> Starting -> Running -> Stopped`. Every start and stop bumps the run
//! epoch; background tasks carry the epoch they were spawned for and discard their work
//! once it is stale.
use crate::api::monitor::{HeartRateMonitor, MonitorKind};
use crate::api::platform::{AttributeStack, GattService, WriteStatus};
use crate::components::characteristic::{CharacteristicUpdate, NotificationCharacteristic, SetupOutcome};
use crate::core::constants::{
    EVENT_CHANNEL_CAPACITY, HEARTRATE_MEASUREMENT_UUID, HEARTRATE_SERVICE_UUID, MONITOR_NAME,
    RUN_TIMEOUT_REASON, START_TIMEOUT_REASON,
};
use crate::core::error::HrpError;
use crate::core::events::{ConfigurationChange, MonitorEvent};
use crate::model::config::{SessionConfig, WatchdogConfig};
use crate::model::device::DeviceRef;
use crate::model::heartrate::{decode_heart_rate, HeartRateSample};
use crate::model::statistics::{SessionStatistics, StatisticsTracker};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Instant;

type HeartRateCharacteristic<S> = NotificationCharacteristic<S, HeartRateSample>;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    /// Subscription handshake in flight.
    Starting,
    /// Subscribed, watchdog active.
    Running,
}

/// Which task initiated a stop. That task is detached instead of aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopOrigin {
    Caller,
    Setup,
    Watchdog,
}

/// Resources of one run, released together on stop.
struct RunHandles<S: GattService> {
    characteristic: Option<Arc<HeartRateCharacteristic<S>>>,
    setup: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    processor: Option<JoinHandle<()>>,
    presence: Option<JoinHandle<()>>,
}

impl<S: GattService> Default for RunHandles<S> {
    fn default() -> Self {
        Self {
            characteristic: None,
            setup: None,
            watchdog: None,
            processor: None,
            presence: None,
        }
    }
}

impl<S: GattService> RunHandles<S> {
    fn abort_tasks(&mut self, origin: StopOrigin) {
        let own = |role: StopOrigin, handle: Option<JoinHandle<()>>| {
            if let Some(handle) = handle {
                if role != origin {
                    handle.abort();
                }
            }
        };
        own(StopOrigin::Watchdog, self.watchdog.take());
        own(StopOrigin::Setup, self.setup.take());
        if let Some(presence) = self.presence.take() {
            debug!("Clearing device presence watcher");
            presence.abort();
        }
        if let Some(processor) = self.processor.take() {
            processor.abort();
        }
    }

    async fn release(mut self, origin: StopOrigin) {
        self.abort_tasks(origin);
        if let Some(characteristic) = self.characteristic.take() {
            characteristic.teardown().await;
        }
    }
}

struct SessionInner<S: GattService> {
    state: SessionState,
    epoch: u64,
    disposed: bool,
    device: Option<DeviceRef>,
    config: SessionConfig,
    tracker: StatisticsTracker,
    last_received_at: Instant,
    run: RunHandles<S>,
}

struct Shared<A: AttributeStack> {
    stack: A,
    inner: Mutex<SessionInner<A::Service>>,
    events: Sender<MonitorEvent>,
}

impl<A: AttributeStack> Shared<A> {
    fn lock(&self) -> MutexGuard<'_, SessionInner<A::Service>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: MonitorEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    /// Stops the session if it is still in `epoch` (any epoch for `None`).
    ///
    /// Returns `false` when the session was already stopped or moved on.
    async fn halt(&self, epoch: Option<u64>, origin: StopOrigin) -> bool {
        let run = {
            let mut inner = self.lock();
            if inner.state == SessionState::Stopped || epoch.is_some_and(|e| e != inner.epoch) {
                return false;
            }
            debug!("Stopping HRP ({:?})", origin);
            inner.epoch += 1;
            inner.state = SessionState::Stopped;
            inner.tracker.reset();
            std::mem::take(&mut inner.run)
        };
        run.release(origin).await;
        true
    }

    /// Stops the session and reports `reason` as a timeout.
    async fn fail(&self, epoch: u64, origin: StopOrigin, reason: String) {
        if self.halt(Some(epoch), origin).await {
            warn!("HRP stopped: {}", reason);
            self.publish(MonitorEvent::Timeout(reason));
        }
    }
}

/// Bluetooth Smart Heart Rate Profile session.
///
/// # Type Parameters
/// - `A`: The platform attribute stack the sensor is reached through
pub struct HrpSession<A: AttributeStack> {
    shared: Arc<Shared<A>>,
}

impl<A: AttributeStack> Drop for HrpSession<A> {
    /// Aborts the background tasks of a running session.
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        let mut run = std::mem::take(&mut inner.run);
        run.abort_tasks(StopOrigin::Caller);
    }
}

impl<A: AttributeStack> HrpSession<A> {
    /// Creates a stopped session without a device. `config` is normalized first.
    pub fn new(stack: A, config: SessionConfig) -> Self {
        let config = config.normalized();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = StatisticsTracker::new(config.smoothing_factor);
        Self {
            shared: Arc::new(Shared {
                stack,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Stopped,
                    epoch: 0,
                    disposed: false,
                    device: None,
                    config,
                    tracker,
                    last_received_at: Instant::now(),
                    run: RunHandles::default(),
                }),
                events,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn device(&self) -> Option<DeviceRef> {
        self.shared.lock().device.clone()
    }

    /// Assigns the sensor. Publishes `DeviceChanged` if it differs from the current one.
    ///
    /// # Errors
    /// `InvalidOperation` unless stopped.
    pub fn set_device(&self, device: DeviceRef) -> Result<(), HrpError> {
        {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Stopped {
                return Err(HrpError::invalid_while_active("device"));
            }
            if inner.device.as_ref() == Some(&device) {
                return Ok(());
            }
            inner.device = Some(device.clone());
        }
        info!("HRP device set to {}", device);
        self.shared.publish(MonitorEvent::DeviceChanged(Some(device)));
        Ok(())
    }

    pub fn config(&self) -> SessionConfig {
        self.shared.lock().config.clone()
    }

    pub fn characteristic_index(&self) -> usize {
        self.shared.lock().config.characteristic_index
    }

    pub fn set_characteristic_index(&self, index: usize) -> Result<(), HrpError> {
        self.configure("characteristic index", |inner| {
            if inner.config.characteristic_index == index {
                return None;
            }
            inner.config.characteristic_index = index;
            Some(ConfigurationChange::CharacteristicIndex(index))
        })
    }

    pub fn init_delay(&self) -> Duration {
        self.shared.lock().config.init_delay
    }

    pub fn set_init_delay(&self, delay: Duration) -> Result<(), HrpError> {
        self.configure("init delay", |inner| {
            if inner.config.init_delay == delay {
                return None;
            }
            inner.config.init_delay = delay;
            Some(ConfigurationChange::InitDelay(delay))
        })
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        self.shared.lock().config.watchdog
    }

    #[cfg(test)]
    fn presence_armed(&self) -> bool {
        self.shared.lock().run.presence.is_some()
    }

    /// Applies a stopped-only configuration change.
    fn configure<F>(&self, what: &str, apply: F) -> Result<(), HrpError>
    where
        F: FnOnce(&mut SessionInner<A::Service>) -> Option<ConfigurationChange>,
    {
        let change = {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Stopped {
                return Err(HrpError::invalid_while_active(what));
            }
            apply(&mut inner)
        };
        if let Some(change) = change {
            debug!("HRP configuration changed: {:?}", change);
            self.shared.publish(MonitorEvent::ConfigurationChanged(change));
        }
        Ok(())
    }

    /// Opens the service and subscribes to the measurement characteristic.
    async fn establish(shared: &Arc<Shared<A>>, epoch: u64, device: &DeviceRef, config: &SessionConfig) -> Result<()> {
        if !config.init_delay.is_zero() {
            tokio::time::sleep(config.init_delay).await;
        }

        debug!("Getting GATT service of {} with id {}", device.name, device.id);
        let service = shared.stack.open_service(device, HEARTRATE_SERVICE_UUID).await?;
        let characteristic = Arc::new(NotificationCharacteristic::new(
            service,
            HEARTRATE_MEASUREMENT_UUID,
            config.characteristic_index,
            decode_heart_rate,
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                return Ok(());
            }
            inner.run.characteristic = Some(characteristic.clone());
            inner.run.processor = Some(tokio::spawn(Self::process(shared.clone(), epoch, rx)));
        }

        let outcome = characteristic.setup(tx).await?;

        let current = {
            let mut inner = shared.lock();
            let current = inner.epoch == epoch && inner.state == SessionState::Starting;
            if current {
                inner.state = SessionState::Running;
                if outcome == SetupOutcome::AwaitingPresence {
                    debug!("Starting device presence watcher");
                    inner.run.presence = Some(tokio::spawn(Self::watch_presence(
                        shared.clone(),
                        epoch,
                        device.container_id.clone(),
                        characteristic.clone(),
                    )));
                }
            }
            current
        };

        if current {
            info!("HRP running on {}", device);
        } else {
            debug!("HRP setup completed after stop, discarding");
            characteristic.teardown().await;
        }
        Ok(())
    }

    async fn run_setup(shared: Arc<Shared<A>>, epoch: u64, device: DeviceRef, config: SessionConfig) {
        if let Err(e) = Self::establish(&shared, epoch, &device, &config).await {
            warn!("Error configuring HRP device {}: {:#}", device, e);
            let error = e
                .downcast::<HrpError>()
                .unwrap_or_else(|e| HrpError::SetupException(format!("{:#}", e)));
            shared.fail(epoch, StopOrigin::Setup, error.to_string()).await;
        }
    }

    /// Accepts decoded samples in arrival order.
    async fn process(shared: Arc<Shared<A>>, epoch: u64, mut updates: UnboundedReceiver<CharacteristicUpdate<HeartRateSample>>) {
        while let Some(update) = updates.recv().await {
            let packet = {
                let mut inner = shared.lock();
                if inner.epoch != epoch {
                    break;
                }
                match update {
                    CharacteristicUpdate::Value(sample) => {
                        inner.last_received_at = Instant::now();
                        Some(inner.tracker.accept(sample))
                    }
                    CharacteristicUpdate::Corrupted(e) => {
                        debug!("Corrupted HRP packet: {}", e);
                        inner.tracker.record_corrupted();
                        None
                    }
                }
            };
            if let Some(packet) = packet {
                trace!("Firing PacketProcessed event, packet = {}", packet.sample);
                shared.publish(MonitorEvent::PacketProcessed(packet));
            }
        }
    }

    /// Declares the session dead after a period of silence.
    async fn run_watchdog(shared: Arc<Shared<A>>, epoch: u64, config: WatchdogConfig) {
        let mut interval = tokio::time::interval(config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let expired = {
                let inner = shared.lock();
                if inner.epoch != epoch {
                    return;
                }
                let (timeout, reason) = match inner.state {
                    SessionState::Starting => (config.start_timeout, START_TIMEOUT_REASON),
                    SessionState::Running => (config.run_timeout, RUN_TIMEOUT_REASON),
                    SessionState::Stopped => return,
                };
                (inner.last_received_at.elapsed() > timeout).then_some(reason)
            };
            if let Some(reason) = expired {
                debug!("{}", HrpError::WatchdogTimeout(reason.to_owned()));
                shared.fail(epoch, StopOrigin::Watchdog, reason.to_owned()).await;
                return;
            }
        }
    }

    /// Re-enables notifications once the device container reports connected again.
    async fn watch_presence(
        shared: Arc<Shared<A>>,
        epoch: u64,
        container_id: String,
        characteristic: Arc<HeartRateCharacteristic<A::Service>>,
    ) {
        let mut events = match shared.stack.presence_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Device presence watcher unavailable: {}", e);
                return;
            }
        };
        while let Some(event) = events.next().await {
            trace!("Device connection updated: {:?}", event);
            if event.container_id != container_id || !event.connected {
                continue;
            }
            match characteristic.enable_notifications().await {
                Ok(WriteStatus::Success) => {
                    let mut inner = shared.lock();
                    if inner.epoch == epoch {
                        // Detach our own handle; the watcher is no longer required.
                        inner.run.presence = None;
                    }
                    info!("Notification configuration restored");
                    return;
                }
                Ok(WriteStatus::Unreachable) => debug!("Device still unreachable"),
                Err(e) => warn!("Re-enabling notifications failed: {}", e),
            }
        }
    }
}

#[async_trait]
impl<A: AttributeStack> HeartRateMonitor for HrpSession<A> {
    fn kind(&self) -> MonitorKind {
        MonitorKind::BluetoothHrp
    }

    fn name(&self) -> &str {
        MONITOR_NAME
    }

    async fn start(&self) -> Result<(), HrpError> {
        let mut inner = self.shared.lock();
        if inner.disposed {
            return Err(HrpError::InvalidOperation("monitor is disposed".into()));
        }
        if inner.state != SessionState::Stopped {
            return Ok(());
        }
        let device = inner.device.clone().ok_or(HrpError::NoDevice)?;
        info!("Starting HRP on {}", device);

        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.last_received_at = Instant::now();
        inner.state = SessionState::Starting;
        let config = inner.config.clone();
        inner.run.watchdog = Some(tokio::spawn(Self::run_watchdog(self.shared.clone(), epoch, config.watchdog)));
        inner.run.setup = Some(tokio::spawn(Self::run_setup(self.shared.clone(), epoch, device, config)));
        Ok(())
    }

    async fn stop(&self) {
        self.shared.halt(None, StopOrigin::Caller).await;
    }

    async fn reset(&self) -> Result<(), HrpError> {
        debug!("Resetting HRP");
        self.stop().await;
        self.start().await
    }

    async fn dispose(&self) {
        self.stop().await;
        self.shared.lock().disposed = true;
    }

    fn running(&self) -> bool {
        self.state() != SessionState::Stopped
    }

    fn total_packets(&self) -> u64 {
        self.statistics().total_packets
    }

    fn corrupted_packets(&self) -> u64 {
        self.statistics().corrupted_packets
    }

    fn heart_beats(&self) -> u64 {
        self.statistics().heart_beats
    }

    fn last_packet(&self) -> Option<HeartRateSample> {
        self.shared.lock().tracker.last_sample().cloned()
    }

    fn min_heart_rate(&self) -> Option<u8> {
        self.statistics().min_heart_rate
    }

    fn max_heart_rate(&self) -> Option<u8> {
        self.statistics().max_heart_rate
    }

    fn smoothing_factor(&self) -> usize {
        self.shared.lock().tracker.smoothing_factor()
    }

    fn set_smoothing_factor(&self, factor: usize) -> Result<(), HrpError> {
        self.configure("smoothing factor", |inner| {
            if inner.tracker.smoothing_factor() == factor.max(1) {
                return None;
            }
            inner.tracker.set_smoothing_factor(factor);
            inner.config.smoothing_factor = inner.tracker.smoothing_factor();
            Some(ConfigurationChange::SmoothingFactor(inner.config.smoothing_factor))
        })
    }

    fn smoothed_heart_rate(&self) -> f64 {
        self.statistics().smoothed_heart_rate
    }

    fn statistics(&self) -> SessionStatistics {
        self.shared.lock().tracker.statistics()
    }

    fn subscribe(&self) -> Receiver<MonitorEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::platform::{NotificationConfig, PresenceEvent, ValueChange};
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use time::OffsetDateTime;
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Platform fake whose notifications and presence events are pushed by the test.
    struct FakeState {
        characteristic_count: AtomicUsize,
        write_status: Mutex<WriteStatus>,
        hold_setup: AtomicBool,
        gate: Notify,
        reads: AtomicUsize,
        writes: AtomicUsize,
        releases: AtomicUsize,
        notifications: Mutex<Option<UnboundedSender<ValueChange>>>,
        presence: Mutex<Option<UnboundedSender<PresenceEvent>>>,
    }

    #[derive(Clone)]
    struct FakeStack(Arc<FakeState>);

    impl FakeStack {
        fn new() -> Self {
            Self(Arc::new(FakeState {
                characteristic_count: AtomicUsize::new(1),
                write_status: Mutex::new(WriteStatus::Success),
                hold_setup: AtomicBool::new(false),
                gate: Notify::new(),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                notifications: Mutex::new(None),
                presence: Mutex::new(None),
            }))
        }

        fn notify(&self, value: &[u8]) {
            let sender = self.0.notifications.lock().unwrap();
            sender
                .as_ref()
                .expect("not subscribed")
                .unbounded_send(ValueChange {
                    value: value.to_vec(),
                    timestamp: OffsetDateTime::UNIX_EPOCH,
                })
                .unwrap();
        }

        fn presence(&self, container_id: &str, connected: bool) {
            let sender = self.0.presence.lock().unwrap();
            sender
                .as_ref()
                .expect("no presence watcher")
                .unbounded_send(PresenceEvent {
                    container_id: container_id.into(),
                    connected,
                })
                .unwrap();
        }

        fn writes(&self) -> usize {
            self.0.writes.load(Ordering::SeqCst)
        }
    }

    struct FakeService(Arc<FakeState>);

    #[async_trait]
    impl GattService for FakeService {
        type Characteristic = u8;

        async fn characteristics(&self, _uuid: Uuid) -> Result<Vec<u8>> {
            Ok((0..self.0.characteristic_count.load(Ordering::SeqCst) as u8).collect())
        }

        async fn require_encryption(&self, _characteristic: &u8) -> Result<()> {
            Ok(())
        }

        async fn read_notification_config(&self, _characteristic: &u8) -> Result<NotificationConfig> {
            self.0.reads.fetch_add(1, Ordering::SeqCst);
            if self.0.hold_setup.load(Ordering::SeqCst) {
                self.0.gate.notified().await;
            }
            Ok(NotificationConfig::None)
        }

        async fn write_notification_config(&self, _characteristic: &u8, _config: NotificationConfig) -> Result<WriteStatus> {
            self.0.writes.fetch_add(1, Ordering::SeqCst);
            Ok(*self.0.write_status.lock().unwrap())
        }

        async fn value_changes(&self, _characteristic: &u8) -> Result<BoxStream<'static, ValueChange>> {
            let (tx, rx) = unbounded();
            *self.0.notifications.lock().unwrap() = Some(tx);
            Ok(rx.boxed())
        }

        async fn release(&self, _characteristic: &u8) -> Result<()> {
            self.0.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl AttributeStack for FakeStack {
        type Service = FakeService;

        async fn open_service(&self, _device: &DeviceRef, _service_uuid: Uuid) -> Result<FakeService> {
            Ok(FakeService(self.0.clone()))
        }

        async fn presence_events(&self) -> Result<BoxStream<'static, PresenceEvent>> {
            let (tx, rx) = unbounded();
            *self.0.presence.lock().unwrap() = Some(tx);
            Ok(rx.boxed())
        }
    }

    fn device() -> DeviceRef {
        DeviceRef::new("dev-1", "Strap", "container-1")
    }

    fn session(stack: &FakeStack, smoothing_factor: usize) -> HrpSession<FakeStack> {
        let config = SessionConfig {
            init_delay: Duration::ZERO,
            smoothing_factor,
            ..Default::default()
        };
        let session = HrpSession::new(stack.clone(), config);
        session.set_device(device()).unwrap();
        session
    }

    /// Lets background tasks run until `cond` holds.
    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_packet(rx: &mut Receiver<MonitorEvent>) -> crate::model::statistics::ProcessedPacket {
        loop {
            match rx.recv().await.unwrap() {
                MonitorEvent::PacketProcessed(packet) => return packet,
                _ => continue,
            }
        }
    }

    async fn next_timeout(rx: &mut Receiver<MonitorEvent>) -> String {
        loop {
            match rx.recv().await.unwrap() {
                MonitorEvent::Timeout(reason) => return reason,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_reaches_running() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        assert!(!session.running());
        session.start().await.unwrap();
        assert!(session.running());
        wait_until(|| session.state() == SessionState::Running).await;
        assert_eq!(stack.writes(), 1);
        assert!(!session.presence_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_device() {
        let session = HrpSession::new(FakeStack::new(), SessionConfig::default());
        assert_eq!(session.start().await, Err(HrpError::NoDevice));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_update_statistics() {
        let stack = FakeStack::new();
        let session = session(&stack, 3);
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;

        for hr in [60, 70, 80] {
            stack.notify(&[0x00, hr]);
        }
        let packets = [
            next_packet(&mut rx).await,
            next_packet(&mut rx).await,
            next_packet(&mut rx).await,
        ];
        let smoothed: Vec<f64> = packets.iter().map(|p| p.statistics.smoothed_heart_rate).collect();
        assert_eq!(smoothed, vec![60.0, 65.0, 70.0]);
        let beats: Vec<u64> = packets.iter().map(|p| p.statistics.heart_beats).collect();
        assert_eq!(beats, vec![0, 1, 2]);

        assert_eq!(session.total_packets(), 3);
        assert_eq!(session.heart_beats(), 2);
        assert_eq!(session.min_heart_rate(), Some(60));
        assert_eq!(session.max_heart_rate(), Some(80));
        assert_eq!(session.smoothed_heart_rate(), 70.0);
        assert_eq!(session.last_packet().unwrap().heart_rate, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_packets_are_counted_only() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;

        stack.notify(&[0x01, 0x48]);
        wait_until(|| session.corrupted_packets() == 1).await;
        assert_eq!(session.total_packets(), 0);
        assert_eq!(session.min_heart_rate(), None);
        assert!(session.last_packet().is_none());

        stack.notify(&[0x00, 72]);
        assert_eq!(next_packet(&mut rx).await.statistics.corrupted_packets, 1);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_zeroes_statistics() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;
        stack.notify(&[0x00, 72]);
        next_packet(&mut rx).await;

        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.statistics(), SessionStatistics::default());
        assert_eq!(stack.0.releases.load(Ordering::SeqCst), 1);

        // Second stop is a no-op.
        session.stop().await;
        assert_eq!(stack.0.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_starting_discards_setup() {
        let stack = FakeStack::new();
        stack.0.hold_setup.store(true, Ordering::SeqCst);
        let session = session(&stack, 1);
        session.start().await.unwrap();
        wait_until(|| stack.0.reads.load(Ordering::SeqCst) == 1).await;
        assert_eq!(session.state(), SessionState::Starting);

        session.stop().await;
        assert_eq!(session.statistics(), SessionStatistics::default());
        stack.0.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!session.running());
        assert_eq!(stack.writes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout() {
        let stack = FakeStack::new();
        stack.0.hold_setup.store(true, Ordering::SeqCst);
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();

        assert_eq!(next_timeout(&mut rx).await, "start timeout");
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_communication_timeout() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;
        stack.notify(&[0x00, 72]);
        next_packet(&mut rx).await;

        let started = Instant::now();
        assert_eq!(next_timeout(&mut rx).await, "communication timeout");
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.total_packets(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_keep_watchdog_quiet() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;
        for _ in 0..12 {
            stack.notify(&[0x00, 72]);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.total_packets(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_fails_start() {
        let stack = FakeStack::new();
        stack.0.characteristic_count.store(0, Ordering::SeqCst);
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();

        let reason = next_timeout(&mut rx).await;
        assert!(reason.contains("not found"), "{}", reason);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_locked_while_running() {
        let stack = FakeStack::new();
        let session = session(&stack, 2);
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;

        assert!(matches!(session.set_smoothing_factor(5), Err(HrpError::InvalidOperation(_))));
        assert!(matches!(session.set_characteristic_index(1), Err(HrpError::InvalidOperation(_))));
        assert!(matches!(session.set_init_delay(Duration::from_secs(1)), Err(HrpError::InvalidOperation(_))));
        assert!(matches!(session.set_device(DeviceRef::new("x", "x", "x")), Err(HrpError::InvalidOperation(_))));
        assert_eq!(session.smoothing_factor(), 2);

        // The window still averages over two slots.
        let mut rx = session.subscribe();
        for hr in [60, 70, 80] {
            stack.notify(&[0x00, hr]);
        }
        let smoothed = [
            next_packet(&mut rx).await.statistics.smoothed_heart_rate,
            next_packet(&mut rx).await.statistics.smoothed_heart_rate,
            next_packet(&mut rx).await.statistics.smoothed_heart_rate,
        ];
        assert_eq!(smoothed, [60.0, 65.0, 75.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_tick_still_times_out() {
        let stack = FakeStack::new();
        stack.0.hold_setup.store(true, Ordering::SeqCst);
        let config: SessionConfig =
            serde_json::from_str(r#"{ "init_delay": 0, "watchdog": { "tick": 0 } }"#).unwrap();
        let session = HrpSession::new(stack.clone(), config);
        session.set_device(device()).unwrap();
        let mut rx = session.subscribe();
        session.start().await.unwrap();

        assert_eq!(next_timeout(&mut rx).await, "start timeout");
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.watchdog().tick, crate::core::constants::MIN_WATCHDOG_TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_smoothing_factor_is_normalized() {
        let stack = FakeStack::new();
        let session = session(&stack, 0);
        assert_eq!(session.config().smoothing_factor, 1);
        assert_eq!(session.smoothing_factor(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configuration_changes_while_stopped() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        let mut rx = session.subscribe();

        session.set_smoothing_factor(4).unwrap();
        session.set_smoothing_factor(4).unwrap();
        session.set_characteristic_index(1).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            MonitorEvent::ConfigurationChanged(ConfigurationChange::SmoothingFactor(4))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            MonitorEvent::ConfigurationChanged(ConfigurationChange::CharacteristicIndex(1))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(session.smoothing_factor(), 4);
        assert_eq!(session.characteristic_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_changed_only_on_new_device() {
        let session = HrpSession::new(FakeStack::new(), SessionConfig::default());
        let mut rx = session.subscribe();
        session.set_device(device()).unwrap();
        session.set_device(device()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), MonitorEvent::DeviceChanged(Some(device())));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.device(), Some(device()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_watcher_restores_notifications() {
        let stack = FakeStack::new();
        *stack.0.write_status.lock().unwrap() = WriteStatus::Unreachable;
        let session = session(&stack, 1);
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;
        wait_until(|| stack.0.presence.lock().unwrap().is_some()).await;
        assert!(session.presence_armed());
        assert_eq!(stack.writes(), 1);

        stack.presence("other-container", true);
        stack.presence("container-1", false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stack.writes(), 1);

        *stack.0.write_status.lock().unwrap() = WriteStatus::Success;
        stack.presence("container-1", true);
        wait_until(|| !session.presence_armed()).await;
        assert_eq!(stack.writes(), 2);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restarts_with_fresh_statistics() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        let mut rx = session.subscribe();
        session.start().await.unwrap();
        wait_until(|| session.state() == SessionState::Running).await;
        stack.notify(&[0x00, 72]);
        next_packet(&mut rx).await;

        session.reset().await.unwrap();
        assert_eq!(session.total_packets(), 0);
        wait_until(|| session.state() == SessionState::Running).await;
        stack.notify(&[0x00, 64]);
        let packet = next_packet(&mut rx).await;
        assert_eq!(packet.statistics.total_packets, 1);
        assert_eq!(packet.statistics.heart_beats, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let stack = FakeStack::new();
        let session = session(&stack, 1);
        session.start().await.unwrap();
        session.dispose().await;
        session.dispose().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start().await, Err(HrpError::InvalidOperation(_))));
    }
}
