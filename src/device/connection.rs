use std::time::Duration;
use btleplug::api::BDAddr;
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::types::ConnectionConfig;
use crate::device::codec::{encode_frames, encode_services, Request};
use crate::device::types::ConnectionState;
use crate::error::{DeviceError, TransportError};
use crate::transport::{Link, Radio};

/// A request on its way to the connection task. Answered exactly once, together with the
/// position of the request in the order the device executed them.
struct Command {
    request: Request,
    deadline: Duration,
    reply: oneshot::Sender<Result<(u64, Vec<u8>), DeviceError>>,
}

/// The delay before connect attempt `attempt` (0 based): nothing before the first attempt,
/// then `base`, `2 * base`, `4 * base`, ...
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    base.saturating_mul(1u32 << (attempt - 1).min(16))
}

/// Handle to the task that owns the single connection to one lighthouse.
/// Commands sent through clones of this handle are executed one at a time, in order.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    pub fn spawn(
        address: BDAddr,
        radio: Radio,
        settings: ConnectionConfig,
        cancel: CancellationToken,
    ) -> (ConnectionManager, JoinHandle<()>) {
        let (commands, receiver) = channel::<Command>(1);
        let (state_sender, state) = watch::channel(ConnectionState::Disconnected);

        let worker = Worker {
            address,
            radio,
            settings,
            link: None,
            last_used: Instant::now(),
            executed: 0,
            state: state_sender,
        };
        let handle = spawn(worker.run(receiver, cancel));

        (ConnectionManager { commands, state }, handle)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Runs `request` on the device, connecting first if needed. Waits behind any command
    /// that is already queued for this device.
    pub async fn dispatch(&self, request: Request, deadline: Duration) -> Result<Vec<u8>, DeviceError> {
        self.dispatch_ordered(request, deadline).await.map(|(_, bytes)| bytes)
    }

    /// Like [`ConnectionManager::dispatch`], also returning a sequence number that grows with
    /// every command the device executes. A response with a higher number reflects a later
    /// device state.
    pub async fn dispatch_ordered(&self, request: Request, deadline: Duration) -> Result<(u64, Vec<u8>), DeviceError> {
        let (reply, response) = oneshot::channel();
        let mut commands = self.commands.clone();

        commands
            .send(Command { request, deadline, reply })
            .await
            .map_err(|_| DeviceError::Cancelled)?;

        response.await.map_err(|_| DeviceError::Cancelled)?
    }
}

/// How a failed request is handled by the retry-once policy.
enum Failure {
    Transient(DeviceError),
    Fatal(DeviceError),
}

fn classify(address: BDAddr, err: DeviceError) -> Failure {
    match err {
        DeviceError::Transport { source } if source.is_transient() => {
            debug!("Link to {} failed: {}", address, source);
            Failure::Transient(DeviceError::LinkLost { address })
        },
        other => Failure::Fatal(other),
    }
}

async fn perform(link: &dyn Link, request: &Request) -> Result<Vec<u8>, DeviceError> {
    match request {
        Request::Write { characteristic, payload, with_response } => {
            link.write(*characteristic, payload, *with_response).await?;
            Ok(Vec::new())
        },
        Request::Read(plan) => {
            let mut values = Vec::with_capacity(plan.len());
            for read in plan {
                match link.read(read.characteristic).await {
                    Ok(value) => values.push(value),
                    Err(TransportError::MissingCharacteristic { .. }) if read.optional => {
                        debug!("{} has no {} characteristic", link.address(), read.characteristic);
                        values.push(Vec::new());
                    },
                    Err(err) => return Err(err.into()),
                }
            }
            encode_frames(&values)
        },
        Request::Services => Ok(encode_services(&link.services())),
    }
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

struct Worker {
    address: BDAddr,
    radio: Radio,
    settings: ConnectionConfig,
    link: Option<Box<dyn Link>>,
    last_used: Instant,
    executed: u64,
    state: watch::Sender<ConnectionState>,
}

impl Worker {
    async fn run(mut self, mut commands: Receiver<Command>, cancel: CancellationToken) {
        'mainloop: loop {
            let idle_deadline = self.link.as_ref().map(|_| self.last_used + self.settings.idle_disconnect);

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = idle_expired(idle_deadline) => {
                    info!("Releasing idle connection to {}", self.address);
                    self.disconnect(ConnectionState::Disconnected).await;
                },
                command = commands.next() => {
                    let Some(command) = command else {
                        break 'mainloop;
                    };

                    self.executed += 1;
                    let sequence = self.executed;

                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
                        result = self.execute(&command.request, command.deadline) => result,
                    };
                    self.last_used = Instant::now();
                    let result = result.map(|bytes| (sequence, bytes));

                    // the caller may have given up waiting, that is fine
                    let _ = command.reply.send(result);
                },
            }
        }

        commands.close();
        while let Ok(Some(command)) = commands.try_next() {
            let _ = command.reply.send(Err(DeviceError::Cancelled));
        }

        self.disconnect(ConnectionState::Disconnected).await;
        debug!("Connection task for {} stopped", self.address);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {:?} -> {:?}", self.address, previous, state);
        }
    }

    async fn execute(&mut self, request: &Request, deadline: Duration) -> Result<Vec<u8>, DeviceError> {
        self.ensure_connected().await?;

        match self.run_request(request, deadline).await {
            Ok(bytes) => return Ok(bytes),
            Err(Failure::Fatal(err)) => return Err(err),
            Err(Failure::Transient(err)) => {
                debug!("Command to {} failed ({}), reconnecting to retry once", self.address, err);
                self.disconnect(ConnectionState::Retrying).await;
            },
        }

        self.ensure_connected().await?;

        match self.run_request(request, deadline).await {
            Ok(bytes) => Ok(bytes),
            Err(Failure::Fatal(err)) => Err(err),
            Err(Failure::Transient(err)) => {
                warn!("Command to {} failed twice: {}", self.address, err);
                self.disconnect(ConnectionState::Disconnected).await;
                Err(err)
            },
        }
    }

    async fn run_request(&self, request: &Request, deadline: Duration) -> Result<Vec<u8>, Failure> {
        let Some(link) = self.link.as_ref() else {
            return Err(Failure::Transient(DeviceError::LinkLost { address: self.address }));
        };

        match timeout(deadline, perform(link.as_ref(), request)).await {
            Err(_) => Err(Failure::Transient(DeviceError::CommandTimeout { address: self.address, timeout: deadline })),
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(err)) => Err(classify(self.address, err)),
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), DeviceError> {
        if self.link.is_some() {
            return Ok(());
        }

        let attempts = self.settings.retry_count.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                self.set_state(ConnectionState::Retrying);
                let delay = backoff_delay(self.settings.backoff_base, attempt);
                debug!("Waiting {:?} before connect attempt {}/{} to {}", delay, attempt + 1, attempts, self.address);
                sleep(delay).await;
            }

            self.set_state(ConnectionState::Connecting);
            match self.radio.connect(self.address, self.settings.connection_timeout).await {
                Ok(link) => {
                    info!("Connected to {}", self.address);
                    self.link = Some(link);
                    self.last_used = Instant::now();
                    self.set_state(ConnectionState::Connected);
                    return Ok(());
                },
                Err(TransportError::Unavailable) => {
                    self.set_state(ConnectionState::Failed);
                    return Err(DeviceError::TransportUnavailable);
                },
                Err(err) => {
                    debug!("Connect attempt {}/{} to {} failed: {}", attempt + 1, attempts, self.address, err);
                },
            }
        }

        warn!("Giving up on {} after {} connect attempts. Check if it is powered and in range.", self.address, attempts);
        self.set_state(ConnectionState::Failed);
        Err(DeviceError::ConnectionFailed { address: self.address, attempts })
    }

    async fn disconnect(&mut self, next: ConnectionState) {
        if let Some(link) = self.link.take() {
            match timeout(self.settings.command_timeout, link.disconnect()).await {
                Err(_) => warn!("Disconnecting from {} took too long", self.address),
                Ok(Err(err)) => debug!("Error disconnecting from {}: {}", self.address, err),
                Ok(Ok(())) => debug!("Disconnected from {}", self.address),
            }
        }

        if *self.state.borrow() != ConnectionState::Failed || next != ConnectionState::Disconnected {
            self.set_state(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;
    use crate::device::codec::{FrameReader, PlannedRead};
    use crate::device::constants::{FIRMWARE_CHARACTERISTIC, V2_CHANNEL_CHARACTERISTIC, V2_PWR_CHARACTERISTIC};
    use crate::transport::fake::{FakeEvent, FakeLighthouse, FakeTransport};

    fn addr() -> BDAddr {
        BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01])
    }

    fn settings() -> ConnectionConfig {
        ConnectionConfig {
            connection_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
            retry_count: 3,
            backoff_base: Duration::from_millis(500),
            idle_disconnect: Duration::from_secs(20),
            max_concurrent_connects: 1,
        }
    }

    fn start(fake: &FakeTransport, settings: ConnectionConfig) -> (ConnectionManager, CancellationToken) {
        let radio = Radio::new(Arc::new(fake.clone()), settings.max_concurrent_connects);
        let cancel = CancellationToken::new();
        let (manager, _handle) = ConnectionManager::spawn(addr(), radio, settings, cancel.clone());
        (manager, cancel)
    }

    fn power_read() -> Request {
        Request::Read(vec![PlannedRead::required(V2_PWR_CHARACTERISTIC)])
    }

    fn power_write(code: u8) -> Request {
        Request::Write { characteristic: V2_PWR_CHARACTERISTIC, payload: vec![code], with_response: true }
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::ZERO);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_first_dispatch() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        let (manager, _cancel) = start(&fake, settings());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let raw = manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();

        let mut reader = FrameReader::new(&raw);
        assert_eq!(reader.next_frame().unwrap(), &[0x00]);
        reader.finish().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(fake.connect_attempts(addr()), 1);

        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.fail_next_connects(addr(), 2);
        let (manager, _cancel) = start(&fake, settings());

        let started = Instant::now();
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();

        assert_eq!(fake.connect_attempts(addr()), 3);
        assert!(started.elapsed() >= Duration::from_millis(500 + 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.fail_next_connects(addr(), 10);
        let (manager, _cancel) = start(&fake, settings());

        let result = manager.dispatch(power_read(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed { attempts: 3, .. })));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(fake.connect_attempts(addr()), 3);

        // nothing happens on its own
        sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.connect_attempts(addr()), 3);

        // failed is not sticky
        fake.fail_next_connects(addr(), 0);
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 4);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_is_bounded_by_connection_timeout() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.stall_next_connects(addr(), 1);
        let (manager, _cancel) = start(&fake, settings());

        let started = Instant::now();
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 2);
        assert!(started.elapsed() >= Duration::from_millis(2000 + 500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_discovery_does_not_keep_the_device() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.stall_next_discoveries(addr(), 1);
        let (manager, _cancel) = start(&fake, settings());

        // the device only takes one client, the second attempt fails if the first one is
        // still holding it
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 2);
        assert!(fake.events().contains(&FakeEvent::Disconnected { address: addr() }));
        assert!(fake.is_connected(addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_discovery_on_last_attempt_leaves_device_free() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.stall_next_discoveries(addr(), 3);
        let (manager, _cancel) = start(&fake, settings());

        let result = manager.dispatch(power_read(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::ConnectionFailed { attempts: 3, .. })));
        assert!(!fake.is_connected(addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_follows_execution_order() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.set_operation_delay(addr(), Duration::from_millis(300));
        let (manager, _cancel) = start(&fake, settings());

        let (first, second) = tokio::join!(
            manager.dispatch_ordered(power_read(), Duration::from_secs(1)),
            manager.dispatch_ordered(power_write(0x01), Duration::from_secs(1)),
        );
        let (first, _) = first.unwrap();
        let (second, _) = second.unwrap();
        assert!(second > first);

        let (third, _) = manager.dispatch_ordered(power_read(), Duration::from_secs(1)).await.unwrap();
        assert!(third > second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_once() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        let (manager, _cancel) = start(&fake, settings());
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();

        // a single hiccup is absorbed by reconnecting
        fake.stall_next_operations(addr(), 1);
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 2);

        // a persistent problem is reported
        fake.stall_next_operations(addr(), 2);
        let result = manager.dispatch(power_read(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::CommandTimeout { .. })));
        assert_eq!(fake.connect_attempts(addr()), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!fake.is_connected(addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_reconnects() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        let (manager, _cancel) = start(&fake, settings());
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();

        fake.drop_link(addr());
        manager.dispatch(power_write(0x01), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 2);
        assert_eq!(fake.characteristic(addr(), V2_PWR_CHARACTERISTIC), Some(vec![0x0B]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_characteristic_is_not_retried() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234").without_characteristic(V2_CHANNEL_CHARACTERISTIC));
        let (manager, _cancel) = start(&fake, settings());

        let required = Request::Read(vec![PlannedRead::required(V2_CHANNEL_CHARACTERISTIC)]);
        let result = manager.dispatch(required, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(DeviceError::Transport { source: TransportError::MissingCharacteristic { .. } })
        ));
        assert_eq!(fake.connect_attempts(addr()), 1);

        let optional = Request::Read(vec![
            PlannedRead::optional(V2_CHANNEL_CHARACTERISTIC),
            PlannedRead::optional(FIRMWARE_CHARACTERISTIC),
        ]);
        let raw = manager.dispatch(optional, Duration::from_secs(1)).await.unwrap();
        let mut reader = FrameReader::new(&raw);
        assert!(reader.next_frame().unwrap().is_empty());
        assert_eq!(reader.next_frame().unwrap(), b"1.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnect() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        let (manager, _cancel) = start(&fake, settings());
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert!(fake.is_connected(addr()));

        sleep(Duration::from_secs(19)).await;
        assert!(fake.is_connected(addr()));

        sleep(Duration::from_secs(2)).await;
        assert!(!fake.is_connected(addr()));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // reopened on demand
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fake.connect_attempts(addr()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_are_serialized() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.set_operation_delay(addr(), Duration::from_millis(300));
        let (manager, _cancel) = start(&fake, settings());

        let first = manager.clone();
        let second = manager.clone();
        let (a, b) = tokio::join!(
            first.dispatch(power_write(0x01), Duration::from_secs(1)),
            second.dispatch(power_write(0x02), Duration::from_secs(1)),
        );
        a.unwrap();
        b.unwrap();

        let writes: Vec<FakeEvent> = fake
            .events()
            .into_iter()
            .filter(|event| matches!(event, FakeEvent::WriteStarted { .. } | FakeEvent::WriteFinished { .. }))
            .collect();
        assert_eq!(writes.len(), 4);
        assert!(matches!(writes[0], FakeEvent::WriteStarted { .. }));
        assert!(matches!(writes[1], FakeEvent::WriteFinished { .. }));
        assert!(matches!(writes[2], FakeEvent::WriteStarted { .. }));
        assert!(matches!(writes[3], FakeEvent::WriteFinished { .. }));
        assert_eq!(fake.connect_attempts(addr()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_missing() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        fake.set_radio(false);
        let (manager, _cancel) = start(&fake, settings());

        let result = manager.dispatch(power_read(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::TransportUnavailable)));
        assert_eq!(fake.connect_attempts(addr()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_and_releases_link() {
        let fake = FakeTransport::new();
        fake.add(FakeLighthouse::v2(addr(), "LHB-1234"));
        let (manager, cancel) = start(&fake, settings());
        manager.dispatch(power_read(), Duration::from_secs(1)).await.unwrap();

        fake.stall_next_operations(addr(), 1);
        let pending = {
            let manager = manager.clone();
            spawn(async move { manager.dispatch(power_read(), Duration::from_secs(30)).await })
        };
        sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DeviceError::Cancelled)));
        sleep(Duration::from_millis(10)).await;
        assert!(!fake.is_connected(addr()));

        let result = manager.dispatch(power_read(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::Cancelled)));
    }
}
