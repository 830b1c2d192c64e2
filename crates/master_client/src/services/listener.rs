//! Background receiver for server-pushed invalidations.
//!
//! The listener holds one dedicated session in LISTEN_CACHES mode and
//! rebroadcasts each push to subscribers. It starts on the first subscription,
//! stops after an idle period with no subscribers, and reconnects with an
//! exponential backoff after any failure.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::MasterError;
use crate::models::{ListenerStatus, MasterConfig, TableId};
use crate::protocol::{Command, Status, WireReader, WireWriter};
use crate::services::connector::InvalidationReceiver;
use crate::services::pool::{Session, SessionPool};

/// Capacity of the push channel; slower subscribers see `Lagged`.
const CHANNEL_CAPACITY: usize = 256;

/// Timing of the listener loop.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    /// Stop after this long with no subscribers.
    pub idle: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Longest reconnect delay.
    pub backoff_max: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

impl ListenerSettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self { idle: config.listener_idle(), ..Self::default() }
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    fn idle_check_interval(&self) -> Duration {
        (self.idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}

struct RunState {
    running: bool,
    stop: CancellationToken,
}

struct Shared {
    pool: Arc<SessionPool>,
    sender: broadcast::Sender<Vec<TableId>>,
    status: RwLock<ListenerStatus>,
    run: Mutex<RunState>,
    settings: ListenerSettings,
}

impl Shared {
    fn set_status(&self, status: ListenerStatus) {
        *self.status.write() = status;
    }

    /// Mark the loop as exited. A later subscribe starts a new one.
    fn mark_stopped(&self) {
        let mut run = self.run.lock();
        run.running = false;
        self.set_status(ListenerStatus::Stopped);
    }

    /// Decide, under the run lock, whether the loop may stop.
    fn try_stop_idle(&self) -> bool {
        let mut run = self.run.lock();
        if self.sender.receiver_count() == 0 {
            run.running = false;
            self.set_status(ListenerStatus::Stopped);
            true
        } else {
            false
        }
    }
}

/// Owns the invalidation loop for one transport.
pub struct InvalidationListener {
    shared: Arc<Shared>,
}

impl InvalidationListener {
    pub fn new(pool: Arc<SessionPool>, settings: ListenerSettings) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                pool,
                sender,
                status: RwLock::new(ListenerStatus::Stopped),
                run: Mutex::new(RunState { running: false, stop: CancellationToken::new() }),
                settings,
            }),
        }
    }

    /// Receive pushes, starting the loop if it is not running.
    pub fn subscribe(&self) -> InvalidationReceiver {
        let receiver = self.shared.sender.subscribe();

        let mut run = self.shared.run.lock();
        if !run.running && !run.stop.is_cancelled() {
            run.running = true;
            let shared = self.shared.clone();
            let stop = run.stop.clone();
            tokio::spawn(async move { run_loop(shared, stop).await });
            tracing::debug!("Invalidation listener started");
        }
        receiver
    }

    pub fn status(&self) -> ListenerStatus {
        self.shared.status.read().clone()
    }

    /// Number of live subscribers.
    pub fn subscribers(&self) -> usize {
        self.shared.sender.receiver_count()
    }

    /// Stop the loop for good.
    pub fn shutdown(&self) {
        self.shared.run.lock().stop.cancel();
    }
}

enum Exit {
    Idle,
    Stopped,
}

async fn run_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let mut failures = 0u32;

    loop {
        shared.set_status(ListenerStatus::Connecting);
        let outcome = tokio::select! {
            _ = stop.cancelled() => Ok(Exit::Stopped),
            outcome = listen(&shared, &mut failures) => outcome,
        };

        match outcome {
            Ok(Exit::Idle) => {
                tracing::debug!("Invalidation listener idle, stopping");
                break;
            }
            Ok(Exit::Stopped) => {
                shared.mark_stopped();
                break;
            }
            Err(e) => {
                failures += 1;
                let delay = shared.settings.backoff(failures);
                tracing::warn!(
                    error = %e,
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Invalidation listener failed, backing off"
                );
                shared.set_status(ListenerStatus::Backoff { message: e.to_string(), failures });

                tokio::select! {
                    _ = stop.cancelled() => {
                        shared.mark_stopped();
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if shared.try_stop_idle() {
                    break;
                }
            }
        }
    }
}

/// Run one listening session until it fails or the listener goes idle.
async fn listen(shared: &Shared, failures: &mut u32) -> Result<Exit, MasterError> {
    let mut session = shared.pool.open_dedicated().await?;
    start_listening(&mut session).await?;

    *failures = 0;
    shared.set_status(ListenerStatus::Listening);
    tracing::info!(session_id = %session.id(), "Listening for invalidations");

    let mut idle_since: Option<Instant> = None;
    let mut tick = tokio::time::interval(shared.settings.idle_check_interval());

    loop {
        tokio::select! {
            frame = session.recv() => {
                let frame = frame?;
                let tables = parse_push(&frame)?;
                if !tables.is_empty() {
                    tracing::debug!(tables = ?tables, "Invalidation push received");
                    // No subscribers is not an error; the idle check handles it.
                    let _ = shared.sender.send(tables);
                }
                let mut ack = WireWriter::with_capacity(1);
                ack.write_u8(Status::Done.to_byte());
                session.send(ack.freeze()).await?;
            }
            _ = tick.tick() => {
                if shared.sender.receiver_count() > 0 {
                    idle_since = None;
                    continue;
                }
                let since = *idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= shared.settings.idle && shared.try_stop_idle() {
                    return Ok(Exit::Idle);
                }
            }
        }
    }
}

async fn start_listening(session: &mut Session) -> Result<(), MasterError> {
    let mut request = WireWriter::new();
    request.write_varint(Command::ListenCaches.ordinal());
    session.send(request.freeze()).await?;

    let frame = session.recv().await?;
    let mut reply = WireReader::new(&frame);
    match Status::from_byte(reply.read_u8()?)? {
        Status::Done => reply.finish(),
        Status::Error => {
            let code = reply.read_u32()?;
            let message = reply.read_utf()?;
            Err(MasterError::protocol(code, message, Command::ListenCaches, None))
        }
        Status::Next => Err(MasterError::decode("unexpected NEXT in LISTEN_CACHES reply")),
    }
}

/// Read `[count][ordinal]*`, skipping ordinals this client does not know.
fn parse_push(frame: &[u8]) -> Result<Vec<TableId>, MasterError> {
    let mut reader = WireReader::new(frame);
    let count = reader.read_varint()?;
    let mut tables = Vec::with_capacity(count.min(TableId::COUNT as u64) as usize);
    for _ in 0..count {
        let ordinal = reader.read_varint()?;
        match usize::try_from(ordinal).ok().and_then(TableId::from_ordinal) {
            Some(table) => {
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
            None => tracing::debug!(ordinal, "Ignoring invalidation of unknown table"),
        }
    }
    reader.finish()?;
    Ok(tables)
}
