//! Pooled, authenticated sessions to one master endpoint.
//!
//! Provides:
//! - Session establishment with optional source address and TLS
//! - The versioned handshake
//! - A bounded deadpool pool with age-based retirement
//! - Pool status reporting

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use deadpool::managed::{self, Metrics, Object, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use uuid::Uuid;

use crate::error::MasterError;
use crate::models::{CallContext, Credentials, MasterConfig, PoolStatus};
use crate::protocol::{Command, ProtocolVersion, Status, WireReader, WireWriter};

const QUIT_TIMEOUT: Duration = Duration::from_secs(1);

trait SessionIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SessionIo for T {}

/// Everything needed to open a session.
#[derive(Clone)]
pub struct SessionSettings {
    pub host: String,
    pub port: u16,
    pub local_ip: Option<std::net::IpAddr>,
    pub tls: Option<tokio_native_tls::TlsConnector>,
    pub credentials: Credentials,
    pub max_frame_length: usize,
    pub max_age: Duration,
    pub connect_timeout: Duration,
}

impl SessionSettings {
    /// Derive settings from a validated configuration.
    ///
    /// Reads the CA certificate, so a bad TLS setup fails here rather than on
    /// the first connection.
    pub fn from_config(config: &MasterConfig) -> Result<Self, MasterError> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            local_ip: config.local_ip,
            tls: build_tls(config)?,
            credentials: config.credentials.clone(),
            max_frame_length: config.max_frame_length,
            max_age: config.max_connection_age(),
            connect_timeout: config.connect_timeout(),
        })
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("local_ip", &self.local_ip)
            .field("tls", &self.tls.is_some())
            .field("credentials", &self.credentials)
            .finish()
    }
}

fn build_tls(config: &MasterConfig) -> Result<Option<tokio_native_tls::TlsConnector>, MasterError> {
    if !config.tls.enabled {
        return Ok(None);
    }

    let mut builder = native_tls::TlsConnector::builder();
    if let Some(path) = &config.tls.ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            MasterError::config(format!("Cannot read CA certificate {}: {e}", path.display()))
        })?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
            MasterError::config(format!("Invalid CA certificate {}: {e}", path.display()))
        })?;
        builder.add_root_certificate(cert);
    }
    if config.tls.accept_invalid_certs {
        tracing::warn!(host = %config.host, "TLS certificate verification disabled");
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder
        .build()
        .map_err(|e| MasterError::config(format!("Cannot build TLS connector: {e}")))?;
    Ok(Some(tokio_native_tls::TlsConnector::from(connector)))
}

/// One authenticated channel to the master.
///
/// Strictly request/response. A session that saw an IO or decode error, or
/// whose exchange was abandoned midway, is never reused.
pub struct Session {
    id: Uuid,
    framed: Framed<Box<dyn SessionIo>, LengthDelimitedCodec>,
    version: ProtocolVersion,
    tag: String,
    opened_at: DateTime<Utc>,
    broken: bool,
    in_exchange: bool,
}

impl Session {
    /// Connect, optionally wrap in TLS, and authenticate.
    pub async fn open(settings: &SessionSettings) -> Result<Self, MasterError> {
        let connect = Self::connect(settings);
        let io = tokio::time::timeout(settings.connect_timeout, connect)
            .await
            .map_err(|_| {
                MasterError::transport(format!(
                    "Connecting to {}:{} timed out after {:?}",
                    settings.host, settings.port, settings.connect_timeout
                ))
            })??;

        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(settings.max_frame_length)
            .new_codec();
        let mut session = Self {
            id: Uuid::new_v4(),
            framed: Framed::new(io, codec),
            version: ProtocolVersion::CURRENT,
            tag: String::new(),
            opened_at: Utc::now(),
            broken: false,
            in_exchange: false,
        };
        session.handshake(&settings.credentials).await?;

        tracing::debug!(
            session_id = %session.id,
            host = %settings.host,
            version = %session.version,
            tag = %session.tag,
            "Session opened"
        );
        Ok(session)
    }

    async fn connect(settings: &SessionSettings) -> Result<Box<dyn SessionIo>, MasterError> {
        let stream = Self::connect_tcp(settings).await?;
        stream.set_nodelay(true)?;
        match &settings.tls {
            Some(tls) => {
                let stream = tls.connect(&settings.host, stream).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(stream)),
        }
    }

    async fn connect_tcp(settings: &SessionSettings) -> Result<TcpStream, MasterError> {
        let addrs = tokio::net::lookup_host((settings.host.as_str(), settings.port)).await?;
        let mut last_error = None;

        for addr in addrs {
            let socket = match (addr, settings.local_ip) {
                (SocketAddr::V4(_), Some(ip)) if ip.is_ipv6() => continue,
                (SocketAddr::V6(_), Some(ip)) if ip.is_ipv4() => continue,
                (SocketAddr::V4(_), _) => TcpSocket::new_v4()?,
                (SocketAddr::V6(_), _) => TcpSocket::new_v6()?,
            };
            if let Some(ip) = settings.local_ip {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => MasterError::transport_with_source(
                format!("Cannot connect to {}:{}", settings.host, settings.port),
                e,
            ),
            None => MasterError::transport(format!(
                "No usable address for {}:{}",
                settings.host, settings.port
            )),
        })
    }

    async fn handshake(&mut self, credentials: &Credentials) -> Result<(), MasterError> {
        let mut hello = WireWriter::new();
        hello.write_varint(ProtocolVersion::SUPPORTED.len() as u64);
        for version in ProtocolVersion::SUPPORTED {
            hello.write_varint(u64::from(version.number()));
        }
        hello.write_utf(&credentials.username);
        hello.write_utf(&credentials.password);
        hello.write_nullable_utf(credentials.switch_user.as_deref());
        hello.write_nullable_utf(credentials.daemon_server.as_deref());
        self.send(hello.freeze()).await?;

        let frame = self.recv().await?;
        let mut reply = WireReader::new(&frame);
        match Status::from_byte(reply.read_u8()?)? {
            Status::Done => {
                let number = u16::try_from(reply.read_varint()?)
                    .map_err(|_| MasterError::decode("protocol version out of range"))?;
                let version = ProtocolVersion::new(number);
                if !version.is_supported() {
                    return Err(MasterError::decode(format!("master chose unsupported {version}")));
                }
                self.version = version;
                self.tag = reply.read_utf()?;
                reply.finish()
            }
            Status::Error => {
                let code = reply.read_u32()?;
                let message = reply.read_utf()?;
                tracing::warn!(
                    user = %credentials.effective_user(),
                    code,
                    message = %message,
                    "Master rejected session"
                );
                Err(MasterError::handshake(code, message))
            }
            Status::Next => Err(MasterError::decode("unexpected NEXT during handshake")),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Protocol version negotiated at session start.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Server-assigned session tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether the session may be handed out again.
    pub fn is_reusable(&self) -> bool {
        !self.broken && !self.in_exchange
    }

    /// Mark the session unusable.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Enter an exchange. Until [`Session::end_exchange`], the session is
    /// treated as mid-message.
    pub fn begin_exchange(&mut self) {
        self.in_exchange = true;
    }

    pub fn end_exchange(&mut self) {
        self.in_exchange = false;
    }

    /// Say goodbye to the master and drop the connection.
    ///
    /// Best effort: a broken or mid-exchange session is dropped silently.
    pub async fn quit(mut self) {
        if !self.is_reusable() {
            return;
        }
        let mut frame = WireWriter::new();
        frame.write_varint(Command::Quit.ordinal());
        match tokio::time::timeout(QUIT_TIMEOUT, self.send(frame.freeze())).await {
            Ok(Ok(())) => tracing::debug!(session_id = %self.id, "Session quit"),
            Ok(Err(e)) => tracing::debug!(session_id = %self.id, error = %e, "QUIT not delivered"),
            Err(_) => tracing::debug!(session_id = %self.id, "QUIT timed out"),
        }
    }

    /// Write one whole frame.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), MasterError> {
        if let Err(e) = self.framed.send(frame).await {
            self.broken = true;
            return Err(MasterError::transport_with_source("Failed to send frame", e));
        }
        Ok(())
    }

    /// Read one whole frame.
    pub async fn recv(&mut self) -> Result<BytesMut, MasterError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => {
                self.broken = true;
                if e.kind() == std::io::ErrorKind::InvalidData {
                    Err(MasterError::decode(format!("bad frame: {e}")))
                } else {
                    Err(MasterError::transport_with_source("Failed to read frame", e))
                }
            }
            None => {
                self.broken = true;
                Err(MasterError::transport("Master closed the session"))
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("tag", &self.tag)
            .field("broken", &self.broken)
            .field("in_exchange", &self.in_exchange)
            .finish()
    }
}

/// deadpool manager creating and recycling sessions.
#[derive(Debug)]
pub struct SessionManager {
    settings: Arc<SessionSettings>,
}

impl managed::Manager for SessionManager {
    type Type = Session;
    type Error = MasterError;

    async fn create(&self) -> Result<Session, MasterError> {
        Session::open(&self.settings).await
    }

    async fn recycle(&self, session: &mut Session, metrics: &Metrics) -> RecycleResult<MasterError> {
        if !session.is_reusable() {
            return Err(RecycleError::Backend(MasterError::transport("session is not reusable")));
        }
        if metrics.age() > self.settings.max_age {
            tracing::debug!(session_id = %session.id, "Retiring aged session");
            return Err(RecycleError::Backend(MasterError::transport("session exceeded max age")));
        }
        Ok(())
    }
}

/// A session checked out of the pool. Returns to the pool on drop.
pub type PooledSession = Object<SessionManager>;

/// Bounded pool of sessions to one master.
pub struct SessionPool {
    id: Uuid,
    settings: Arc<SessionSettings>,
    pool: managed::Pool<SessionManager>,
    created_at: DateTime<Utc>,
}

impl SessionPool {
    /// Create a pool. No session is opened until the first acquire.
    pub fn new(settings: SessionSettings, max_size: usize) -> Result<Self, MasterError> {
        let settings = Arc::new(settings);
        let manager = SessionManager { settings: settings.clone() };
        let pool = managed::Pool::builder(manager)
            .max_size(max_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| MasterError::config(format!("Failed to create pool: {e}")))?;

        let id = Uuid::new_v4();
        tracing::info!(
            pool_id = %id,
            host = %settings.host,
            port = settings.port,
            max_size,
            "Session pool created"
        );
        Ok(Self { id, settings, pool, created_at: Utc::now() })
    }

    /// Create a pool from a validated configuration.
    pub fn from_config(config: &MasterConfig) -> Result<Self, MasterError> {
        Self::new(SessionSettings::from_config(config)?, config.pool_size)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Check out a session, opening one if the pool has room and none is
    /// idle. Blocks while the pool is at capacity.
    pub async fn acquire(&self, cx: &CallContext) -> Result<PooledSession, MasterError> {
        cx.guard("acquire session", async {
            self.pool.get().await.map_err(|e| self.map_pool_error(e))
        })
        .await
    }

    fn map_pool_error(&self, err: PoolError<MasterError>) -> MasterError {
        match err {
            PoolError::Backend(e) => e,
            PoolError::Timeout(kind) => MasterError::pool_timeout(
                format!("Timed out waiting for a session ({kind:?})"),
                self.pool.status().waiting,
            ),
            PoolError::Closed => MasterError::transport("Session pool is closed"),
            other => MasterError::internal(format!("Session pool failure: {other}")),
        }
    }

    /// Return a session. Sessions past their maximum age or no longer
    /// reusable are retired instead.
    pub fn release(&self, session: PooledSession) {
        let age = Object::metrics(&session).age();
        if !session.is_reusable() || age > self.settings.max_age {
            self.close(session);
        }
    }

    /// Discard a session permanently, freeing its pool slot.
    pub fn close(&self, session: PooledSession) {
        let session = Object::take(session);
        tracing::debug!(session_id = %session.id, "Session closed");
        spawn_quit(vec![session]);
    }

    /// Open a session outside the pool, for the invalidation listener.
    pub async fn open_dedicated(&self) -> Result<Session, MasterError> {
        Session::open(&self.settings).await
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Close the pool. Idle sessions are sent QUIT and dropped.
    pub fn shutdown(&self) {
        if self.pool.is_closed() {
            return;
        }
        let idle = self.pool.retain(|_, _| false).removed;
        self.pool.close();
        tracing::info!(pool_id = %self.id, idle = idle.len(), "Session pool closed");
        spawn_quit(idle);
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Send QUIT on each session in the background. Outside a runtime the
/// sessions are just dropped.
fn spawn_quit(sessions: Vec<Session>) {
    if sessions.is_empty() {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else { return };
    handle.spawn(async move {
        for session in sessions {
            session.quit().await;
        }
    });
}
