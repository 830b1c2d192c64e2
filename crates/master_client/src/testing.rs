//! Test fixtures: sample row types, a call-counting connector and an
//! in-process master speaking the wire protocol.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::Client;
use crate::error::MasterError;
use crate::models::{
    CallContext, ColumnDef, Credentials, ErasedRows, IndexKind, MasterConfig, Record, Request,
    Response, Row, RowDecoder, TableId, Value,
};
use crate::protocol::{Command, ProtocolVersion, Status, WireReader, WireWriter};
use crate::services::{
    Connector, ConnectorFactory, IndexedSet, InvalidationReceiver, TransportRegistry,
};

pub const PASSWORD: &str = "secret";

// ========== Sample rows ==========

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub pkey: i64,
    pub name: String,
    pub business: i64,
    /// Sent from protocol v2 on.
    pub disable_log: Option<i64>,
}

impl Package {
    pub const PKEY: usize = 0;
    pub const NAME: usize = 1;
    pub const BUSINESS: usize = 2;

    pub fn new(pkey: i64, name: &str, business: i64) -> Self {
        Self { pkey, name: name.to_string(), business, disable_log: None }
    }

    /// The owning business, looked up through `client`.
    pub async fn business(&self, client: &Client) -> Result<Option<Arc<Record<Business>>>, MasterError> {
        client.table::<Business>().get(&self.business).await
    }
}

const PACKAGE_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new(0, "pkey", IndexKind::PrimaryKey),
    ColumnDef::new(1, "name", IndexKind::Unique),
    ColumnDef::new(2, "business", IndexKind::Indexed),
    ColumnDef::new(3, "disable_log", IndexKind::None),
];

impl Row for Package {
    type Key = i64;

    const TABLE: TableId = TableId::Packages;

    fn columns() -> &'static [ColumnDef] {
        PACKAGE_COLUMNS
    }

    fn key(&self) -> i64 {
        self.pkey
    }

    fn value(&self, ordinal: usize) -> Value {
        match ordinal {
            0 => self.pkey.into(),
            1 => self.name.as_str().into(),
            2 => self.business.into(),
            3 => self.disable_log.into(),
            _ => Value::Null,
        }
    }

    fn encode(&self, out: &mut WireWriter, version: ProtocolVersion) {
        out.write_signed_varint(self.pkey);
        out.write_utf(&self.name);
        out.write_signed_varint(self.business);
        if version >= ProtocolVersion::V2 {
            out.write_bool(self.disable_log.is_some());
            if let Some(disable_log) = self.disable_log {
                out.write_signed_varint(disable_log);
            }
        }
    }

    fn decode(input: &mut WireReader<'_>, version: ProtocolVersion) -> Result<Self, MasterError> {
        let pkey = input.read_signed_varint()?;
        let name = input.read_utf()?;
        let business = input.read_signed_varint()?;
        let disable_log = if version >= ProtocolVersion::V2 && input.read_bool()? {
            Some(input.read_signed_varint()?)
        } else {
            None
        };
        Ok(Self { pkey, name, business, disable_log })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Business {
    pub pkey: i64,
    pub name: String,
}

impl Business {
    pub fn new(pkey: i64, name: &str) -> Self {
        Self { pkey, name: name.to_string() }
    }
}

const BUSINESS_COLUMNS: &[ColumnDef] = &[
    ColumnDef::new(0, "pkey", IndexKind::PrimaryKey),
    ColumnDef::new(1, "name", IndexKind::Unique),
];

impl Row for Business {
    type Key = i64;

    const TABLE: TableId = TableId::Businesses;

    fn columns() -> &'static [ColumnDef] {
        BUSINESS_COLUMNS
    }

    fn key(&self) -> i64 {
        self.pkey
    }

    fn value(&self, ordinal: usize) -> Value {
        match ordinal {
            0 => self.pkey.into(),
            1 => self.name.as_str().into(),
            _ => Value::Null,
        }
    }

    fn encode(&self, out: &mut WireWriter, _version: ProtocolVersion) {
        out.write_signed_varint(self.pkey);
        out.write_utf(&self.name);
    }

    fn decode(input: &mut WireReader<'_>, _version: ProtocolVersion) -> Result<Self, MasterError> {
        Ok(Self { pkey: input.read_signed_varint()?, name: input.read_utf()? })
    }
}

/// Unowned packages in the given order.
pub fn package_set(rows: &[(i64, &str, i64)]) -> IndexedSet<Package> {
    IndexedSet::from_ordered(
        rows.iter()
            .map(|&(pkey, name, business)| Arc::new(Record::new(Package::new(pkey, name, business))))
            .collect(),
    )
}

pub fn package_rows(rows: &[(i64, &str, i64)]) -> ErasedRows {
    ErasedRows::new(package_set(rows))
}

/// Rows of one table, encoded at the current protocol version.
type EncodedRows = HashMap<TableId, Vec<(Value, Bytes)>>;

fn encode_rows<R: Row>(rows: &[R]) -> Vec<(Value, Bytes)> {
    rows.iter()
        .map(|row| {
            let mut out = WireWriter::new();
            row.encode(&mut out, ProtocolVersion::CURRENT);
            (row.key().into(), out.freeze())
        })
        .collect()
}

// ========== FakeConnector ==========

type ErrorFactory = Arc<dyn Fn() -> MasterError + Send + Sync>;

/// Base connector that serves rows from memory and counts calls.
pub struct FakeConnector {
    id: Uuid,
    tables: Mutex<EncodedRows>,
    calls: Mutex<HashMap<TableId, usize>>,
    row_calls: AtomicUsize,
    pings: AtomicUsize,
    invalidations: Mutex<Vec<Vec<TableId>>>,
    failures: Mutex<VecDeque<ErrorFactory>>,
    delay: Mutex<Option<Duration>>,
    sender: broadcast::Sender<Vec<TableId>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            id: Uuid::new_v4(),
            tables: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            row_calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            invalidations: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            sender,
        }
    }

    /// Replace the contents of `R`'s table.
    pub fn set_table<R: Row>(&self, rows: &[R]) {
        self.tables.lock().insert(R::TABLE, encode_rows(rows));
    }

    /// GET_TABLE calls seen for `table`, failed ones included.
    pub fn calls(&self, table: TableId) -> usize {
        self.calls.lock().get(&table).copied().unwrap_or(0)
    }

    pub fn row_calls(&self) -> usize {
        self.row_calls.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Successful INVALIDATE calls, in order.
    pub fn invalidations(&self) -> Vec<Vec<TableId>> {
        self.invalidations.lock().clone()
    }

    /// Deliver a server push to subscribers.
    pub fn push(&self, tables: Vec<TableId>) {
        let _ = self.sender.send(tables);
    }

    /// Fail the next `count` calls with errors built by `error`.
    pub fn fail_next(&self, count: usize, error: impl Fn() -> MasterError + Send + Sync + 'static) {
        let error: ErrorFactory = Arc::new(error);
        self.failures.lock().extend(std::iter::repeat(error).take(count));
    }

    /// Delay every call before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn into_factory(self: Arc<Self>) -> Arc<dyn ConnectorFactory> {
        Arc::new(FakeFactory { connector: self })
    }

    fn answer(&self, decoder: &dyn RowDecoder, key: Option<&Value>) -> Result<ErasedRows, MasterError> {
        let tables = self.tables.lock();
        let mut sink = decoder.start(ProtocolVersion::CURRENT);
        for (row_key, frame) in tables.get(&decoder.table()).into_iter().flatten() {
            if key.is_some_and(|key| key != row_key) {
                continue;
            }
            let mut reader = WireReader::new(frame);
            sink.push(&mut reader)?;
            reader.finish()?;
        }
        Ok(sink.finish())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn execute(&self, request: Request, _cx: &CallContext) -> Result<Response, MasterError> {
        match &request {
            Request::Ping => {
                self.pings.fetch_add(1, Ordering::SeqCst);
            }
            Request::GetTable { decoder } => {
                *self.calls.lock().entry(decoder.table()).or_default() += 1;
            }
            Request::GetRow { .. } => {
                self.row_calls.fetch_add(1, Ordering::SeqCst);
            }
            Request::Invalidate { .. } => {}
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error());
        }

        match request {
            Request::Ping => Ok(Response::Done),
            Request::GetTable { decoder } => Ok(Response::Rows(self.answer(decoder.as_ref(), None)?)),
            Request::GetRow { key, decoder } => {
                Ok(Response::Rows(self.answer(decoder.as_ref(), Some(&key))?))
            }
            Request::Invalidate { tables, .. } => {
                self.invalidations.lock().push(tables);
                Ok(Response::Done)
            }
        }
    }

    fn subscribe(&self) -> InvalidationReceiver {
        self.sender.subscribe()
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

struct FakeFactory {
    connector: Arc<FakeConnector>,
}

#[async_trait]
impl ConnectorFactory for FakeFactory {
    async fn connect(&self, _credentials: &Credentials) -> Result<Arc<dyn Connector>, MasterError> {
        Ok(self.connector.clone() as Arc<dyn Connector>)
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

/// A default registry plus a `fake` transport backed by one shared connector.
pub fn fake_registry() -> (TransportRegistry, Arc<FakeConnector>) {
    let registry = TransportRegistry::new();
    let fake = Arc::new(FakeConnector::new());
    let shared = fake.clone();
    registry.register("fake", move |_| Ok(shared.clone().into_factory()));
    (registry, fake)
}

// ========== FakeMaster ==========

struct MasterState {
    tables: Mutex<EncodedRows>,
    failures: Mutex<HashMap<TableId, (u32, String)>>,
    calls: Mutex<HashMap<Command, usize>>,
    handshakes: AtomicUsize,
    drop_next: AtomicBool,
    delay: Mutex<Option<Duration>>,
    listeners: AtomicUsize,
    acks: AtomicUsize,
    pushes: broadcast::Sender<Vec<TableId>>,
    disconnect: Mutex<CancellationToken>,
}

/// A master on a loopback port. Accepts any user with password `secret`.
pub struct FakeMaster {
    port: u16,
    state: Arc<MasterState>,
    shutdown: CancellationToken,
}

impl FakeMaster {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake master");
        let port = listener.local_addr().expect("fake master address").port();
        let (pushes, _) = broadcast::channel(16);
        let state = Arc::new(MasterState {
            tables: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            handshakes: AtomicUsize::new(0),
            drop_next: AtomicBool::new(false),
            delay: Mutex::new(None),
            listeners: AtomicUsize::new(0),
            acks: AtomicUsize::new(0),
            pushes,
            disconnect: Mutex::new(CancellationToken::new()),
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve(accept_state.clone(), stream));
                        }
                        Err(_) => break,
                    },
                }
            }
        });

        Self { port, state, shutdown }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_table<R: Row>(&self, rows: &[R]) {
        self.state.tables.lock().insert(R::TABLE, encode_rows(rows));
    }

    /// Answer every load of `table` with an ERROR status.
    pub fn fail_table(&self, table: TableId, code: u32, message: &str) {
        self.state.failures.lock().insert(table, (code, message.to_string()));
    }

    /// Successful handshakes.
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn calls(&self, command: Command) -> usize {
        self.state.calls.lock().get(&command).copied().unwrap_or(0)
    }

    /// Close the connection on the next request instead of answering.
    pub fn drop_next_request(&self) {
        self.state.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock() = Some(delay);
    }

    /// Sessions currently in LISTEN_CACHES mode.
    pub fn listeners(&self) -> usize {
        self.state.listeners.load(Ordering::SeqCst)
    }

    pub fn listen_requests(&self) -> usize {
        self.calls(Command::ListenCaches)
    }

    /// Push an invalidation to every listening session.
    pub fn push(&self, tables: &[TableId]) {
        let _ = self.state.pushes.send(tables.to_vec());
    }

    pub fn acks(&self) -> usize {
        self.state.acks.load(Ordering::SeqCst)
    }

    /// Drop every listening session.
    pub fn disconnect_listeners(&self) {
        let previous = std::mem::replace(&mut *self.state.disconnect.lock(), CancellationToken::new());
        previous.cancel();
    }
}

impl Drop for FakeMaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type MasterFramed = Framed<TcpStream, LengthDelimitedCodec>;

fn status_frame(status: Status) -> Bytes {
    Bytes::from(vec![status.to_byte()])
}

fn error_frame(code: u32, message: &str) -> Bytes {
    let mut out = WireWriter::new();
    out.write_u8(Status::Error.to_byte());
    out.write_varint(u64::from(code));
    out.write_utf(message);
    out.freeze()
}

fn row_frame(row: &Bytes) -> Bytes {
    let mut frame = BytesMut::with_capacity(row.len() + 1);
    frame.put_u8(Status::Next.to_byte());
    frame.extend_from_slice(row);
    frame.freeze()
}

async fn serve(state: Arc<MasterState>, stream: TcpStream) {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    if !handshake(&state, &mut framed).await {
        return;
    }

    loop {
        let Some(Ok(frame)) = framed.next().await else { return };
        let mut request = WireReader::new(&frame);
        let Ok(command) = request.read_varint().and_then(Command::from_ordinal) else { return };
        *state.calls.lock().entry(command).or_default() += 1;

        match command {
            Command::Quit => return,
            Command::ListenCaches => {
                listen(&state, framed).await;
                return;
            }
            _ => {}
        }

        if state.drop_next.swap(false, Ordering::SeqCst) {
            return;
        }
        let delay = *state.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let Ok(replies) = answer(&state, command, &mut request) else { return };
        for reply in replies {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Offered versions and password of a handshake frame.
fn parse_hello(frame: &[u8]) -> Result<(Vec<ProtocolVersion>, String), MasterError> {
    let mut hello = WireReader::new(frame);
    let count = hello.read_varint()?;
    let mut offered = Vec::new();
    for _ in 0..count {
        offered.push(ProtocolVersion::new(hello.read_varint()? as u16));
    }
    let _username = hello.read_utf()?;
    let password = hello.read_utf()?;
    hello.read_nullable_utf()?;
    hello.read_nullable_utf()?;
    hello.finish()?;
    Ok((offered, password))
}

async fn handshake(state: &MasterState, framed: &mut MasterFramed) -> bool {
    let Some(Ok(frame)) = framed.next().await else { return false };
    let Ok((offered, password)) = parse_hello(&frame) else { return false };

    match ProtocolVersion::negotiate(&offered) {
        Some(version) if password == PASSWORD => {
            let session = state.handshakes.fetch_add(1, Ordering::SeqCst) + 1;
            let mut reply = WireWriter::new();
            reply.write_u8(Status::Done.to_byte());
            reply.write_varint(u64::from(version.number()));
            reply.write_utf(&format!("session-{session}"));
            framed.send(reply.freeze()).await.is_ok()
        }
        Some(_) => {
            let _ = framed.send(error_frame(1, "Authentication failed")).await;
            false
        }
        None => {
            let _ = framed.send(error_frame(2, "No common protocol version")).await;
            false
        }
    }
}

fn answer(
    state: &MasterState,
    command: Command,
    request: &mut WireReader<'_>,
) -> Result<Vec<Bytes>, MasterError> {
    match command {
        Command::Ping => Ok(vec![status_frame(Status::Done)]),
        Command::GetTable | Command::GetRow => {
            let table = TableId::from_wire(request.read_varint()?)?;
            let key = match command {
                Command::GetRow => Some(Value::decode(request)?),
                _ => None,
            };
            if let Some((code, message)) = state.failures.lock().get(&table) {
                return Ok(vec![error_frame(*code, message)]);
            }

            let tables = state.tables.lock();
            let mut replies: Vec<Bytes> = tables
                .get(&table)
                .into_iter()
                .flatten()
                .filter(|(row_key, _)| key.as_ref().map_or(true, |key| key == row_key))
                .map(|(_, row)| row_frame(row))
                .collect();
            replies.push(status_frame(Status::Done));
            Ok(replies)
        }
        Command::Invalidate => {
            let count = request.read_varint()?;
            let mut tables = Vec::new();
            for _ in 0..count {
                let ordinal = usize::try_from(request.read_varint()?).ok();
                if let Some(table) = ordinal.and_then(TableId::from_ordinal) {
                    tables.push(table);
                }
            }
            request.read_nullable_utf()?;
            let _ = state.pushes.send(tables);
            Ok(vec![status_frame(Status::Done)])
        }
        Command::Quit | Command::ListenCaches => Ok(Vec::new()),
    }
}

async fn listen(state: &MasterState, mut framed: MasterFramed) {
    let disconnect = state.disconnect.lock().clone();
    let mut pushes = state.pushes.subscribe();
    if framed.send(status_frame(Status::Done)).await.is_err() {
        return;
    }
    state.listeners.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            _ = disconnect.cancelled() => break,
            push = pushes.recv() => match push {
                Ok(tables) => {
                    let mut frame = WireWriter::new();
                    frame.write_varint(tables.len() as u64);
                    for table in tables {
                        frame.write_varint(table.ordinal() as u64);
                    }
                    if framed.send(frame.freeze()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) if frame.as_ref() == [Status::Done.to_byte()] => {
                    state.acks.fetch_add(1, Ordering::SeqCst);
                }
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }

    state.listeners.fetch_sub(1, Ordering::SeqCst);
}

/// Loopback configuration for `master` with no layers beyond the defaults.
pub fn test_config(master: &FakeMaster, pool_size: usize) -> MasterConfig {
    MasterConfig::builder()
        .host("127.0.0.1")
        .port(master.port())
        .credentials(Credentials::new("admin", PASSWORD))
        .pool_size(pool_size)
        .build()
        .expect("valid test configuration")
}
