use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::{Arc, Weak};

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use rustc_hash::FxBuildHasher;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{LookupCache, LookupResult, new_cache};
use crate::config::ResolverConfig;
use crate::error::LookupError;
use crate::socket::{ConnectionMode, SocketFactory, SocketManager};

const DEFAULT_TYPES: [RecordType; 2] = [RecordType::A, RecordType::AAAA];

type Waiter = oneshot::Sender<Result<Arc<LookupResult>, LookupError>>;

/// Bookkeeping for one in-flight transaction. The entry reference is weak:
/// the cache owns the entry, and a purged entry is observed as absent
/// rather than kept alive by the pending table.
struct PendingLookup {
    name: String,
    entry: Weak<LookupResult>,
    waiters: Vec<Waiter>,
    times_repeated: usize,
}

struct Shared {
    cache: LookupCache,
    pending: DashMap<u16, PendingLookup, FxBuildHasher>,
    socket: SocketManager,
    config: ResolverConfig,
}

/// Caching asynchronous DNS stub resolver.
///
/// Talks to one configured upstream over a single logical socket (UDP or
/// TCP, decided by the injected factory), coalesces concurrent lookups for
/// the same name into one wire transaction, and retransmits unanswered
/// queries on a bounded budget.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Shared>,
}

impl Resolver {
    pub fn new(create_socket: Box<SocketFactory>) -> Self {
        Self::with_config(create_socket, ResolverConfig::default())
    }

    pub fn with_config(create_socket: Box<SocketFactory>, config: ResolverConfig) -> Self {
        let cache = new_cache();
        seed_localhost(&cache);
        Self {
            inner: Arc::new(Shared {
                cache,
                pending: DashMap::with_hasher(FxBuildHasher::default()),
                socket: SocketManager::new(create_socket),
                config,
            }),
        }
    }

    /// Resolves `name` for the default address types (IN class, A + AAAA).
    pub async fn lookup(&self, name: &str) -> Result<Arc<LookupResult>, LookupError> {
        self.lookup_with(name, DNSClass::IN, &DEFAULT_TYPES).await
    }

    /// Resolves `name` for an explicit class and set of record types.
    ///
    /// Never blocks the caller: the cache, literal, and coalescing paths
    /// complete inline, and the network path completes through the pending
    /// lookup's waiter list. The one deliberate exception is the
    /// no-transport fallback, which delegates to the system resolver.
    pub async fn lookup_with(
        &self,
        name: &str,
        class: DNSClass,
        desired_types: &[RecordType],
    ) -> Result<Arc<LookupResult>, LookupError> {
        let shared = &self.inner;
        shared.flush_cache();

        if let Some(result) = literal_lookup(name, desired_types) {
            debug!(name, "resolved as address literal");
            return Ok(result);
        }

        if let Some(result) = self.lookup_in_cache(name, class, desired_types) {
            debug!(name, "resolved from cache");
            return Ok(result);
        }

        let domain =
            Name::from_str(name).map_err(|_| LookupError::InvalidName(name.to_string()))?;

        if !self.has_connection(true) {
            return self.system_fallback(name, domain).await;
        }

        let key = name.to_ascii_lowercase();
        // Desired types are registered inside entry creation, before the
        // entry is visible in the map, so a parallel caller can never
        // observe the entry without the declared intent.
        let result = shared
            .cache
            .entry(key.clone())
            .or_insert_with(|| {
                let entry = LookupResult::new(domain.clone());
                for ty in desired_types {
                    entry.will_add_record_of_type(*ty);
                }
                Arc::new(entry)
            })
            .value()
            .clone();

        // Coalescing: if an in-flight transaction already covers every
        // desired type (counting declared intent), chain onto its waiter
        // list instead of issuing a second wire query.
        let complete = desired_types
            .iter()
            .all(|ty| result.has_record_of_type(*ty, true));
        if complete {
            if let Some(rx) = shared.chain_onto_pending(&key, result.id()) {
                debug!(name = %key, "lookup already underway, coalescing");
                return rx.await.map_err(|_| LookupError::Abandoned)?;
            }
            if result.is_done() {
                return Ok(result);
            }
            // Entry claims completeness but nothing is fetching it; fall
            // through and issue a fresh transaction.
        }

        for ty in desired_types {
            result.will_add_record_of_type(*ty);
        }

        // Random transaction ID, collision-checked against the pending
        // table so a response can never match two lookups.
        let (tx, rx) = oneshot::channel();
        let id = loop {
            let candidate: u16 = rand::random();
            match shared.pending.entry(candidate) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(PendingLookup {
                        name: key.clone(),
                        entry: Arc::downgrade(&result),
                        waiters: vec![tx],
                        times_repeated: 0,
                    });
                    break candidate;
                }
            }
        };
        result.set_id(id);

        let frame = match prepare_query(id, &domain, class, desired_types, shared.socket.mode()) {
            Ok(frame) => frame,
            Err(err) => {
                shared.fail_pending(id, LookupError::Proto(err.to_string()));
                return rx.await.map_err(|_| LookupError::Abandoned)?;
            }
        };

        debug!(name = %key, id, types = ?desired_types, "sending query");
        if let Err(err) = shared.send_frame(frame.clone()).await {
            shared.fail_pending(id, LookupError::Transport(err.to_string()));
            return rx.await.map_err(|_| LookupError::Abandoned)?;
        }

        tokio::spawn(retry_driver(shared.clone(), id, frame));

        rx.await.map_err(|_| LookupError::Abandoned)?
    }

    /// Cache-only lookup; never touches the network. The entry must carry a
    /// non-expired record for every desired type.
    pub fn lookup_in_cache(
        &self,
        name: &str,
        _class: DNSClass,
        desired_types: &[RecordType],
    ) -> Option<Arc<LookupResult>> {
        let entry = self.inner.cache.get(&name.to_ascii_lowercase())?.value().clone();
        desired_types
            .iter()
            .all(|ty| entry.has_record_of_type(*ty, false))
            .then_some(entry)
    }

    /// Cache-only lookup for the default address types, asserting presence.
    /// Caller contract: only for names known to be cached, e.g. `localhost`.
    pub fn expect_cached(&self, name: &str) -> Arc<LookupResult> {
        self.lookup_in_cache(name, DNSClass::IN, &DEFAULT_TYPES)
            .unwrap_or_else(|| panic!("expected {name} to be cached"))
    }

    /// Ensures a transport exists, creating one if necessary.
    pub async fn when_socket_ready(&self) -> Result<(), LookupError> {
        if self.has_connection(false) || self.has_connection(true) {
            Ok(())
        } else {
            Err(LookupError::Transport("failed to create socket".to_string()))
        }
    }

    /// Drops the current transport; the next lookup recreates it on demand.
    pub fn reset_connection(&self) {
        self.inner.socket.reset();
    }

    fn has_connection(&self, attempt_restart: bool) -> bool {
        let (open, fresh) = self.inner.socket.has_connection(attempt_restart);
        if let Some((incoming, mode)) = fresh {
            tokio::spawn(read_loop(self.inner.clone(), incoming, mode));
        }
        open
    }

    /// No transport available: resolve through the system resolver instead.
    /// A/AAAA only, bypasses the cache and the pending-lookup table.
    async fn system_fallback(
        &self,
        name: &str,
        domain: Name,
    ) -> Result<Arc<LookupResult>, LookupError> {
        debug!(name, "no transport available, using system resolver");
        let addresses = tokio::net::lookup_host((name, 0u16))
            .await
            .map_err(|err| LookupError::SystemResolver(err.to_string()))?;

        let result = LookupResult::new(domain.clone());
        for address in addresses {
            let rdata = match address.ip() {
                IpAddr::V4(v4) => RData::A(A(v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
            };
            result.add_record(Record::from_rdata(domain.clone(), 0, rdata));
        }
        result.finished_request();
        Ok(Arc::new(result))
    }
}

impl Shared {
    /// Eviction sweep: expire records everywhere and drop entries that are
    /// invalid with no outstanding request.
    fn flush_cache(&self) {
        let now = Instant::now();
        self.cache.retain(|name, entry| {
            entry.check_expiration(now);
            let keep = !entry.can_be_removed();
            if !keep {
                debug!(name = %name, "evicting cache entry");
            }
            keep
        });
    }

    /// Chains a new waiter onto the in-flight transaction for `name`, if
    /// one exists. Matched by the cache entry's recorded transaction ID
    /// first, then by a name scan; the scan closes the window where a
    /// parallel caller has inserted its pending lookup but not yet
    /// recorded the ID on the entry. The ID match also verifies the name,
    /// so a stale ID left on the entry never chains onto another name's
    /// transaction.
    fn chain_onto_pending(
        &self,
        name: &str,
        id: u16,
    ) -> Option<oneshot::Receiver<Result<Arc<LookupResult>, LookupError>>> {
        if let Some(mut pending) = self.pending.get_mut(&id) {
            if pending.name == name {
                let (tx, rx) = oneshot::channel();
                pending.waiters.push(tx);
                return Some(rx);
            }
        }
        let mut pending = self.pending.iter_mut().find(|lookup| lookup.name == name)?;
        let (tx, rx) = oneshot::channel();
        pending.waiters.push(tx);
        Some(rx)
    }

    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        let writer = self.socket.writer().context("no transport available")?;
        writer
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    /// Removes a pending lookup and rejects every waiter with `error`. The
    /// entry's request is marked finished so the eviction sweep can reclaim
    /// it.
    fn fail_pending(&self, id: u16, error: LookupError) {
        let Some((_, lookup)) = self.pending.remove(&id) else {
            return;
        };
        if let Some(entry) = lookup.entry.upgrade() {
            entry.finished_request();
        }
        for waiter in lookup.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Correlates one decoded wire message back to its pending lookup.
    fn handle_frame(&self, frame: &[u8]) {
        let message = match Message::from_bytes(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping malformed dns message");
                return;
            }
        };

        let Some((id, lookup)) = self.pending.remove(&message.id()) else {
            debug!(id = message.id(), "response with no pending lookup");
            return;
        };
        let Some(result) = lookup.entry.upgrade() else {
            debug!(id, name = %lookup.name, "response for an entry purged from the cache");
            return;
        };

        let rcode = message.response_code();
        if rcode != ResponseCode::NoError {
            debug!(id, name = %lookup.name, rcode = ?rcode, "response carries an error code");
        }

        for record in message.answers() {
            result.add_record(record.clone());
        }
        result.finished_request();
        debug!(id, name = %lookup.name, answers = message.answers().len(), "lookup resolved");
        for waiter in lookup.waiters {
            let _ = waiter.send(Ok(result.clone()));
        }
    }
}

/// Retransmission state machine for one transaction. The initial send
/// (attempt 1) happens inline in `lookup_with`; this drives the remaining
/// attempts and the terminal timeout. A response makes the pending entry
/// disappear, which stops the driver.
async fn retry_driver(shared: Arc<Shared>, id: u16, frame: Bytes) {
    let interval = shared.config.retry_interval();
    let max_attempts = shared.config.max_attempts.max(1);

    for attempt in 2..=max_attempts {
        tokio::time::sleep(interval).await;
        let repeats = match shared.pending.get_mut(&id) {
            Some(mut pending) => {
                pending.times_repeated += 1;
                pending.times_repeated
            }
            None => return,
        };
        debug!(id, attempt, repeats, "retransmitting query");
        if let Err(err) = shared.send_frame(frame.clone()).await {
            // A write failure is terminal; it does not consume more of the
            // retry budget.
            shared.fail_pending(id, LookupError::Transport(err.to_string()));
            return;
        }
    }

    tokio::time::sleep(interval).await;
    if shared.pending.contains_key(&id) {
        debug!(id, attempts = max_attempts, "retry budget exhausted");
        shared.fail_pending(id, LookupError::Timeout);
    }
}

/// Consumes raw bytes from the transport and feeds complete messages to
/// response processing. UDP chunks are whole datagrams; TCP chunks are
/// reassembled through the 2-byte big-endian length prefix, where a short
/// buffer means "wait for more input", not an error.
async fn read_loop(shared: Arc<Shared>, mut incoming: mpsc::Receiver<Bytes>, mode: ConnectionMode) {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = incoming.recv().await {
        match mode {
            ConnectionMode::Udp => shared.handle_frame(&chunk),
            ConnectionMode::Tcp => {
                buffer.extend_from_slice(&chunk);
                while buffer.len() >= 2 {
                    let frame_len = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
                    if buffer.len() < 2 + frame_len {
                        break;
                    }
                    buffer.advance(2);
                    let frame = buffer.split_to(frame_len).freeze();
                    shared.handle_frame(&frame);
                }
            }
        }
    }
    debug!("transport closed, reader exiting");
}

/// IPv4/IPv6 literal short-circuit: a synthesized one-shot entry resolved
/// without network I/O or cache insertion.
fn literal_lookup(name: &str, desired_types: &[RecordType]) -> Option<Arc<LookupResult>> {
    if let Ok(v4) = name.parse::<Ipv4Addr>() {
        if desired_types.contains(&RecordType::A) {
            let result = LookupResult::new(Name::root());
            result.add_record(Record::from_rdata(Name::root(), 0, RData::A(A(v4))));
            result.finished_request();
            return Some(Arc::new(result));
        }
    }
    if let Ok(v6) = name.parse::<Ipv6Addr>() {
        if desired_types.contains(&RecordType::AAAA) {
            let result = LookupResult::new(Name::root());
            result.add_record(Record::from_rdata(Name::root(), 0, RData::AAAA(AAAA(v6))));
            result.finished_request();
            return Some(Arc::new(result));
        }
    }
    None
}

/// Builds the query message (one question per desired type, recursion
/// desired) and frames it for the transport: TCP gets the 2-byte length
/// prefix, UDP goes out as-is.
fn prepare_query(
    id: u16,
    name: &Name,
    class: DNSClass,
    desired_types: &[RecordType],
    mode: Option<ConnectionMode>,
) -> anyhow::Result<Bytes> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    for ty in desired_types {
        let mut query = Query::new();
        query.set_name(name.clone());
        query.set_query_type(*ty);
        query.set_query_class(class);
        message.add_query(query);
    }
    if message.queries().is_empty() {
        let mut query = Query::new();
        query.set_name(name.clone());
        query.set_query_type(RecordType::A);
        query.set_query_class(class);
        message.add_query(query);
    }

    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        message.emit(&mut encoder).context("encode query")?;
    }

    match mode.context("no transport available")? {
        ConnectionMode::Udp => Ok(Bytes::from(out)),
        ConnectionMode::Tcp => {
            let mut framed = BytesMut::with_capacity(2 + out.len());
            framed.put_u16(out.len() as u16);
            framed.extend_from_slice(&out);
            Ok(framed.freeze())
        }
    }
}

/// Permanent loopback records for `localhost`, inserted at construction so
/// that name never hits the network.
fn seed_localhost(cache: &LookupCache) {
    let name = Name::from_str("localhost").expect("static name");
    let result = LookupResult::new(name.clone());
    result.will_add_record_of_type(RecordType::A);
    result.will_add_record_of_type(RecordType::AAAA);
    result.add_record(Record::from_rdata(name.clone(), 0, RData::A(A(Ipv4Addr::LOCALHOST))));
    result.add_record(Record::from_rdata(name, 0, RData::AAAA(AAAA(Ipv6Addr::LOCALHOST))));
    result.finished_request();
    cache.insert("localhost".to_string(), Arc::new(result));
}
