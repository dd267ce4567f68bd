//! Per-connection protocol driver.
//!
//! A peer handshakes, runs one sync turn in each direction, and then sits
//! idle relaying announcements until the connection drops, the remote
//! breaks the protocol, or the pool stops it.
//!
//! Transfer of a single entity:
//!
//! ```text
//!   sender                      receiver
//!   ann{id}   ───────────────▶
//!             ◀───────────────  ack{id}          (already stored)
//!             ◀───────────────  req{id}          (wanted)
//!   entity    ───────────────▶
//!             ◀───────────────  req{dep} ...     (missing prerequisites)
//!   entity    ───────────────▶
//!             ◀───────────────  ack{id}          (stored)
//! ```
//!
//! A `req` for an entity the sender does not have is answered with
//! `ack{dep}`; the receiver then drops whatever needed it.
//!
//! Each active sync turn scans the store in `TimeStored` order and is
//! capped per kind. Where it stopped is kept in the peer history so the
//! next connection to the same user resumes there.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use dscuss_shared::constants::{
    MAX_CLOCK_SKEW, MAX_PENDING_DEPENDENCIES, MAX_SYNC_DURATION, MAX_SYNC_NUMBER_OF_MESSAGES,
    MAX_SYNC_NUMBER_OF_OPERATIONS, OBSERVER_CHANNEL_CAPACITY, REPLY_TIMEOUT, SYNC_BATCH_SIZE,
};
use dscuss_shared::types::now;
use dscuss_shared::{
    Entity, Hello, Id, OperationType, Packet, PacketType, PrivateKey, Subscriptions, User,
};
use dscuss_store::{EntityStore, ObserverId, StoreError, UserHistory};

use crate::connection::{Connection, Direction};
use crate::error::{NetError, Result};

/// Everything a peer needs from the local node.
pub struct PeerContext {
    pub store: Arc<EntityStore>,
    pub key: PrivateKey,
    pub user: User,
    pub subscriptions: Subscriptions,
    pub pow_difficulty: u32,
    pub sync_limits: SyncLimits,
}

/// How many entities of each kind one active sync turn may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub messages: u32,
    pub operations: u32,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            messages: MAX_SYNC_NUMBER_OF_MESSAGES,
            operations: MAX_SYNC_NUMBER_OF_OPERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Handshaking,
    Idle,
    ActiveSyncing,
    PassiveSyncing,
    Sending,
    Receiving,
    Stopped,
}

impl PeerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerState::Handshaking => "Handshaking",
            PeerState::Idle => "Idle",
            PeerState::ActiveSyncing => "ActiveSyncing",
            PeerState::PassiveSyncing => "PassiveSyncing",
            PeerState::Sending => "Sending",
            PeerState::Receiving => "Receiving",
            PeerState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a peer for listing.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: u64,
    pub addresses: Vec<String>,
    pub direction: Direction,
    pub state: PeerState,
    pub user_id: Option<Id>,
    pub nickname: Option<String>,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.id, self.direction, self.state)?;
        if let (Some(id), Some(nick)) = (&self.user_id, &self.nickname) {
            write!(f, " {nick} ({})", id.short())?;
        }
        write!(f, " [{}]", self.addresses.join(", "))
    }
}

pub(crate) enum PeerControl {
    /// Addresses of a closing connection to the same user.
    AdoptAddresses(Vec<String>),
}

pub(crate) enum PoolEvent {
    /// Sent once the handshake succeeds. The pool answers whether another
    /// peer already serves the same user.
    Handshaked {
        peer_id: u64,
        user_id: Id,
        reply: oneshot::Sender<bool>,
    },
    /// Sent while terminating. The pool answers with the control channel of
    /// another peer for the same user, if one is still registered.
    Leaving {
        peer_id: u64,
        user_id: Id,
        reply: oneshot::Sender<Option<mpsc::Sender<PeerControl>>>,
    },
    Gone {
        peer_id: u64,
        conn: Connection,
    },
}

/// The pool's side of a running peer.
pub(crate) struct PeerHandle {
    pub info: Arc<RwLock<PeerInfo>>,
    pub control_tx: mpsc::Sender<PeerControl>,
    pub user_id: Option<Id>,
}

struct Remote {
    user: User,
    subscriptions: Subscriptions,
}

enum IdleEvent {
    Packet(Packet),
    Outbound(Entity),
    Control(PeerControl),
}

fn violation(msg: impl Into<String>) -> NetError {
    NetError::ProtocolViolation(msg.into())
}

fn sync_window() -> chrono::Duration {
    chrono::Duration::from_std(MAX_SYNC_DURATION).unwrap_or_else(|_| chrono::Duration::days(30))
}

#[derive(Debug, Clone, Copy)]
enum SyncKind {
    Messages,
    Operations,
}

impl SyncKind {
    fn cap(self, limits: &SyncLimits) -> u32 {
        match self {
            SyncKind::Messages => limits.messages,
            SyncKind::Operations => limits.operations,
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKind::Messages => f.write_str("messages"),
            SyncKind::Operations => f.write_str("operations"),
        }
    }
}

pub(crate) struct Peer {
    id: u64,
    conn: Connection,
    ctx: Arc<PeerContext>,
    info: Arc<RwLock<PeerInfo>>,
    remote: Option<Remote>,
    observer_tx: Option<mpsc::Sender<Entity>>,
    observer_rx: mpsc::Receiver<Entity>,
    observer_id: Option<ObserverId>,
    control_rx: mpsc::Receiver<PeerControl>,
    pool_tx: mpsc::Sender<PoolEvent>,
    stop_rx: watch::Receiver<bool>,
    /// Announcements that arrived while our own transfer was in flight.
    deferred: VecDeque<Id>,
    /// `TimeStored` our sync turn has got through, per kind. `None` once
    /// the turn drained that kind.
    messages_cursor: Option<DateTime<Utc>>,
    operations_cursor: Option<DateTime<Utc>>,
}

impl Peer {
    pub(crate) fn new(
        id: u64,
        conn: Connection,
        ctx: Arc<PeerContext>,
        pool_tx: mpsc::Sender<PoolEvent>,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, PeerHandle) {
        let info = Arc::new(RwLock::new(PeerInfo {
            id,
            addresses: conn.addresses().to_vec(),
            direction: conn.direction(),
            state: PeerState::Handshaking,
            user_id: None,
            nickname: None,
        }));
        let (control_tx, control_rx) = mpsc::channel(16);
        let (observer_tx, observer_rx) = mpsc::channel(OBSERVER_CHANNEL_CAPACITY);

        let peer = Self {
            id,
            conn,
            ctx,
            info: info.clone(),
            remote: None,
            observer_tx: Some(observer_tx),
            observer_rx,
            observer_id: None,
            control_rx,
            pool_tx,
            stop_rx,
            deferred: VecDeque::new(),
            messages_cursor: None,
            operations_cursor: None,
        };
        let handle = PeerHandle {
            info,
            control_tx,
            user_id: None,
        };
        (peer, handle)
    }

    pub(crate) async fn run(mut self) {
        info!(peer = self.id, addr = %self.conn.remote_addr(), direction = %self.conn.direction(), "peer started");

        let mut stop_rx = self.stop_rx.clone();
        let outcome = if *stop_rx.borrow() {
            Ok(())
        } else {
            tokio::select! {
                res = self.drive() => res,
                _ = stop_rx.changed() => {
                    debug!(peer = self.id, "peer stopped by pool");
                    Ok(())
                }
            }
        };

        match &outcome {
            Ok(()) => debug!(peer = self.id, "peer finished"),
            Err(e) if e.is_violation() => {
                warn!(peer = self.id, error = %e, "terminating peer")
            }
            Err(e) => info!(peer = self.id, error = %e, "peer disconnected"),
        }
        self.terminate().await;
    }

    async fn drive(&mut self) -> Result<()> {
        self.handshake().await?;
        if !self.register_with_pool().await? {
            return Ok(());
        }
        let (messages_from, operations_from) = self.sync_start()?;
        self.messages_cursor = Some(messages_from);
        self.operations_cursor = Some(operations_from);

        if let Some(tx) = self.observer_tx.take() {
            self.observer_id = Some(self.ctx.store.attach_observer(tx));
        }

        if self.conn.is_active() {
            self.active_sync().await?;
            self.passive_sync().await?;
        } else {
            self.passive_sync().await?;
            self.active_sync().await?;
        }

        self.idle().await
    }

    fn set_state(&self, state: PeerState) {
        if let Ok(mut info) = self.info.write() {
            info.state = state;
        }
    }

    fn remote(&self) -> Result<&Remote> {
        self.remote
            .as_ref()
            .ok_or_else(|| NetError::ProtocolViolation("handshake incomplete".into()))
    }

    async fn send(&mut self, packet: Packet) -> Result<()> {
        self.conn.write(packet).await
    }

    /// Read a packet signed by the handshaken remote user.
    async fn read_reply(&mut self) -> Result<Packet> {
        let packet = self.conn.read_timeout(REPLY_TIMEOUT).await?;
        self.check_signed(&packet)?;
        Ok(packet)
    }

    fn check_signed(&self, packet: &Packet) -> Result<()> {
        if !packet.verify(self.remote()?.user.pub_key()) {
            return Err(violation(format!("bad signature on {}", packet.packet_type())));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn handshake(&mut self) -> Result<()> {
        self.set_state(PeerState::Handshaking);
        let own = Packet::user(&self.ctx.user, &self.ctx.key)?;

        let user = if self.conn.is_active() {
            self.send(own).await?;
            self.read_user().await?
        } else {
            let user = self.read_user().await?;
            self.send(own).await?;
            user
        };

        let subscriptions = if self.conn.is_active() {
            self.send_hello(&user).await?;
            self.read_hello(&user).await?
        } else {
            let subs = self.read_hello(&user).await?;
            self.send_hello(&user).await?;
            subs
        };

        self.ctx.store.put_entity(&Entity::User(user.clone()), None)?;

        info!(
            peer = self.id,
            user = %user.id().short(),
            nickname = %user.nickname(),
            "handshake complete"
        );
        if let Ok(mut info) = self.info.write() {
            info.user_id = Some(user.id());
            info.nickname = Some(user.nickname().to_string());
        }
        self.remote = Some(Remote {
            user,
            subscriptions,
        });
        Ok(())
    }

    async fn read_user(&mut self) -> Result<User> {
        let packet = self.conn.read_timeout(REPLY_TIMEOUT).await?;
        packet.expect(PacketType::User)?;
        let user: User = packet.decode_payload()?;
        if !packet.verify(user.pub_key()) {
            return Err(violation("user packet not signed by its user"));
        }
        user.verify(self.ctx.pow_difficulty)?;
        if user.id() == self.ctx.user.id() {
            return Err(violation("connected to ourselves"));
        }
        Ok(user)
    }

    async fn send_hello(&mut self, remote: &User) -> Result<()> {
        let hello = Hello {
            receiver_id: remote.id(),
            time: now(),
            subscriptions: self.ctx.subscriptions.clone(),
        };
        let packet = Packet::hello(&hello, &self.ctx.key)?;
        self.send(packet).await
    }

    async fn read_hello(&mut self, remote: &User) -> Result<Subscriptions> {
        let packet = self.conn.read_timeout(REPLY_TIMEOUT).await?;
        packet.expect(PacketType::Hello)?;
        if !packet.verify(remote.pub_key()) {
            return Err(violation("hello not signed by the introduced user"));
        }
        let hello: Hello = packet.decode_payload()?;
        if hello.receiver_id != self.ctx.user.id() {
            return Err(violation("hello addressed to someone else"));
        }
        let skew = now().signed_duration_since(hello.time);
        let max = chrono::Duration::from_std(MAX_CLOCK_SKEW)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        if skew > max || skew < -max {
            return Err(violation(format!("clock skew {}s", skew.num_seconds())));
        }
        Ok(hello.subscriptions)
    }

    /// Returns `false` when this connection should give way to an older
    /// one for the same user.
    ///
    /// Only the side with the lower user id drops duplicates. The other side
    /// keeps every connection until the remote closes the extras, so both
    /// ends agree on the survivor.
    async fn register_with_pool(&mut self) -> Result<bool> {
        let user_id = self.remote()?.user.id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = PoolEvent::Handshaked {
            peer_id: self.id,
            user_id,
            reply: reply_tx,
        };
        if self.pool_tx.send(event).await.is_err() {
            return Ok(false);
        }
        match reply_rx.await {
            Ok(false) => Ok(true),
            Ok(true) if self.ctx.user.id() < user_id => {
                info!(peer = self.id, user = %user_id.short(), "duplicate connection, closing it");
                Ok(false)
            }
            Ok(true) => {
                debug!(peer = self.id, user = %user_id.short(), "duplicate connection, remote decides");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Where our sync turn starts, for messages and for operations.
    fn sync_start(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let remote = self.remote()?;
        let history = match self.ctx.store.get_user_history(&remote.user.id()) {
            Ok(history) => history,
            Err(StoreError::NoSuchEntity) => {
                let start = now() - sync_window();
                return Ok((start, start));
            }
            Err(e) => return Err(e.into()),
        };
        let base = if history.subscriptions == remote.subscriptions {
            history.disconnected
        } else {
            history.disconnected - sync_window()
        };
        let resume = |cursor: Option<DateTime<Utc>>| cursor.map_or(base, |c| c.min(base));
        Ok((
            resume(history.messages_cursor),
            resume(history.operations_cursor),
        ))
    }

    async fn active_sync(&mut self) -> Result<()> {
        self.set_state(PeerState::ActiveSyncing);
        let messages = self.sync_kind(SyncKind::Messages).await?;
        let operations = self.sync_kind(SyncKind::Operations).await?;

        let done = Packet::done(&self.ctx.key)?;
        self.send(done).await?;
        info!(
            peer = self.id,
            messages,
            operations,
            resumable = self.messages_cursor.is_some() || self.operations_cursor.is_some(),
            "active sync done"
        );
        Ok(())
    }

    fn cursor(&mut self, kind: SyncKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            SyncKind::Messages => &mut self.messages_cursor,
            SyncKind::Operations => &mut self.operations_cursor,
        }
    }

    fn scan(&self, kind: SyncKind, after: DateTime<Utc>) -> Result<Vec<(DateTime<Utc>, Entity)>> {
        let store = &self.ctx.store;
        Ok(match kind {
            SyncKind::Messages => store
                .scan_messages_stored_after(after, SYNC_BATCH_SIZE)?
                .into_iter()
                .map(|(stored, msg)| (stored, Entity::Message(msg)))
                .collect(),
            SyncKind::Operations => store
                .scan_operations_stored_after(after, SYNC_BATCH_SIZE)?
                .into_iter()
                .map(|(stored, op)| (stored, Entity::Operation(op)))
                .collect(),
        })
    }

    /// Offer every entity of `kind` past the cursor that the remote wants,
    /// up to the kind's cap. Entities the remote does not want cost nothing
    /// against the cap. Returns how many were offered.
    async fn sync_kind(&mut self, kind: SyncKind) -> Result<u32> {
        let Some(mut cursor) = *self.cursor(kind) else {
            return Ok(0);
        };
        let cap = kind.cap(&self.ctx.sync_limits);
        let mut offered = 0;
        loop {
            let batch = self.scan(kind, cursor)?;
            let exhausted = batch.len() < SYNC_BATCH_SIZE as usize;
            for (stored, entity) in batch {
                if offered == cap {
                    debug!(peer = self.id, %kind, since = %cursor, "sync cap reached");
                    return Ok(offered);
                }
                if self.wants(&entity)? {
                    self.offer(&entity).await?;
                    offered += 1;
                }
                cursor = stored;
                *self.cursor(kind) = Some(stored);
            }
            if exhausted {
                break;
            }
        }
        *self.cursor(kind) = None;
        Ok(offered)
    }

    async fn passive_sync(&mut self) -> Result<()> {
        self.set_state(PeerState::PassiveSyncing);
        loop {
            let packet = self.read_reply().await?;
            match packet.packet_type() {
                PacketType::Done => break,
                PacketType::Ann => self.accept_announcement(packet.to_id()?).await?,
                PacketType::Req => self.serve(packet.to_id()?).await?,
                PacketType::User | PacketType::Msg | PacketType::Oper => {
                    self.accept_unsolicited(&packet).await?
                }
                other => return Err(violation(format!("unexpected {other} during sync"))),
            }
        }
        debug!(peer = self.id, "passive sync done");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Idle
    // ------------------------------------------------------------------

    async fn idle(&mut self) -> Result<()> {
        loop {
            while let Some(id) = self.deferred.pop_front() {
                self.accept_announcement(id).await?;
            }
            self.set_state(PeerState::Idle);

            let event = tokio::select! {
                packet = self.conn.next_packet() => IdleEvent::Packet(packet?),
                Some(entity) = self.observer_rx.recv() => IdleEvent::Outbound(entity),
                Some(ctl) = self.control_rx.recv() => IdleEvent::Control(ctl),
            };

            match event {
                IdleEvent::Packet(packet) => {
                    self.check_signed(&packet)?;
                    self.set_state(PeerState::Receiving);
                    self.receive(packet).await?;
                }
                IdleEvent::Outbound(entity) => {
                    if self.wants(&entity)? {
                        self.set_state(PeerState::Sending);
                        self.offer(&entity).await?;
                    }
                }
                IdleEvent::Control(PeerControl::AdoptAddresses(addrs)) => {
                    debug!(peer = self.id, count = addrs.len(), "adopting addresses");
                    self.conn.add_addresses(addrs);
                    if let Ok(mut info) = self.info.write() {
                        info.addresses = self.conn.addresses().to_vec();
                    }
                }
            }
        }
    }

    async fn receive(&mut self, packet: Packet) -> Result<()> {
        match packet.packet_type() {
            PacketType::Ann => self.accept_announcement(packet.to_id()?).await,
            PacketType::Req => self.serve(packet.to_id()?).await,
            PacketType::User | PacketType::Msg | PacketType::Oper => {
                self.accept_unsolicited(&packet).await
            }
            PacketType::Ack | PacketType::Done => {
                debug!(peer = self.id, packet = %packet, "ignoring stray packet");
                Ok(())
            }
            PacketType::Hello => Err(violation("hello after handshake")),
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Whether the remote should hear about `entity`.
    fn wants(&self, entity: &Entity) -> Result<bool> {
        match entity {
            Entity::User(_) => Ok(false),
            Entity::Operation(_) => Ok(true),
            Entity::Message(msg) => {
                let topic = if msg.is_root() {
                    msg.topic().cloned()
                } else {
                    match self.ctx.store.get_thread_root(&msg.id()) {
                        Ok(root) => root.topic().cloned(),
                        Err(StoreError::NoSuchEntity) => None,
                        Err(e) => return Err(e.into()),
                    }
                };
                let remote = self.remote()?;
                Ok(topic.map_or(false, |t| remote.subscriptions.covers(&t)))
            }
        }
    }

    /// Announce `entity` and serve the remote until it acknowledges.
    async fn offer(&mut self, entity: &Entity) -> Result<()> {
        let id = entity.id();
        let ann = Packet::announce(id, &self.ctx.key)?;
        self.send(ann).await?;

        loop {
            let packet = self.read_reply().await?;
            match packet.packet_type() {
                PacketType::Ack => {
                    if packet.to_id()? == id {
                        debug!(peer = self.id, entity = %entity, "offer acknowledged");
                        return Ok(());
                    }
                    debug!(peer = self.id, "stray ack while offering");
                }
                PacketType::Req => {
                    let wanted = packet.to_id()?;
                    if wanted == id {
                        let reply = Packet::entity(entity, &self.ctx.key)?;
                        self.send(reply).await?;
                    } else {
                        self.serve(wanted).await?;
                    }
                }
                PacketType::Ann => {
                    let theirs = packet.to_id()?;
                    if self.conn.is_active() {
                        self.deferred.push_back(theirs);
                    } else {
                        self.accept_announcement(theirs).await?;
                    }
                }
                other => return Err(violation(format!("unexpected {other} while offering"))),
            }
        }
    }

    async fn serve(&mut self, id: Id) -> Result<()> {
        match self.ctx.store.get_entity(&id) {
            Ok(entity) => {
                let packet = Packet::entity(&entity, &self.ctx.key)?;
                self.send(packet).await
            }
            Err(StoreError::NoSuchEntity) => {
                debug!(peer = self.id, id = %id.short(), "requested entity unknown");
                let ack = Packet::ack(id, &self.ctx.key)?;
                self.send(ack).await
            }
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn accept_announcement(&mut self, id: Id) -> Result<()> {
        if self.ctx.store.has_entity(&id)? {
            let ack = Packet::ack(id, &self.ctx.key)?;
            return self.send(ack).await;
        }
        let req = Packet::request(id, &self.ctx.key)?;
        self.send(req).await?;
        match self.read_requested(id).await? {
            Some(entity) => self.accept_entity(entity).await?,
            None => debug!(peer = self.id, id = %id.short(), "announced entity not available"),
        }
        let ack = Packet::ack(id, &self.ctx.key)?;
        self.send(ack).await
    }

    async fn accept_unsolicited(&mut self, packet: &Packet) -> Result<()> {
        let entity = packet.to_entity()?;
        let id = entity.id();
        self.accept_entity(entity).await?;
        let ack = Packet::ack(id, &self.ctx.key)?;
        self.send(ack).await
    }

    /// The entity we asked for, or `None` if the remote answered that it
    /// does not have it.
    async fn read_requested(&mut self, id: Id) -> Result<Option<Entity>> {
        let packet = self.read_reply().await?;
        if packet.packet_type() == PacketType::Ack {
            let acked = packet.to_id()?;
            if acked != id {
                return Err(violation(format!(
                    "asked for {}, got ack for {}",
                    id.short(),
                    acked.short()
                )));
            }
            return Ok(None);
        }
        let entity = packet.to_entity()?;
        if entity.id() != id {
            return Err(violation(format!(
                "asked for {}, got {}",
                id.short(),
                entity.id().short()
            )));
        }
        Ok(Some(entity))
    }

    /// Verify and store `entity`, first fetching any prerequisite the store
    /// lacks.
    async fn accept_entity(&mut self, entity: Entity) -> Result<()> {
        let mut pending = vec![entity];
        while let Some(top) = pending.last() {
            match self.missing_prerequisite(top)? {
                Some(dep) => {
                    if pending.len() > MAX_PENDING_DEPENDENCIES {
                        return Err(violation("too many missing prerequisites"));
                    }
                    if pending.iter().any(|e| e.id() == dep) {
                        return Err(violation("circular prerequisites"));
                    }
                    debug!(peer = self.id, dep = %dep.short(), "fetching prerequisite");
                    let req = Packet::request(dep, &self.ctx.key)?;
                    self.send(req).await?;
                    match self.read_requested(dep).await? {
                        Some(fetched) => pending.push(fetched),
                        None => {
                            debug!(
                                peer = self.id,
                                dep = %dep.short(),
                                dropped = pending.len(),
                                "prerequisite not available, dropping"
                            );
                            return Ok(());
                        }
                    }
                }
                None => {
                    if let Some(ready) = pending.pop() {
                        self.store_entity(&ready)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// The id of a prerequisite `entity` needs before it can be stored, once
    /// everything checkable so far holds.
    fn missing_prerequisite(&self, entity: &Entity) -> Result<Option<Id>> {
        let store = &self.ctx.store;
        match entity {
            Entity::User(user) => {
                user.verify(self.ctx.pow_difficulty)?;
                Ok(None)
            }
            Entity::Message(msg) => {
                let author = match store.get_user(&msg.author_id()) {
                    Ok(author) => author,
                    Err(StoreError::NoSuchEntity) => return Ok(Some(msg.author_id())),
                    Err(e) => return Err(e.into()),
                };
                if !msg.verify_sig(author.pub_key()) {
                    return Err(violation(format!("bad signature on message {}", msg.id().short())));
                }
                if !msg.is_root() && !store.has_message(&msg.parent_id())? {
                    return Ok(Some(msg.parent_id()));
                }
                Ok(None)
            }
            Entity::Operation(op) => {
                let author = match store.get_user(&op.author_id()) {
                    Ok(author) => author,
                    Err(StoreError::NoSuchEntity) => return Ok(Some(op.author_id())),
                    Err(e) => return Err(e.into()),
                };
                if !op.verify_sig(author.pub_key()) {
                    return Err(violation(format!("bad signature on operation {}", op.id().short())));
                }
                let object = op.object_id();
                let present = match op.op_type() {
                    OperationType::RemoveMessage => store.has_message(&object)?,
                    OperationType::BanUser => store.has_user(&object)?,
                };
                if present {
                    Ok(None)
                } else if store.has_entity(&object)? {
                    Err(violation(format!("{} targets the wrong kind of entity", op.op_type())))
                } else {
                    Ok(Some(object))
                }
            }
        }
    }

    fn store_entity(&self, entity: &Entity) -> Result<()> {
        match self.ctx.store.put_entity(entity, self.observer_id) {
            Ok(stored) => {
                if stored {
                    info!(peer = self.id, entity = %entity, "received");
                }
                Ok(())
            }
            Err(StoreError::NoSuchEntity) => Err(violation(format!("{entity} is inconsistent"))),
            Err(e) => Err(e.into()),
        }
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    async fn terminate(mut self) {
        if let Some(id) = self.observer_id.take() {
            self.ctx.store.detach_observer(id);
        }
        // Nothing can be handed to us past this point; keep what already was.
        self.control_rx.close();
        while let Ok(PeerControl::AdoptAddresses(addrs)) = self.control_rx.try_recv() {
            self.conn.add_addresses(addrs);
        }

        let handed_off = self.hand_off().await;
        if let (Some(remote), false) = (&self.remote, handed_off) {
            let history = UserHistory {
                user_id: remote.user.id(),
                disconnected: now(),
                subscriptions: remote.subscriptions.clone(),
                messages_cursor: self.messages_cursor,
                operations_cursor: self.operations_cursor,
            };
            if let Err(e) = self.ctx.store.put_user_history(&history) {
                warn!(peer = self.id, error = %e, "failed to record peer history");
            }
        }
        self.set_state(PeerState::Stopped);
        self.conn.close();
        let _ = self
            .pool_tx
            .send(PoolEvent::Gone {
                peer_id: self.id,
                conn: self.conn,
            })
            .await;
    }

    /// Give our addresses to another live connection to the same user so
    /// they stay in use. `true` when one took them; it records the history.
    async fn hand_off(&mut self) -> bool {
        let Some(user_id) = self.remote.as_ref().map(|r| r.user.id()) else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = PoolEvent::Leaving {
            peer_id: self.id,
            user_id,
            reply: reply_tx,
        };
        if self.pool_tx.send(event).await.is_err() {
            return false;
        }
        let Ok(Some(survivor)) = reply_rx.await else {
            return false;
        };
        let addrs = self.conn.take_addresses();
        match survivor.send(PeerControl::AdoptAddresses(addrs)).await {
            Ok(()) => {
                info!(peer = self.id, user = %user_id.short(), "addresses handed to surviving connection");
                true
            }
            Err(mpsc::error::SendError(PeerControl::AdoptAddresses(addrs))) => {
                self.conn.add_addresses(addrs);
                false
            }
        }
    }
}
