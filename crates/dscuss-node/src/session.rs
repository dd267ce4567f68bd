//! Owner-facing entry points: the node directory ([`Dscuss`]) and the
//! logged-in user's [`Session`].
//!
//! Layout of the node directory:
//!
//! ```text
//! <dir>/config.json
//! <dir>/dscuss.log
//! <dir>/<nickname>/privkey.pem
//! <dir>/<nickname>/entities.db
//! <dir>/<nickname>/profile.db
//! <dir>/<nickname>/subscriptions.txt
//! <dir>/<nickname>/addresses        (optional)
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{info, warn};

use dscuss_net::{
    AddressProvider, ConnectionProvider, DhtAddressProvider, DhtConfig, DnsAddressProvider,
    FileAddressProvider, PeerContext, PeerInfo, PeerPool, ProviderConfig, SyncLimits,
};
use dscuss_shared::constants::DEFAULT_PORT;
use dscuss_shared::entity::is_valid_nickname;
use dscuss_shared::types::now;
use dscuss_shared::{
    pow, Entity, Id, Message, Operation, OperationType, PrivateKey, Reason, Subscriptions, Thread,
    Topic, User,
};
use dscuss_store::{EntityStore, ProfileStore, UserHistory};

use crate::config::{AddressSource, Config};
use crate::error::{DscussError, Result};
use crate::view::View;

pub const PRIVKEY_FILE: &str = "privkey.pem";
pub const ENTITIES_DB: &str = "entities.db";
pub const PROFILE_DB: &str = "profile.db";
pub const SUBSCRIPTIONS_FILE: &str = "subscriptions.txt";
pub const ADDRESSES_FILE: &str = "addresses";

/// A node directory. At most one user is logged in at a time.
pub struct Dscuss {
    dir: PathBuf,
    config: Config,
    session: Option<Session>,
}

impl Dscuss {
    /// Open `dir`, creating it and a default `config.json` if needed.
    pub fn init(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let config = Config::load_or_init(dir)?;
        info!(dir = %dir.display(), "node directory initialised");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            session: None,
        })
    }

    /// Open `dir` with an explicit configuration, persisting it.
    pub fn with_config(dir: &Path, config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;
        config.save(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            session: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn owner_dir(&self, nickname: &str) -> Result<PathBuf> {
        if !is_valid_nickname(nickname) {
            return Err(DscussError::WrongNickname(nickname.to_string()));
        }
        Ok(self.dir.join(nickname))
    }

    pub fn is_registered(&self, nickname: &str) -> bool {
        self.owner_dir(nickname)
            .map(|d| d.join(PRIVKEY_FILE).exists())
            .unwrap_or(false)
    }

    /// Create a new user: generate a key, solve the proof of work over its
    /// public key, and lay out the user's directory.
    ///
    /// `subscriptions` holds one topic per line.
    pub async fn register(&self, nickname: &str, info: &str, subscriptions: &str) -> Result<User> {
        let owner_dir = self.owner_dir(nickname)?;
        if owner_dir.join(PRIVKEY_FILE).exists() {
            return Err(DscussError::AlreadyRegistered(nickname.to_string()));
        }
        let subs = Subscriptions::parse_lines(subscriptions)?;
        if subs.is_empty() {
            return Err(DscussError::WrongArguments("at least one topic is required".into()));
        }

        let key = PrivateKey::generate();
        let der = key.public_key().to_der();
        let difficulty = self.config.pow_difficulty;
        info!(nickname, difficulty, "searching for proof of work");
        let proof = tokio::task::spawn_blocking(move || {
            pow::find(&der, difficulty, &AtomicBool::new(false))
        })
        .await
        .map_err(|e| DscussError::Internal(format!("proof-of-work task: {e}")))??;

        let user = User::emerge(&key, proof, nickname, info, now())?;

        std::fs::create_dir_all(&owner_dir)?;
        subs.save(&owner_dir.join(SUBSCRIPTIONS_FILE))?;
        let store = EntityStore::open(&owner_dir.join(ENTITIES_DB))?;
        store.put_user(&user)?;
        ProfileStore::open(&owner_dir.join(PROFILE_DB), user.id())?;
        // Written last: its presence marks the registration complete.
        key.save(&owner_dir.join(PRIVKEY_FILE))?;

        info!(nickname, user = %user.id().short(), proof, "user registered");
        Ok(user)
    }

    /// Open the user's stores and, unless the node is configured offline,
    /// start talking to peers.
    pub async fn login(&mut self, nickname: &str) -> Result<&mut Session> {
        if self.session.is_some() {
            return Err(DscussError::AlreadyLoggedIn);
        }
        let owner_dir = self.owner_dir(nickname)?;
        let key_path = owner_dir.join(PRIVKEY_FILE);
        if !key_path.exists() {
            return Err(DscussError::NoSuchUser(nickname.to_string()));
        }

        let key = PrivateKey::load(&key_path)?;
        let store = Arc::new(EntityStore::open(&owner_dir.join(ENTITIES_DB))?);
        let user_id = Id::digest(&key.public_key().to_der());
        let user = store.get_user(&user_id).map_err(|e| {
            DscussError::Database(format!("owner {} not in entity store: {e}", user_id.short()))
        })?;
        let profile = ProfileStore::open(&owner_dir.join(PROFILE_DB), user_id)?;
        let subscriptions = Subscriptions::load(&owner_dir.join(SUBSCRIPTIONS_FILE))
            .map_err(|e| DscussError::Parsing(format!("{SUBSCRIPTIONS_FILE}: {e}")))?;

        let mut session = Session {
            dir: owner_dir,
            config: self.config.clone(),
            key,
            user,
            store,
            profile,
            subscriptions,
            pool: None,
        };
        session.start_pool().await?;
        info!(nickname, user = %user_id.short(), "logged in");
        Ok(self.session.insert(session))
    }

    pub fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(DscussError::NotLoggedIn)
    }

    pub fn session_mut(&mut self) -> Result<&mut Session> {
        self.session.as_mut().ok_or(DscussError::NotLoggedIn)
    }

    pub fn is_logged_in(&self) -> bool {
        self.session.is_some()
    }

    pub async fn logout(&mut self) -> Result<()> {
        let mut session = self.session.take().ok_or(DscussError::NotLoggedIn)?;
        session.stop_pool().await;
        info!(nickname = %session.user.nickname(), "logged out");
        Ok(())
    }

    /// Log out if needed and release the directory.
    pub async fn uninit(mut self) {
        if self.session.is_some() {
            let _ = self.logout().await;
        }
        info!(dir = %self.dir.display(), "node directory released");
    }
}

/// A logged-in user: its stores, its subscriptions and, when online, the
/// running peer pool.
pub struct Session {
    dir: PathBuf,
    config: Config,
    key: PrivateKey,
    user: User,
    store: Arc<EntityStore>,
    profile: ProfileStore,
    subscriptions: Subscriptions,
    pool: Option<PeerPool>,
}

impl Session {
    fn address_provider(&self) -> Box<dyn AddressProvider> {
        match self.config.address_provider {
            AddressSource::File => Box::new(FileAddressProvider::new(&self.dir.join(ADDRESSES_FILE))),
            AddressSource::Dht => Box::new(DhtAddressProvider::new(DhtConfig {
                dht_port: self.config.dht_port,
                tcp_port: self.config.port,
                bootstrap: self.config.dht_bootstrap.clone(),
                subscriptions: self.subscriptions.clone(),
            })),
            AddressSource::Dns => Box::new(DnsAddressProvider::new(&self.config.dns_seed, DEFAULT_PORT)),
        }
    }

    async fn start_pool(&mut self) -> Result<()> {
        if self.config.offline {
            info!("offline mode, peer subsystem not started");
            return Ok(());
        }
        let ctx = Arc::new(PeerContext {
            store: self.store.clone(),
            key: self.key.clone(),
            user: self.user.clone(),
            subscriptions: self.subscriptions.clone(),
            pow_difficulty: self.config.pow_difficulty,
            sync_limits: SyncLimits::default(),
        });
        let provider = ConnectionProvider::new(
            ProviderConfig {
                listen_addr: self.config.listen_addr(),
                max_in_conn: self.config.max_in_connections,
                max_out_conn: self.config.max_out_connections,
                bootstrap: self.config.bootstrap_addresses.clone(),
            },
            self.address_provider(),
        );
        self.pool = Some(PeerPool::start(ctx, provider).await?);
        Ok(())
    }

    async fn stop_pool(&mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.stop().await;
        }
    }

    fn view(&self) -> View<'_> {
        View::new(&self.store, &self.profile)
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// Address peers can reach us on, when online.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.pool.as_ref().and_then(PeerPool::local_addr)
    }

    // -- Reads --------------------------------------------------------------

    pub fn get_user(&self, id: &Id) -> Result<User> {
        Ok(self.store.get_user(id)?)
    }

    /// Unmoderated: a hidden message is still reachable by id.
    pub fn get_message(&self, id: &Id) -> Result<Message> {
        Ok(self.store.get_message(id)?)
    }

    /// Thread roots, oldest first, minus what moderators hid.
    pub fn list_board(&self, offset: u32, limit: u32) -> Result<Vec<Message>> {
        let roots = self.store.get_root_messages(offset, limit)?;
        self.view().moderate_messages(roots)
    }

    pub fn list_topic(&self, topic: &str, offset: u32, limit: u32) -> Result<Vec<Message>> {
        let topic: Topic = topic.parse()?;
        let roots = self.store.get_topic_messages(&topic, offset, limit)?;
        self.view().moderate_messages(roots)
    }

    /// `None` when the root is hidden.
    pub fn list_thread(&self, root_id: &Id) -> Result<Option<Thread>> {
        let thread = self.store.get_thread(root_id)?;
        self.view().moderate_thread(&thread)
    }

    pub fn list_operations_on_user(&self, id: &Id) -> Result<Vec<Operation>> {
        Ok(self.store.get_operations_on_user(id)?)
    }

    pub fn list_operations_on_message(&self, id: &Id) -> Result<Vec<Operation>> {
        Ok(self.store.get_operations_on_message(id)?)
    }

    pub fn list_peers(&self) -> Vec<PeerInfo> {
        self.pool.as_ref().map(PeerPool::list_peers).unwrap_or_default()
    }

    pub fn list_user_history(&self) -> Result<Vec<UserHistory>> {
        Ok(self.store.list_user_history()?)
    }

    pub fn list_subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// The owner first.
    pub fn list_moderators(&self) -> Result<Vec<Id>> {
        Ok(self.profile.get_moderators()?)
    }

    pub fn is_user_banned(&self, id: &Id) -> Result<bool> {
        self.view().is_user_banned(id)
    }

    // -- Writes -------------------------------------------------------------

    /// Store an entity and announce it to every connected peer.
    pub fn post_entity(&self, entity: &Entity) -> Result<bool> {
        Ok(self.store.put_entity(entity, None)?)
    }

    pub fn new_thread(&self, subject: &str, text: &str, topic: &str) -> Result<Message> {
        let topic: Topic = topic.parse()?;
        let msg = Message::emerge(
            &self.key,
            self.user.id(),
            subject,
            text,
            Id::ZERO,
            Some(topic),
            now(),
        )?;
        self.post_entity(&msg.clone().into())?;
        info!(msg = %msg.id().short(), "thread started");
        Ok(msg)
    }

    pub fn new_reply(&self, subject: &str, text: &str, parent_id: &Id) -> Result<Message> {
        if !self.store.has_message(parent_id)? {
            return Err(DscussError::WrongArguments(format!(
                "no such parent message {}",
                parent_id.short()
            )));
        }
        let msg = Message::emerge(
            &self.key,
            self.user.id(),
            subject,
            text,
            *parent_id,
            None,
            now(),
        )?;
        self.post_entity(&msg.clone().into())?;
        info!(msg = %msg.id().short(), parent = %parent_id.short(), "reply posted");
        Ok(msg)
    }

    pub fn new_operation(
        &self,
        op_type: OperationType,
        reason: Reason,
        comment: &str,
        object_id: &Id,
    ) -> Result<Operation> {
        let op = Operation::emerge(
            &self.key,
            op_type,
            reason,
            comment,
            self.user.id(),
            *object_id,
            now(),
        )?;
        self.post_entity(&op.clone().into())?;
        info!(op = %op.id().short(), object = %object_id.short(), kind = op_type.as_str(), "operation performed");
        Ok(op)
    }

    /// Takes effect for peers on the next [`Session::relogin`].
    pub fn subscribe(&mut self, topic: &str) -> Result<()> {
        let topic: Topic = topic.parse()?;
        if !self.subscriptions.add_topic(topic.clone()) {
            return Err(DscussError::AlreadySubscribed(topic.to_string()));
        }
        self.subscriptions.save(&self.dir.join(SUBSCRIPTIONS_FILE))?;
        info!(%topic, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let topic: Topic = topic.parse()?;
        if !self.subscriptions.remove_topic(&topic) {
            return Err(DscussError::NotSubscribed(topic.to_string()));
        }
        if self.subscriptions.is_empty() {
            warn!("no subscriptions left, peers will offer no messages");
        }
        self.subscriptions.save(&self.dir.join(SUBSCRIPTIONS_FILE))?;
        info!(%topic, "unsubscribed");
        Ok(())
    }

    pub fn add_moderator(&self, id: &Id) -> Result<()> {
        Ok(self.profile.add_moderator(id)?)
    }

    pub fn remove_moderator(&self, id: &Id) -> Result<()> {
        Ok(self.profile.remove_moderator(id)?)
    }

    /// Restart the peer subsystem so peers see the current subscriptions.
    pub async fn relogin(&mut self) -> Result<()> {
        self.stop_pool().await;
        self.start_pool().await?;
        info!(nickname = %self.user.nickname(), "peer subsystem restarted");
        Ok(())
    }
}
