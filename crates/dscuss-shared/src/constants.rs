use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "dscuss";

/// Default TCP listen port
pub const DEFAULT_PORT: u16 = 8004;

/// Default UDP port for the DHT swarm
pub const DEFAULT_DHT_PORT: u16 = 8005;

/// Bootstrap endpoint seeded into every address provider
pub const DEFAULT_BOOTSTRAP_ADDRESS: &str = "dscuss.org:8004";

/// DNS name whose A records list well-known nodes
pub const DEFAULT_DNS_SEED: &str = "seed.dscuss.org";

/// Identity proof-of-work
pub const POW_SALT: &[u8] = b"dscuss-proof-of-work";
pub const DEFAULT_POW_DIFFICULTY: u32 = 16;
pub const POW_SCRYPT_LOG_N: u8 = 15; // N = 32768
pub const POW_SCRYPT_R: u32 = 8;
pub const POW_SCRYPT_P: u32 = 1;
pub const POW_HASH_LEN: usize = 32;
pub const MAX_POW_DIFFICULTY: u32 = (POW_HASH_LEN * 8) as u32;

/// Entity content limits
pub const MAX_NICKNAME_LEN: usize = 64;
pub const MAX_INFO_LEN: usize = 1024;
pub const MAX_SUBJECT_LEN: usize = 128;
pub const MAX_TEXT_LEN: usize = 16 * 1024;
pub const MAX_OPERATION_COMMENT_LEN: usize = 512;

/// Tags per topic; every combination becomes a DHT key
pub const MAX_TOPIC_TAGS: usize = 16;

/// Largest packet accepted on the wire (64 KiB)
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// ECDSA P-224 signature: R || S, each left-padded to 28 bytes
pub const SIGNATURE_SIZE: usize = 56;

/// Synchronisation bounds for a single sync turn
pub const MAX_SYNC_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const MAX_SYNC_NUMBER_OF_MESSAGES: u32 = 1000;
pub const MAX_SYNC_NUMBER_OF_OPERATIONS: u32 = 1000;
/// Rows fetched per store query while scanning a sync window
pub const SYNC_BATCH_SIZE: u32 = 200;

/// Accepted difference between a peer's hello timestamp and ours
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Per-call network deadline
pub const IO_DEADLINE: Duration = Duration::from_secs(1);

/// How long a peer waits for the reply to an announcement or request
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// How many missing prerequisites a received entity may chain
pub const MAX_PENDING_DEPENDENCIES: usize = 8;

/// Capacity of each store observer channel
pub const OBSERVER_CHANNEL_CAPACITY: usize = 256;

/// DNS-over-HTTPS upstreams used for seed lookups
pub const DOH_CLOUDFLARE: &str = "1.1.1.1";
pub const DOH_GOOGLE: &str = "8.8.8.8";

/// How often the DHT and DNS providers refresh their results
pub const ADDRESS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Protocol string advertised through libp2p identify
pub const DHT_PROTOCOL_VERSION: &str = "/dscuss/1.0.0";
