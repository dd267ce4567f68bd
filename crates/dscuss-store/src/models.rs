//! Records persisted next to the entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dscuss_shared::{Id, Subscriptions};

/// What we remember about a peer user after disconnecting from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserHistory {
    pub user_id: Id,
    /// When the last connection to this user closed.
    pub disconnected: DateTime<Utc>,
    /// Subscriptions the user announced in its last handshake.
    pub subscriptions: Subscriptions,
    /// `TimeStored` of the last message our sync turn got through, when
    /// the turn stopped short of its window. The next turn resumes there.
    pub messages_cursor: Option<DateTime<Utc>>,
    pub operations_cursor: Option<DateTime<Utc>>,
}
