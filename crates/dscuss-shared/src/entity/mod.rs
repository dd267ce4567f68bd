//! Signed records exchanged between nodes.

mod message;
mod operation;
mod user;

use std::fmt;

pub use message::Message;
pub use operation::{Operation, OperationType, Reason};
pub use user::{is_valid_nickname, User};

use crate::types::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Message,
    Operation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::User => "user",
            EntityKind::Message => "message",
            EntityKind::Operation => "operation",
        };
        f.write_str(s)
    }
}

/// Any stored or transferred entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    User(User),
    Message(Message),
    Operation(Operation),
}

impl Entity {
    pub fn id(&self) -> Id {
        match self {
            Entity::User(u) => u.id(),
            Entity::Message(m) => m.id(),
            Entity::Operation(o) => o.id(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Message(_) => EntityKind::Message,
            Entity::Operation(_) => EntityKind::Operation,
        }
    }
}

impl From<User> for Entity {
    fn from(u: User) -> Self {
        Entity::User(u)
    }
}

impl From<Message> for Entity {
    fn from(m: Message) -> Self {
        Entity::Message(m)
    }
}

impl From<Operation> for Entity {
    fn from(o: Operation) -> Self {
        Entity::Operation(o)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id().short())
    }
}
