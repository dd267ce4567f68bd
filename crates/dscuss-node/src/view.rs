//! The owner's subjective view of the board.
//!
//! Nothing is ever deleted from the entity store. Instead, operations issued
//! by users the owner trusts as moderators hide content at read time:
//! `RemoveMessage` hides one message (and in a thread, its whole subtree),
//! `BanUser` hides everything the banned user wrote.

use dscuss_shared::{Id, Message, Node, Operation, OperationType, Thread};
use dscuss_store::{EntityStore, ProfileStore};

use crate::error::{DscussError, Result};

pub struct View<'a> {
    store: &'a EntityStore,
    profile: &'a ProfileStore,
}

impl<'a> View<'a> {
    pub fn new(store: &'a EntityStore, profile: &'a ProfileStore) -> Self {
        Self { store, profile }
    }

    fn moderated_by(&self, ops: Vec<Operation>, op_type: OperationType) -> Result<bool> {
        for op in ops {
            if op.op_type() == op_type && self.profile.is_moderator(&op.author_id())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_user_banned(&self, user_id: &Id) -> Result<bool> {
        let ops = self.store.get_operations_on_user(user_id)?;
        self.moderated_by(ops, OperationType::BanUser)
    }

    pub fn is_message_removed(&self, message_id: &Id) -> Result<bool> {
        let ops = self.store.get_operations_on_message(message_id)?;
        self.moderated_by(ops, OperationType::RemoveMessage)
    }

    /// `None` when a moderator removed the message or banned its author.
    pub fn moderate_message(&self, msg: Message) -> Result<Option<Message>> {
        if self.is_message_removed(&msg.id())? || self.is_user_banned(&msg.author_id())? {
            return Ok(None);
        }
        Ok(Some(msg))
    }

    pub fn moderate_messages(&self, msgs: Vec<Message>) -> Result<Vec<Message>> {
        let mut visible = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if let Some(msg) = self.moderate_message(msg)? {
                visible.push(msg);
            }
        }
        Ok(visible)
    }

    /// Drop hidden nodes together with their replies. `None` if the root
    /// itself is hidden.
    pub fn moderate_thread(&self, thread: &Thread) -> Result<Option<Thread>> {
        let mut failure: Option<DscussError> = None;
        let moderated = thread.moderate(&mut |node: &Node| {
            if failure.is_some() {
                return None;
            }
            self.moderate_message(node.message().clone())
                .unwrap_or_else(|e| {
                    failure = Some(e);
                    None
                })
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(moderated),
        }
    }
}
