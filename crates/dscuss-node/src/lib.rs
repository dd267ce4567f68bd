//! # dscuss-node
//!
//! The owner-facing side of a dscuss node. [`Dscuss`] manages the node
//! directory and user registration; logging in yields a [`Session`] that
//! reads the board through the owner's moderators, authors new entities and
//! runs the peer pool that keeps the local store in sync with the network.

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod view;

pub use config::{AddressSource, Config};
pub use error::{DscussError, Result};
pub use session::{Dscuss, Session};
pub use view::View;
