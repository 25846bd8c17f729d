//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed only because it's needed by the port crates.
mod init;
pub mod intrusive_list;
mod tick_count;

pub use self::{init::Init, tick_count::TickCount};
