// nextdesk-relay: realtime collaboration relay for shared documents.

pub mod admission;
pub mod config;
pub mod cors;
pub mod memory;
pub mod protocol;
pub mod replica;
pub mod room;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod state;
