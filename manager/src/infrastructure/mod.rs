//! Network, disk and process implementations of the master ports.

pub mod client;
pub mod media;
pub mod store;
