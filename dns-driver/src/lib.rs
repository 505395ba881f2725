//! aprs2.net DNS driver: fuses the pollers' results into one availability
//! picture per server, selects the members of each DNS rotate and pushes
//! change-suppressed record sets to the authoritative name servers.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod driver;
pub mod fetch;
pub mod merge;
pub mod publish;
pub mod rotate;
pub mod settings;
