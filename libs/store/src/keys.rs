//! Key layout in the shared store.

/// Hash of server configurations, field = server id.
pub const SERVER: &str = "aprs2.server";
/// Hash of per-server status records, field = server id.
pub const SERVER_STATUS: &str = "aprs2.serverstat";
/// Hash of per-server poll logs (latest only), field = server id.
pub const SERVER_LOG: &str = "aprs2.serverlog";
/// Hash of rotate configurations, field = rotate domain.
pub const ROTATE: &str = "aprs2.rotate";
/// Scalar holding the full address literal to server id map.
pub const ADDRESS_MAP: &str = "aprs2.addrmap";
/// Sorted set of server ids, score = next poll time (epoch seconds).
pub const POLL_QUEUE: &str = "aprs2.pollq";
/// Hash of availability buckets, field = `{id}.{dayEpoch}.{up|down}`.
pub const AVAIL: &str = "aprs2.avail";
/// Scalar: which servers participate in which rotates.
pub const ROTATE_STATUS: &str = "aprs2.rotatestatus";
/// Hash of per-rotate aggregate statistics, field = rotate domain.
pub const ROTATE_STATS: &str = "aprs2.rotatestats";
/// Scalar: configuration blob for the web UI.
pub const WEB_CONFIG: &str = "aprs2.webconfig";

/// Channel: a poller finished polling one server.
pub const CH_STATUS: &str = "aprs2.ch.status";
/// Channel: the DNS driver finished a full cycle.
pub const CH_STATUS_DNS: &str = "aprs2.ch.statusDns";
