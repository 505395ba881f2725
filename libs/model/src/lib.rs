//! Shared domain types for the aprs2.net poller and DNS driver.
//!
//! Everything here round-trips through compact JSON: the same records are
//! written to the store, served from the poller's `/api/full` endpoint and
//! consumed by the DNS driver and the web UI.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// A registered APRS-IS server, as configured in the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    /// Rotate domains this server is a member of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub out_of_service: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub email_alerts: bool,
}

impl Server {
    pub fn fqdn(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        let domain = self.domain.as_deref()?;
        Some(format!("{host}.{domain}"))
    }

    pub fn is_member_of(&self, rotate: &str) -> bool {
        self.member.iter().any(|m| m == rotate)
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A DNS rotate and its member servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rotate {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Server software flavor, as detected from the HTTP status page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Software {
    Aprsc,
    Javap3,
    Javap4,
}

impl Software {
    pub fn as_str(&self) -> &'static str {
        match self {
            Software::Aprsc => "aprsc",
            Software::Javap3 => "javap3",
            Software::Javap4 => "javap4",
        }
    }
}

impl fmt::Display for Software {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream connection reported by a server's status page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uplink {
    /// Server ID of the remote end, or `"unknown"` if the address did not
    /// resolve through the address map.
    pub id: String,
    /// Remote address as reported, `host:port`.
    pub addr_rem: String,
    /// Connection uptime in seconds.
    pub up: i64,
    /// Seconds since data was last received from the connection.
    pub rx_last: f64,
    pub rx_packets: i64,
}

/// One component of a server's score: numeric value plus the human-readable
/// measurement it was derived from. Stored as a `[value, "string"]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, String)", into = "(f64, String)")]
pub struct ScoreComponent {
    pub value: f64,
    pub human: String,
}

impl From<(f64, String)> for ScoreComponent {
    fn from((value, human): (f64, String)) -> Self {
        Self { value, human }
    }
}

impl From<ScoreComponent> for (f64, String) {
    fn from(c: ScoreComponent) -> Self {
        (c.value, c.human)
    }
}

pub type Scorebase = BTreeMap<String, ScoreComponent>;

/// A polling error, stored as a `[code, message]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct PollError {
    pub code: String,
    pub message: String,
}

impl PollError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<(String, String)> for PollError {
    fn from((code, message): (String, String)) -> Self {
        Self { code, message }
    }
}

impl From<PollError> for (String, String) {
    fn from(e: PollError) -> Self {
        (e.code, e.message)
    }
}

impl fmt::Display for PollError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Properties extracted from a server during one poll.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Props {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub software: Option<Software>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    /// Server process uptime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_max: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connects: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes_out: Option<f64>,
    /// Load of the whole server, percent of configured client capacity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_load: Option<f64>,
    /// Worst per-listener load, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worst_load: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_bytes_in: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_bytes_out: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_connects: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uplinks: Option<Vec<Uplink>>,
    #[serde(
        rename = "submit-http-8080-ipv4",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub submit_http_ipv4: Option<f64>,
    #[serde(
        rename = "submit-http-8080-ipv6",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub submit_http_ipv6: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorebase: Option<Scorebase>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Ok,
    Fail,
}

impl ServerState {
    pub fn is_ok(&self) -> bool {
        matches!(self, ServerState::Ok)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Ok => f.write_str("ok"),
            ServerState::Fail => f.write_str("fail"),
        }
    }
}

/// The result of polling one server at one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: ServerState,
    /// Epoch seconds of the poll this record was produced by.
    pub last_test: i64,
    /// Epoch seconds of the last ok/fail transition.
    pub last_change: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PollError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail_3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail_30: Option<f64>,
}

/// Per-poll log entry stored alongside the status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLog {
    pub t: i64,
    pub log: String,
}

/// The DNS driver's fusion of all pollers' results for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedStatus {
    pub status: ServerState,
    /// `"{c_ok}/{c_res}"`, for the UI.
    pub c: String,
    pub c_ok: usize,
    pub c_res: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub props: Option<Props>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<PollError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail_3: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avail_30: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Per-site scorebase tables, keyed by site id, plus the synthetic
    /// `master` entry carrying the availability penalty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_scorebase: Option<BTreeMap<String, Scorebase>>,
    /// Union of all component names, for the UI table heading.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_score_keys: Option<Vec<String>>,
}

/// Aggregate statistics for one rotate (or the `total` pseudo-rotate).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotateStats {
    pub clients: i64,
    pub servers_ok: usize,
    pub servers: usize,
    pub rate_bytes_in: f64,
    pub rate_bytes_out: f64,
}

/// One server in the poller's `/api/full` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub config: Server,
    pub status: ServerStatus,
}

/// The poller's `/api/full` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStatus {
    pub result: String,
    pub servers: Vec<SnapshotEntry>,
}
