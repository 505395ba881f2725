//! HTTP submission port (8080) fingerprint.
//!
//! The servers only reveal a sensible return code once a packet is actually
//! posted, which we don't want to do. A plain GET yields a flavor-specific
//! error code instead, and none of the supported servers send a `Server:`
//! header on this port, so that pair is the fingerprint.

use std::net::IpAddr;
use std::time::Instant;

use aprs2_model::Software;

use super::Af;
use crate::logbuf::PollLog;

pub const SUBMIT_PORT: u16 = 8080;

fn expected_status(software: Software) -> u16 {
    match software {
        Software::Aprsc => 501,  // Not implemented
        Software::Javap3 => 400, // Bad request
        Software::Javap4 => 405, // Method not allowed
    }
}

/// Probe the submit port on one address. Returns the round-trip time when
/// the port fingerprint matches; failures are informational only.
pub async fn probe(
    client: &reqwest::Client,
    af: Af,
    addr: IpAddr,
    port: u16,
    software: Software,
    log: &mut PollLog,
) -> Option<f64> {
    let url = match addr {
        IpAddr::V4(v4) => format!("http://{v4}:{port}/"),
        IpAddr::V6(v6) => format!("http://[{v6}]:{port}/"),
    };

    let started = Instant::now();
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            log.info(format_args!("HTTP submit 8080 {af}: Connection error: {e}"));
            return None;
        }
    };
    let rtt = started.elapsed().as_secs_f64();

    if let Some(server) = response.headers().get(reqwest::header::SERVER) {
        log.info(format_args!(
            "HTTP submit 8080 {af}: Reports Server: {server:?} - not a HTTP submit port!"
        ));
        return None;
    }

    let expected = expected_status(software);
    if response.status().as_u16() != expected {
        log.info(format_args!(
            "HTTP submit 8080 {af}: return code {} != expected {expected} - not a HTTP submit port!",
            response.status().as_u16()
        ));
        return None;
    }

    log.info(format_args!(
        "HTTP submit 8080 {af}: return code {expected} - OK, looks like a submit port ({rtt:.3} s)"
    ));

    Some(rtt)
}
