//! javAPRSSrvr 3.x probe: scrape the HTML front page.
//!
//! This flavor has no machine-readable status endpoint and is recognized
//! only by the *absence* of a `Server:` header on `GET /`, so it must be
//! probed before the other flavors.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::LazyLock;
use std::time::Instant;

use aprs2_model::{PollError, Props, Software, Uplink};
use regex::Regex;

use super::{Detection, STATUS_PORT, load_pct, map_addr_id};

static RE_ID: LazyLock<Regex> = LazyLock::new(|| re("<TD[^>]*>Server ID</TD><TD>([^>]+)</TD>"));
static RE_OS: LazyLock<Regex> = LazyLock::new(|| re("<TD[^>]*>OS</TD><TD>([^>]+)</TD>"));
static RE_SOFT: LazyLock<Regex> =
    LazyLock::new(|| re(r"<TH[^>]*>(javAPRSSrvr) \d+\.\d+[^>]+<BR>"));
static RE_VERS: LazyLock<Regex> =
    LazyLock::new(|| re(r"<TH[^>]*>javAPRSSrvr (\d+\.\d+[^>]+)<BR>"));
static RE_UPTIME: LazyLock<Regex> =
    LazyLock::new(|| re("<TD[^>]*>Total Up Time</TD><TD>([^>]+)</TD></TR>"));

static RE_CLIENTS: LazyLock<Regex> =
    LazyLock::new(|| re(r"<TD[^>]*>Current Inbound Connections</TD><TD>([\d,\.' ]+)</TD>"));
static RE_CLIENTS_MAX: LazyLock<Regex> =
    LazyLock::new(|| re(r"<TD[^>]*>Maximum Inbound Connections</TD><TD>([\d,\.' ]+)</TD>"));
static RE_CONNECTS: LazyLock<Regex> =
    LazyLock::new(|| re(r"<TD[^>]*>Total Inbound Connects</TD><TD>([\d,\.' ]+)</TD>"));
static RE_BYTES_IN: LazyLock<Regex> =
    LazyLock::new(|| re("<TD[^>]*>Total Bytes In</TD><TD>([^<]+)</TD>"));
static RE_BYTES_OUT: LazyLock<Regex> =
    LazyLock::new(|| re("<TD[^>]*>Total Bytes Out</TD><TD>([^<]+)</TD>"));

static RE_OUTBOUND: LazyLock<Regex> =
    LazyLock::new(|| re("(?s)<TH[^>]*>Outbound Connections</TH>.*?<TR[^>]*>.*?</TR>(.*?)</TBODY>"));
static RE_OUTBOUND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    re(concat!(
        r"<TR[^>]*><TD[^>]*><A[^>]+>([^/<]+)/([^<]+)</A></TD>",
        r"<TD[^>]*>(.*?)</TD><TD[^>]*>(.*?)</TD><TD[^>]*>(.*?)</TD><TD[^>]*>(.*?)</TD>",
        r"<TD>(.*?)</TD><TD>(.*?)</TD><TD>(.*?)</TD><TD>(.*?)</TD><TD>(.*?)</TD><TD>(.*?)</TD><TD>(.*?)</TD>",
        r"(.*)"
    ))
});

static RE_UPTIME_PART: LazyLock<Regex> = LazyLock::new(|| re(r"^(\d+)(\.\d+)?([dhms])(.*)"));
static RE_NON_DIGIT: LazyLock<Regex> = LazyLock::new(|| re(r"[^\d]+"));

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex")
}

pub async fn probe(
    client: &reqwest::Client,
    ipv4: Ipv4Addr,
    address_map: &HashMap<String, String>,
) -> Detection {
    let url = format!("http://{ipv4}:{STATUS_PORT}/");

    let started = Instant::now();
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /: Connection error: {e}"),
            ));
        }
    };

    if let Some(server) = response.headers().get(reqwest::header::SERVER) {
        tracing::debug!(?server, "Reports a Server header, not javAPRSSrvr 3.x");
        return Detection::NotThisType;
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /: read error: {e}"),
            ));
        }
    };
    let rtt = started.elapsed().as_secs_f64();

    if !body.contains("javAPRSSrvr 3.") && !body.contains("Pete Loveall AE5PL") {
        return Detection::Broken(PollError::new(
            "web-parse-fail",
            "status page HTML does not mention javAPRSSrvr 3",
        ));
    }

    match parse(&body, address_map) {
        Ok(props) => Detection::Alive { rtt, props },
        Err(e) => Detection::Broken(e),
    }
}

fn parse_fail(msg: impl Into<String>) -> PollError {
    PollError::new("web-parse-fail", msg)
}

/// Parse an integer that may carry locale-dependent thousands separators:
/// `78,527,080`, `78.527.080`, `78'527'080` or `78 527 080`.
fn numeric(s: &str) -> Option<f64> {
    let digits = RE_NON_DIGIT.replace_all(s, "");
    if digits.is_empty() {
        return None;
    }

    digits.parse().ok()
}

/// Decode an uptime string like `132d18h34m27.215s` to whole seconds.
fn decode_uptime(s: &str) -> i64 {
    let mut left = s;
    let mut up = 0;

    while let Some(m) = RE_UPTIME_PART.captures(left) {
        let value: i64 = m[1].parse().unwrap_or(0);
        let mul = match &m[3] {
            "d" => 86400,
            "h" => 3600,
            "m" => 60,
            _ => 1,
        };
        up += value * mul;

        let rest = m.get(4).map(|g| g.range()).unwrap_or_default();
        left = &left[rest];
        if left.is_empty() {
            break;
        }
    }

    up
}

/// Parse the javAPRSSrvr 3.x HTML status page into poll properties.
pub fn parse(body: &str, address_map: &HashMap<String, String>) -> Result<Props, PollError> {
    let mut props = Props {
        software: Some(Software::Javap3),
        ..Props::default()
    };

    let scalar = |regex: &Regex, name: &str| -> Result<String, PollError> {
        regex
            .captures(body)
            .map(|m| m[1].to_owned())
            .ok_or_else(|| {
                parse_fail(format!("javAPRSSrvr 3.x status page does not have '{name}'"))
            })
    };

    props.id = Some(scalar(&RE_ID, "id")?);
    props.os = Some(scalar(&RE_OS, "os")?);
    props.soft = Some(scalar(&RE_SOFT, "soft")?);
    props.vers = Some(scalar(&RE_VERS, "vers")?);
    let uptime_raw = scalar(&RE_UPTIME, "uptime")?;

    let number = |regex: &Regex, name: &str| -> Result<f64, PollError> {
        let raw = regex
            .captures(body)
            .map(|m| m[1].to_owned())
            .ok_or_else(|| {
                parse_fail(format!(
                    "javAPRSSrvr 3.x status page does not have numeric '{name}'"
                ))
            })?;

        numeric(&raw).ok_or_else(|| {
            parse_fail(format!(
                "javAPRSSrvr 3.x status page, numeric '{name}' parsing failed"
            ))
        })
    };

    let clients = number(&RE_CLIENTS, "clients")? as i64;
    let clients_max = number(&RE_CLIENTS_MAX, "clients_max")? as i64;
    props.clients = Some(clients);
    props.clients_max = Some(clients_max);
    props.connects = Some(number(&RE_CONNECTS, "connects")? as i64);
    props.total_bytes_in = Some(number(&RE_BYTES_IN, "total_bytes_in")?);
    props.total_bytes_out = Some(number(&RE_BYTES_OUT, "total_bytes_out")?);

    props.uptime = Some(decode_uptime(&uptime_raw));

    let load = load_pct(clients, clients_max);
    props.user_load = Some(load);
    props.worst_load = Some(load);

    if let Some(table) = RE_OUTBOUND.captures(body) {
        let mut uplinks = Vec::new();
        let mut left = table.get(1).map(|g| g.as_str()).unwrap_or_default();

        while let Some(m) = RE_OUTBOUND_LINE.captures(left) {
            let addr_rem = m[2].to_owned();

            uplinks.push(Uplink {
                id: map_addr_id(address_map, &addr_rem),
                addr_rem,
                up: decode_uptime(&m[6]),
                rx_last: decode_uptime(&m[13]) as f64,
                rx_packets: numeric(&m[7]).unwrap_or(0.0) as i64,
            });

            let rest = m.get(14).map(|g| g.range()).unwrap_or_default();
            let consumed_until = rest.start;
            left = &left[consumed_until..];
            if m.get(14).is_none_or(|g| g.as_str().is_empty()) {
                break;
            }
        }

        props.uplinks = Some(uplinks);
    }

    Ok(props)
}
