//! aprsc probe: `GET /status.json`.

use std::net::Ipv4Addr;
use std::time::Instant;

use aprs2_model::{PollError, Props, Software, Uplink};
use serde::Deserialize;

use super::{Detection, STATUS_PORT, load_pct};

pub async fn probe(client: &reqwest::Client, ipv4: Ipv4Addr) -> Detection {
    let url = format!("http://{ipv4}:{STATUS_PORT}/status.json");

    let started = Instant::now();
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /status.json: Connection error: {e}"),
            ));
        }
    };

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Detection::NotThisType;
    }
    if !response.status().is_success() {
        return Detection::Broken(PollError::new(
            "web-http-fail",
            format!("HTTP status page 14501 /status.json: status {}", response.status()),
        ));
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /status.json: read error: {e}"),
            ));
        }
    };
    let rtt = started.elapsed().as_secs_f64();

    match parse(&body) {
        Ok(props) => Detection::Alive { rtt, props },
        Err(e) => Detection::Broken(e),
    }
}

#[derive(Deserialize)]
struct StatusJson {
    server: Option<ServerBlock>,
    totals: Option<TotalsBlock>,
    listeners: Option<Vec<ListenerBlock>>,
    uplinks: Option<Vec<UplinkBlock>>,
}

#[derive(Deserialize)]
struct ServerBlock {
    server_id: Option<String>,
    software: Option<String>,
    software_version: Option<String>,
    os: Option<String>,
    uptime: Option<f64>,
}

#[derive(Deserialize)]
struct TotalsBlock {
    clients: Option<i64>,
    clients_max: Option<i64>,
    connects: Option<i64>,
    #[serde(default)]
    tcp_bytes_rx: f64,
    #[serde(default)]
    tcp_bytes_tx: f64,
    #[serde(default)]
    udp_bytes_rx: f64,
    #[serde(default)]
    udp_bytes_tx: f64,
    #[serde(default)]
    sctp_bytes_rx: f64,
    #[serde(default)]
    sctp_bytes_tx: f64,
}

#[derive(Deserialize)]
struct ListenerBlock {
    addr: Option<String>,
    proto: Option<String>,
    clients: Option<i64>,
    clients_max: Option<i64>,
}

#[derive(Deserialize)]
struct UplinkBlock {
    username: Option<String>,
    addr_rem: Option<String>,
    #[serde(default)]
    since_connect: i64,
    #[serde(default)]
    since_last_read: f64,
    #[serde(default)]
    pkts_rx: i64,
}

fn parse_fail(msg: impl Into<String>) -> PollError {
    PollError::new("web-parse-fail", msg)
}

/// Parse aprsc's `status.json` into poll properties.
pub fn parse(body: &str) -> Result<Props, PollError> {
    let status: StatusJson = serde_json::from_str(body)
        .map_err(|_| PollError::new("web-json-fail", "aprsc status.json JSON parsing failed"))?;

    let server = status
        .server
        .ok_or_else(|| parse_fail("aprsc status.json does not have a server block"))?;

    let mut props = Props {
        software: Some(Software::Aprsc),
        ..Props::default()
    };

    let missing =
        |block: &str, key: &str| parse_fail(format!(r#"aprsc status.json block "{block}" does not specify "{key}""#));

    props.id = Some(server.server_id.ok_or_else(|| missing("server", "server_id"))?);
    props.soft = Some(server.software.ok_or_else(|| missing("server", "software"))?);
    props.vers = Some(
        server
            .software_version
            .ok_or_else(|| missing("server", "software_version"))?,
    );
    props.os = Some(server.os.ok_or_else(|| missing("server", "os"))?);
    props.uptime = Some(server.uptime.ok_or_else(|| missing("server", "uptime"))? as i64);

    let totals = status
        .totals
        .ok_or_else(|| parse_fail("aprsc status.json does not have a totals block"))?;

    let clients = totals.clients.ok_or_else(|| missing("totals", "clients"))?;
    let clients_max = totals
        .clients_max
        .ok_or_else(|| missing("totals", "clients_max"))?;
    props.clients = Some(clients);
    props.clients_max = Some(clients_max);
    props.connects = Some(totals.connects.ok_or_else(|| missing("totals", "connects"))?);

    props.total_bytes_in = Some(totals.tcp_bytes_rx + totals.udp_bytes_rx + totals.sctp_bytes_rx);
    props.total_bytes_out = Some(totals.tcp_bytes_tx + totals.udp_bytes_tx + totals.sctp_bytes_tx);

    let u_load = load_pct(clients, clients_max);
    let mut worst_load = u_load;

    let listeners = status
        .listeners
        .ok_or_else(|| parse_fail("aprsc status.json does not have a listeners block"))?;

    for listener in &listeners {
        let proto = listener
            .proto
            .as_deref()
            .ok_or_else(|| parse_fail("aprsc status.json listener does not specify protocol"))?;
        if proto == "udp" {
            continue;
        }

        let (Some(clients), Some(clients_max)) = (listener.clients, listener.clients_max) else {
            return Err(parse_fail(
                "aprsc status.json listener does not specify number of clients",
            ));
        };

        let l_load = load_pct(clients, clients_max);
        tracing::debug!(
            addr = listener.addr.as_deref().unwrap_or("?"),
            clients,
            clients_max,
            load = l_load,
            "aprsc listener"
        );
        worst_load = worst_load.max(l_load);
    }

    props.user_load = Some(u_load);
    props.worst_load = Some(worst_load);

    if let Some(uplinks) = status.uplinks {
        props.uplinks = Some(
            uplinks
                .into_iter()
                .map(|u| Uplink {
                    id: u.username.unwrap_or_default(),
                    addr_rem: u.addr_rem.unwrap_or_default(),
                    up: u.since_connect,
                    rx_last: u.since_last_read,
                    rx_packets: u.pkts_rx,
                })
                .collect(),
        );
    }

    Ok(props)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HAPPY: &str = r#"{
        "server": {
            "server_id": "T2FINLAND",
            "software": "aprsc",
            "software_version": "2.1.15-g50579e9",
            "os": "Linux x86_64",
            "uptime": 864000.4,
            "time_started": 1700000000
        },
        "totals": {
            "clients": 17,
            "clients_max": 1000,
            "connects": 43122,
            "tcp_bytes_rx": 1000,
            "tcp_bytes_tx": 2000,
            "udp_bytes_rx": 10,
            "udp_bytes_tx": 20,
            "sctp_bytes_rx": 1,
            "sctp_bytes_tx": 2
        },
        "listeners": [
            { "addr": "0.0.0.0:14580", "proto": "tcp", "clients": 15, "clients_max": 500 },
            { "addr": "0.0.0.0:8080", "proto": "tcp", "clients": 2, "clients_max": 50 },
            { "addr": "0.0.0.0:8080", "proto": "udp" }
        ],
        "uplinks": [
            {
                "username": "T2HUB1",
                "addr_rem": "193.190.240.226:20152",
                "since_connect": 864000,
                "since_last_read": 2,
                "pkts_rx": 21334472
            }
        ]
    }"#;

    #[test]
    fn parses_a_healthy_server() {
        let props = parse(HAPPY).unwrap();

        assert_eq!(props.software, Some(Software::Aprsc));
        assert_eq!(props.id.as_deref(), Some("T2FINLAND"));
        assert_eq!(props.soft.as_deref(), Some("aprsc"));
        assert_eq!(props.vers.as_deref(), Some("2.1.15-g50579e9"));
        assert_eq!(props.uptime, Some(864000));
        assert_eq!(props.clients, Some(17));
        assert_eq!(props.clients_max, Some(1000));
        assert_eq!(props.connects, Some(43122));
        assert_eq!(props.total_bytes_in, Some(1011.0));
        assert_eq!(props.total_bytes_out, Some(2022.0));
        assert!((props.user_load.unwrap() - 1.7).abs() < 1e-9);
        // The 8080 TCP listener runs 2/50 = 4 %, worse than the overall
        // 1.7 %; the UDP listener is skipped.
        assert!((props.worst_load.unwrap() - 4.0).abs() < 1e-9);

        let uplinks = props.uplinks.unwrap();
        assert_eq!(uplinks.len(), 1);
        assert_eq!(uplinks[0].id, "T2HUB1");
        assert_eq!(uplinks[0].up, 864000);
        assert_eq!(uplinks[0].rx_last, 2.0);
    }

    #[test]
    fn garbage_is_a_json_failure() {
        let e = parse("<html>not json</html>").unwrap_err();
        assert_eq!(e.code, "web-json-fail");
    }

    #[test]
    fn missing_server_block_is_a_parse_failure() {
        let e = parse(r#"{"totals": {}}"#).unwrap_err();
        assert_eq!(e.code, "web-parse-fail");
        assert!(e.message.contains("server block"));
    }

    #[test]
    fn missing_mandatory_key_names_the_key() {
        let body = r#"{
            "server": { "software": "aprsc", "software_version": "2", "os": "L", "uptime": 1 },
            "totals": { "clients": 1, "clients_max": 10, "connects": 1 },
            "listeners": []
        }"#;
        let e = parse(body).unwrap_err();
        assert_eq!(e.code, "web-parse-fail");
        assert!(e.message.contains("server_id"), "{}", e.message);
    }

    #[test]
    fn listener_without_proto_is_a_parse_failure() {
        let body = r#"{
            "server": { "server_id": "X", "software": "aprsc", "software_version": "2", "os": "L", "uptime": 1 },
            "totals": { "clients": 1, "clients_max": 10, "connects": 1 },
            "listeners": [ { "addr": "0.0.0.0:14580" } ]
        }"#;
        let e = parse(body).unwrap_err();
        assert_eq!(e.code, "web-parse-fail");
        assert!(e.message.contains("protocol"));
    }
}
