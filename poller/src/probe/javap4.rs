//! javAPRSSrvr 4 probe: `GET /detail.xml`.

use std::net::Ipv4Addr;
use std::time::Instant;

use aprs2_model::{PollError, Props, Software, Uplink};
use roxmltree::Node;

use super::{Detection, STATUS_PORT, load_pct};

pub async fn probe(client: &reqwest::Client, ipv4: Ipv4Addr) -> Detection {
    let url = format!("http://{ipv4}:{STATUS_PORT}/detail.xml");

    let started = Instant::now();
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /detail.xml: Connection error: {e}"),
            ));
        }
    };

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Detection::NotThisType;
    }
    if !response.status().is_success() {
        return Detection::Broken(PollError::new(
            "web-http-fail",
            format!("HTTP status page 14501 /detail.xml: status {}", response.status()),
        ));
    }

    let body = match response.text().await {
        Ok(b) => b,
        Err(e) => {
            return Detection::Broken(PollError::new(
                "web-http-fail",
                format!("HTTP status page 14501 /detail.xml: read error: {e}"),
            ));
        }
    };
    let rtt = started.elapsed().as_secs_f64();

    match parse(&body) {
        Ok(props) => Detection::Alive { rtt, props },
        Err(e) => Detection::Broken(e),
    }
}

fn parse_fail(msg: impl Into<String>) -> PollError {
    PollError::new("web-parse-fail", msg)
}

fn child<'a, 'b>(node: Node<'a, 'b>, name: &str) -> Option<Node<'a, 'b>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn require<'a, 'b>(node: Node<'a, 'b>, name: &str) -> Result<Node<'a, 'b>, PollError> {
    child(node, name).ok_or_else(|| parse_fail(format!("detail.xml: No '{name}' tag found")))
}

fn attr_num<T: std::str::FromStr>(node: Node, attr: &str) -> Result<T, PollError> {
    node.attribute(attr)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            parse_fail(format!(
                "detail.xml: '{}' tag has no numeric '{attr}' attribute",
                node.tag_name().name()
            ))
        })
}

/// Parse javAPRSSrvr 4's `detail.xml` into poll properties.
pub fn parse(body: &str) -> Result<Props, PollError> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| PollError::new("web-xml-fail", format!("detail.xml XML parsing failed: {e}")))?;

    let root = doc.root_element();
    if root.tag_name().name() != "javaprssrvr" {
        return Err(parse_fail("detail.xml: root tag is not javaprssrvr"));
    }

    let mut props = Props {
        software: Some(Software::Javap4),
        ..Props::default()
    };

    let software = require(root, "software")?;
    let (Some(name), Some(version)) = (software.text(), software.attribute("version")) else {
        return Err(parse_fail("detail.xml: Application name or version missing"));
    };
    props.soft = Some(name.to_owned());
    props.vers = Some(version.to_owned());

    let dupeprocessor = require(root, "dupeprocessor")?;
    props.id = require(dupeprocessor, "servercall")?
        .text()
        .map(|t| t.to_owned());

    let java = require(root, "java")?;
    let os = require(java, "os")?;
    props.os = Some(format!(
        "{} {}",
        os.text().unwrap_or_default(),
        os.attribute("architecture").unwrap_or_default()
    ));

    let time = require(java, "time")?;
    let up = child(time, "up").ok_or_else(|| parse_fail("detail.xml: No 'up' uptime tag found"))?;
    props.uptime = Some(attr_num::<i64>(up, "millis")? / 1000);

    let listeners = require(root, "listenerports")?;
    let connections = child(listeners, "connections").ok_or_else(|| {
        parse_fail("detail.xml: No 'connections' tag found for 'listenerports'")
    })?;
    let clients: i64 = attr_num(connections, "currentin")?;
    let clients_max: i64 = attr_num(connections, "maximum")?;
    props.clients = Some(clients);
    props.clients_max = Some(clients_max);

    let clients_tag = require(root, "clients")?;
    props.connects = Some(attr_num(clients_tag, "total")?);
    props.total_bytes_in = Some(attr_num(require(clients_tag, "rcvdtotals")?, "bytes")?);
    props.total_bytes_out = Some(attr_num(require(clients_tag, "xmtdtotals")?, "bytes")?);

    let load = load_pct(clients, clients_max);
    props.user_load = Some(load);
    props.worst_load = Some(load);

    props.uplinks = Some(parse_uplinks(clients_tag, time)?);

    Ok(props)
}

fn parse_uplinks(clients_tag: Node, time_tag: Node) -> Result<Vec<Uplink>, PollError> {
    let mut uplinks = Vec::new();

    // Uplink uptimes are relative to the server's own clock, which can be
    // wildly off when it runs without NTP.
    let current = child(time_tag, "current")
        .ok_or_else(|| parse_fail("detail.xml: No 'current' time tag found"))?;
    let now: f64 = attr_num(current, "utc")?;

    for client in clients_tag
        .children()
        .filter(|n| n.has_tag_name("clientrcv"))
    {
        let Some(login) = child(client, "login") else {
            continue;
        };
        let Some(time) = child(client, "time") else {
            continue;
        };

        let callssid = child(login, "callssid");
        let upstream = child(client, "upstream");
        let connect = child(time, "connect");

        let (Some(callssid), Some(upstream), Some(connect)) = (callssid, upstream, connect) else {
            continue;
        };
        if upstream.text() != Some("true") {
            continue;
        }

        let is_upstream_class = child(client, "class")
            .and_then(|c| c.attribute("name"))
            .is_some_and(|name| name == "UpstreamClientRcv");
        if !is_upstream_class {
            continue;
        }

        let connect_utc: f64 = attr_num(connect, "utc")?;
        let last_line_in: f64 = child(time, "lastlinein")
            .map(|n| attr_num(n, "utc"))
            .transpose()?
            .unwrap_or(connect_utc);

        let remote = child(client, "remoteserver");
        let addr_rem = match remote {
            Some(r) => format!(
                "{}:{}",
                r.text().unwrap_or_default(),
                r.attribute("port").unwrap_or_default()
            ),
            None => String::new(),
        };

        let rx_packets = child(client, "rcvdfrom")
            .and_then(|n| n.attribute("packets"))
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        uplinks.push(Uplink {
            id: callssid.text().unwrap_or_default().to_owned(),
            addr_rem,
            up: ((now - connect_utc) / 1000.0) as i64,
            rx_last: (now - last_line_in) / 1000.0,
            rx_packets,
        });
    }

    Ok(uplinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DETAIL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<javaprssrvr>
  <software version="4.3.2b10">javAPRSSrvr</software>
  <dupeprocessor><servercall>T2AUSTRIA</servercall></dupeprocessor>
  <java>
    <os architecture="amd64">Linux</os>
    <time>
      <up millis="864000000"/>
      <current utc="1700000000000"/>
    </time>
  </java>
  <listenerports>
    <connections currentin="42" maximum="500"/>
  </listenerports>
  <clients total="1234">
    <rcvdtotals bytes="78527080"/>
    <xmtdtotals bytes="44844765"/>
    <clientrcv>
      <class name="UpstreamClientRcv"/>
      <login><callssid>T2HUB1</callssid></login>
      <upstream>true</upstream>
      <remoteserver port="10152">193.190.240.226</remoteserver>
      <rcvdfrom packets="21334472"/>
      <time>
        <connect utc="1699999880000"/>
        <lastlinein utc="1699999998000"/>
      </time>
    </clientrcv>
    <clientrcv>
      <class name="ClientRcv"/>
      <login><callssid>OH7LZB</callssid></login>
      <upstream>false</upstream>
      <time><connect utc="1699990000000"/></time>
    </clientrcv>
  </clients>
</javaprssrvr>"#;

    #[test]
    fn parses_a_healthy_server() {
        let props = parse(DETAIL).unwrap();

        assert_eq!(props.software, Some(Software::Javap4));
        assert_eq!(props.id.as_deref(), Some("T2AUSTRIA"));
        assert_eq!(props.soft.as_deref(), Some("javAPRSSrvr"));
        assert_eq!(props.vers.as_deref(), Some("4.3.2b10"));
        assert_eq!(props.os.as_deref(), Some("Linux amd64"));
        assert_eq!(props.uptime, Some(864000));
        assert_eq!(props.clients, Some(42));
        assert_eq!(props.clients_max, Some(500));
        assert_eq!(props.connects, Some(1234));
        assert_eq!(props.total_bytes_in, Some(78527080.0));
        assert_eq!(props.total_bytes_out, Some(44844765.0));

        let uplinks = props.uplinks.unwrap();
        assert_eq!(uplinks.len(), 1);
        assert_eq!(uplinks[0].id, "T2HUB1");
        assert_eq!(uplinks[0].addr_rem, "193.190.240.226:10152");
        assert_eq!(uplinks[0].up, 120);
        assert!((uplinks[0].rx_last - 2.0).abs() < 1e-9);
        assert_eq!(uplinks[0].rx_packets, 21334472);
    }

    #[test]
    fn wrong_root_tag_is_a_parse_failure() {
        let e = parse("<html><body>hi</body></html>").unwrap_err();
        assert_eq!(e.code, "web-parse-fail");
        assert!(e.message.contains("root tag"));
    }

    #[test]
    fn broken_xml_is_an_xml_failure() {
        let e = parse("<javaprssrvr><unclosed").unwrap_err();
        assert_eq!(e.code, "web-xml-fail");
    }

    #[test]
    fn missing_software_tag_is_named() {
        let e = parse("<javaprssrvr></javaprssrvr>").unwrap_err();
        assert_eq!(e.code, "web-parse-fail");
        assert!(e.message.contains("'software'"));
    }
}
