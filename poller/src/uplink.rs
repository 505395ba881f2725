//! Uplink graph validation.
//!
//! The topology is constrained: leaves feed rotate members, rotate members
//! feed hubs, hubs feed the core. A server's rotate memberships determine
//! which upstream family it must be connected to.

use aprs2_model::{PollError, Props, Server};
use aprs2_store::{Db, StoreError};

use crate::logbuf::PollLog;

/// An uplink that has not received data for this long is stuck.
const STUCK_AFTER_SECS: f64 = 300.0;

const FIRENET: &str = "firenet.aprs2.net";
const ROTATE: &str = "rotate.aprs2.net";
const HUBS: &str = "hubs.aprs2.net";
const CORE: &str = "rotate.aprs.net";
const CWOP: &str = "cwop.aprs.net";

/// Validate the server's uplinks against its rotate memberships. Returns a
/// poll error when the uplink graph is unacceptable.
pub async fn check(
    db: &Db,
    server: &Server,
    props: &Props,
    log: &mut PollLog,
) -> Result<Option<PollError>, StoreError> {
    let mut uplinks_required = true;
    let mut required_upstream = None;

    if server.is_member_of(FIRENET) {
        log.debug("member of firenet.aprs2.net, not tracking uplinks");
        return Ok(None);
    }

    if server.is_member_of(ROTATE) {
        log.debug("member of rotate.aprs2.net");
        required_upstream = Some(HUBS);
    }

    if server.is_member_of(HUBS) {
        log.debug("member of hubs.aprs2.net");
        required_upstream = Some(CORE);
    }

    if server.is_member_of(CORE) || server.is_member_of(CWOP) {
        log.debug("member of core or cwop, no need for uplinks");
        uplinks_required = false;
    }

    let uplinks = props.uplinks.as_deref().unwrap_or_default();
    log.debug(format_args!("uplinks: {uplinks:?}"));

    if !uplinks_required {
        if uplinks.is_empty() {
            return Ok(None);
        }

        return Ok(Some(PollError::new(
            "uplinks-has",
            "Server is linked to upstream servers - not expected for this server class",
        )));
    }

    let uplink = match uplinks {
        [] => {
            return Ok(Some(PollError::new(
                "uplinks-none",
                "Not connected to an upstream server",
            )));
        }
        [uplink] => uplink,
        _ => {
            return Ok(Some(PollError::new(
                "uplinks-many",
                "Connected to more than 1 upstream server",
            )));
        }
    };

    let Some(upstream) = db.server(&uplink.id).await? else {
        return Ok(Some(PollError::new(
            "uplinks-odd",
            "Connected to unregistered upstream server",
        )));
    };
    log.debug(format_args!("uplink is: {}", upstream.id));

    if let Some(required) = required_upstream
        && !upstream.is_member_of(required)
    {
        return Ok(Some(PollError::new(
            "uplinks-wrong",
            "Connected to wrong upstream server",
        )));
    }

    if uplink.rx_last > STUCK_AFTER_SECS {
        return Ok(Some(PollError::new(
            "uplinks-stuck",
            format!(
                "Uplink stuck: last received data {:.0} seconds ago",
                uplink.rx_last
            ),
        )));
    }

    log.info(format_args!(
        "Uplink: Connected to {} [{}]",
        uplink.addr_rem, uplink.id
    ));

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aprs2_model::Uplink;
    use aprs2_store::MemStore;
    use std::sync::Arc;

    fn server(id: &str, member: &[&str]) -> Server {
        Server {
            id: id.to_owned(),
            host: None,
            domain: None,
            ipv4: Some("192.0.2.1".parse().unwrap()),
            ipv6: None,
            member: member.iter().map(|m| m.to_string()).collect(),
            deleted: false,
            out_of_service: false,
            email: None,
            email_alerts: false,
        }
    }

    fn uplink_to(id: &str, rx_last: f64) -> Props {
        Props {
            uplinks: Some(vec![Uplink {
                id: id.to_owned(),
                addr_rem: "192.0.2.2:20152".to_owned(),
                up: 86400,
                rx_last,
                rx_packets: 1000,
            }]),
            ..Props::default()
        }
    }

    async fn db_with_hub() -> Db {
        let db = Db::new(Arc::new(MemStore::new()));
        db.store_server(&server("T2HUB1", &[HUBS])).await.unwrap();
        db.store_server(&server("T2CORE1", &[CORE])).await.unwrap();
        db
    }

    async fn check_code(server: &Server, props: &Props) -> Option<String> {
        let db = db_with_hub().await;
        let mut log = PollLog::new(&server.id);

        check(&db, server, props, &mut log)
            .await
            .unwrap()
            .map(|e| e.code)
    }

    #[tokio::test]
    async fn rotate_member_with_hub_uplink_passes() {
        let s = server("T2FINLAND", &[ROTATE]);
        assert_eq!(check_code(&s, &uplink_to("T2HUB1", 2.0)).await, None);
    }

    #[tokio::test]
    async fn rotate_member_without_uplink_fails() {
        let s = server("T2FINLAND", &[ROTATE]);
        assert_eq!(
            check_code(&s, &Props::default()).await.as_deref(),
            Some("uplinks-none")
        );
    }

    #[tokio::test]
    async fn two_uplinks_fail() {
        let s = server("T2FINLAND", &[ROTATE]);
        let mut props = uplink_to("T2HUB1", 2.0);
        props
            .uplinks
            .as_mut()
            .unwrap()
            .push(uplink_to("T2CORE1", 2.0).uplinks.unwrap().pop().unwrap());

        assert_eq!(check_code(&s, &props).await.as_deref(), Some("uplinks-many"));
    }

    #[tokio::test]
    async fn unregistered_upstream_fails() {
        let s = server("T2FINLAND", &[ROTATE]);
        assert_eq!(
            check_code(&s, &uplink_to("unknown", 2.0)).await.as_deref(),
            Some("uplinks-odd")
        );
    }

    #[tokio::test]
    async fn rotate_member_linked_to_core_fails() {
        let s = server("T2FINLAND", &[ROTATE]);
        assert_eq!(
            check_code(&s, &uplink_to("T2CORE1", 2.0)).await.as_deref(),
            Some("uplinks-wrong")
        );
    }

    #[tokio::test]
    async fn hub_must_link_to_core() {
        let s = server("T2HUB9", &[HUBS]);
        assert_eq!(check_code(&s, &uplink_to("T2CORE1", 2.0)).await, None);
        assert_eq!(
            check_code(&s, &uplink_to("T2HUB1", 2.0)).await.as_deref(),
            Some("uplinks-wrong")
        );
    }

    #[tokio::test]
    async fn stuck_uplink_fails() {
        let s = server("T2FINLAND", &[ROTATE]);
        assert_eq!(
            check_code(&s, &uplink_to("T2HUB1", 301.0)).await.as_deref(),
            Some("uplinks-stuck")
        );
    }

    #[tokio::test]
    async fn core_member_must_not_have_uplinks() {
        let s = server("T2CORE2", &[CORE]);
        assert_eq!(check_code(&s, &Props::default()).await, None);
        assert_eq!(
            check_code(&s, &uplink_to("T2HUB1", 2.0)).await.as_deref(),
            Some("uplinks-has")
        );
    }

    #[tokio::test]
    async fn firenet_member_is_not_tracked() {
        let s = server("T2FIRE", &[FIRENET]);
        assert_eq!(check_code(&s, &uplink_to("unknown", 999.0)).await, None);
    }
}
