//! One poll job: probe a server, score it and store the result.

use std::net::IpAddr;
use std::sync::Arc;

use aprs2_model::{PollError, Props, Server, ServerLog, ServerState, ServerStatus, Software};
use aprs2_store::StoreError;
use serde_json::json;

use crate::logbuf::PollLog;
use crate::probe::{self, Af, Detection};
use crate::score::{SCORE_MAX, Score};
use crate::uplink;
use crate::{PollerCtx, RatesEntry};

/// Poll one server and publish the outcome. This is the worker-pool entry
/// point; it never fails, it records failure instead.
pub async fn perform_poll(ctx: Arc<PollerCtx>, server: Server) {
    let mut log = PollLog::new(&server.id);
    log.info("Poll thread started");

    let prober = Prober {
        ctx: &ctx,
        server: &server,
        props: Props::default(),
        errors: Vec::new(),
        score: Score::new(),
    };
    let (success, props, errors) = prober.run(&mut log).await;

    let now = chrono::Utc::now().timestamp();

    let prev: Option<ServerStatus> = match ctx.db.server_status(&server.id).await {
        Ok(prev) => prev,
        Err(e) => {
            tracing::warn!(id = %server.id, "Could not read previous status, skipping store: {e}");
            return;
        }
    };

    let status = build_status(
        &ctx,
        &server,
        success,
        props,
        errors,
        prev,
        now,
        &mut log,
    )
    .await;

    send_metrics(&ctx, &server, &status);

    let transcript = ServerLog {
        t: now,
        log: log.into_string(),
    };

    let store_result = async {
        ctx.db.set_server_status(&server.id, &status).await?;
        ctx.db.store_server_log(&server.id, &transcript).await?;
        ctx.db
            .publish_status(&json!({ "config": server, "status": status }))
            .await
    };

    if let Err(e) = store_result.await {
        tracing::warn!(id = %server.id, "Failed to store poll result: {e}");
    }
}

/// Assemble the new status record. The record is rebuilt from scratch;
/// only the identity subset, `last_change` and the availability figures are
/// carried over from the previous record.
async fn build_status(
    ctx: &PollerCtx,
    server: &Server,
    success: bool,
    mut props: Props,
    errors: Vec<PollError>,
    prev: Option<ServerStatus>,
    now: i64,
    log: &mut PollLog,
) -> ServerStatus {
    let state = if success {
        ServerState::Ok
    } else {
        ServerState::Fail
    };

    if !success && let Some(old_props) = prev.as_ref().and_then(|p| p.props.as_ref()) {
        preserve_identity(&mut props, old_props);
    }

    let last_change = match &prev {
        Some(prev) if prev.status == state => prev.last_change,
        _ => now,
    };

    let (mut avail_3, mut avail_30) = prev
        .as_ref()
        .map(|p| (p.avail_3, p.avail_30))
        .unwrap_or_default();

    if server.out_of_service {
        log.info("Server is marked to be out of service, not updating availability statistics");
    } else if let Some(prev) = &prev {
        let tdif = now - prev.last_test;
        if tdif > 0 && tdif < ctx.settings.poll_interval * 3 {
            match ctx
                .db
                .update_avail(&server.id, tdif, state.is_ok(), now)
                .await
            {
                Ok((a3, a30)) => {
                    avail_3 = a3;
                    avail_30 = a30;
                }
                Err(e) => {
                    tracing::warn!(id = %server.id, "Availability update failed: {e}");
                }
            }
        } else {
            log.debug(format_args!("tdif {tdif} not good, keeping old availability stats"));
        }
    }

    ServerStatus {
        status: state,
        last_test: now,
        last_change,
        props: Some(props),
        errors,
        avail_3,
        avail_30,
    }
}

/// Fill the fixed identity subset from the previous poll so the UI can
/// still show what kind of server this was while it is down.
fn preserve_identity(current: &mut Props, previous: &Props) {
    if current.software.is_none() {
        current.software = previous.software;
    }
    if current.id.is_none() {
        current.id = previous.id.clone();
    }
    if current.soft.is_none() {
        current.soft = previous.soft.clone();
    }
    if current.vers.is_none() {
        current.vers = previous.vers.clone();
    }
    if current.os.is_none() {
        current.os = previous.os.clone();
    }
}

fn send_metrics(ctx: &PollerCtx, server: &Server, status: &ServerStatus) {
    let sender = ctx.graphite.sender(&format!("server.{}", server.id));
    sender.send("ok", if status.status.is_ok() { 1.0 } else { 0.0 });

    let Some(props) = &status.props else {
        return;
    };

    if let Some(score) = props.score {
        sender.send("score", score);
    }
    for (metric, value) in [
        ("clients", props.clients.map(|v| v as f64)),
        ("rate_bytes_in", props.rate_bytes_in),
        ("rate_bytes_out", props.rate_bytes_out),
        ("rate_connects", props.rate_connects),
        ("worst_load", props.worst_load),
    ] {
        if let Some(value) = value {
            sender.send(metric, value);
        }
    }
}

struct Prober<'a> {
    ctx: &'a PollerCtx,
    server: &'a Server,
    props: Props,
    errors: Vec<PollError>,
    score: Score,
}

impl Prober<'_> {
    /// Run the full probe sequence. Any internal error (the store going
    /// away mid-poll) is converted into a `crash` failure; probe failures
    /// are regular errors.
    async fn run(mut self, log: &mut PollLog) -> (bool, Props, Vec<PollError>) {
        let success = match self.poll_main(log).await {
            Ok(success) => success,
            Err(e) => {
                self.error(log, PollError::new("crash", format!("Poller crashed: {e}")));
                false
            }
        };

        if !success {
            self.score.add("server-fail", SCORE_MAX, "1000");
        }

        let total = self.score.total(&self.props);
        self.props.score = Some(total);
        self.props.scorebase = Some(self.score.into_components());

        log.info(format_args!(
            "Server {}, score {total:.1}",
            if success { "OK" } else { "FAIL" }
        ));

        (success, self.props, self.errors)
    }

    fn error(&mut self, log: &mut PollLog, e: PollError) {
        log.info(format_args!("Polling error [{}]: {}", e.code, e.message));
        self.errors.push(e);
    }

    async fn poll_main(&mut self, log: &mut PollLog) -> Result<bool, StoreError> {
        let Some(ipv4) = self.server.ipv4 else {
            // The catalog never schedules these, but the record may change
            // under a queued poll.
            self.error(
                log,
                PollError::new("web-http-fail", "Server has no IPv4 address"),
            );
            return Ok(false);
        };

        let address_map = self.ctx.address_map();

        let mut detected = false;
        for flavor in try_order(self.ctx, &self.server.id) {
            let detection = match flavor {
                Software::Aprsc => probe::aprsc::probe(&self.ctx.client, ipv4).await,
                Software::Javap4 => probe::javap4::probe(&self.ctx.client, ipv4).await,
                Software::Javap3 => {
                    probe::javap3::probe(&self.ctx.client, ipv4, &address_map).await
                }
            };

            match detection {
                Detection::NotThisType => continue,
                Detection::Broken(e) => {
                    self.error(log, e);
                    return Ok(false);
                }
                Detection::Alive { rtt, props } => {
                    log.debug(format_args!("HTTP {flavor} OK {rtt:.3} s"));
                    self.score.http_status_t = Some(rtt);
                    self.props = props;

                    if !self.check_properties(log) {
                        return Ok(false);
                    }
                    self.calculate_rates();

                    self.ctx
                        .caches
                        .software_type
                        .insert(self.server.id.clone(), flavor);
                    detected = true;
                    break;
                }
            }
        }

        if !detected {
            self.error(
                log,
                PollError::new(
                    "web-undetermined",
                    format!("Server status not determined: {}", self.server.id),
                ),
            );
            return Ok(false);
        }

        if !self.service_tests(log).await {
            return Ok(false);
        }

        if let Some(e) = uplink::check(&self.ctx.db, self.server, &self.props, log).await? {
            self.error(log, e);
            return Ok(false);
        }

        Ok(true)
    }

    fn check_properties(&mut self, log: &mut PollLog) -> bool {
        let p = &self.props;
        let mandatory: [(&str, bool); 9] = [
            ("id", p.id.is_some()),
            ("os", p.os.is_some()),
            ("soft", p.soft.is_some()),
            ("vers", p.vers.is_some()),
            ("clients", p.clients.is_some()),
            ("clients_max", p.clients_max.is_some()),
            ("connects", p.connects.is_some()),
            ("total_bytes_in", p.total_bytes_in.is_some()),
            ("total_bytes_out", p.total_bytes_out.is_some()),
        ];

        for (name, present) in mandatory {
            if !present {
                self.error(
                    log,
                    PollError::new(
                        "web-props",
                        format!(r#"Failed to get mandatory server property: "{name}""#),
                    ),
                );
                return false;
            }
        }

        if self.props.id.as_deref() != Some(self.server.id.as_str()) {
            let got = self.props.id.clone().unwrap_or_default();
            self.error(
                log,
                PollError::new(
                    "id-mismatch",
                    format!(
                        r#"Server ID mismatch: "{got}" on server, "{}" expected"#,
                        self.server.id
                    ),
                ),
            );
            return false;
        }

        true
    }

    /// Derive bytes/connects per second from the previous poll's counters.
    /// Rates are only computed when the new cumulative value is larger, so
    /// a counter reset (server restart) skips one interval.
    fn calculate_rates(&mut self) {
        let now = chrono::Utc::now().timestamp() as f64;

        let (Some(bytes_in), Some(bytes_out), Some(connects)) = (
            self.props.total_bytes_in,
            self.props.total_bytes_out,
            self.props.connects,
        ) else {
            return;
        };
        let connects = connects as f64;

        if let Some(prev) = self.ctx.caches.rates.get(&self.server.id) {
            let dur = now - prev.t;
            if dur > 0.0 {
                if bytes_in > prev.total_bytes_in {
                    self.props.rate_bytes_in = Some((bytes_in - prev.total_bytes_in) / dur);
                }
                if bytes_out > prev.total_bytes_out {
                    self.props.rate_bytes_out = Some((bytes_out - prev.total_bytes_out) / dur);
                }
                if connects > prev.connects {
                    self.props.rate_connects = Some((connects - prev.connects) / dur);
                }
            }
        }

        self.ctx.caches.rates.insert(
            self.server.id.clone(),
            RatesEntry {
                t: now,
                total_bytes_in: bytes_in,
                total_bytes_out: bytes_out,
                connects,
            },
        );
    }

    /// APRS-IS service tests: the submit port fingerprint (informational)
    /// and the TCP login probe on every configured address family.
    async fn service_tests(&mut self, log: &mut PollLog) -> bool {
        let software = self.props.software.unwrap_or(Software::Aprsc);
        let port = probe::aprsis::port_for(&self.server.id);

        let mut families: Vec<(Af, IpAddr)> = Vec::new();
        if let Some(ipv4) = self.server.ipv4 {
            families.push((Af::Ipv4, IpAddr::V4(ipv4)));
        }
        if let Some(ipv6) = self.server.ipv6 {
            families.push((Af::Ipv6, IpAddr::V6(ipv6)));
        }

        for (af, addr) in &families {
            let rtt = probe::submit::probe(
                &self.ctx.client,
                *af,
                *addr,
                probe::submit::SUBMIT_PORT,
                software,
                log,
            )
            .await;

            match af {
                Af::Ipv4 => self.props.submit_http_ipv4 = rtt,
                Af::Ipv6 => self.props.submit_http_ipv6 = rtt,
            }
        }

        let mut ok = true;
        let mut ok_count = 0;

        for (af, addr) in &families {
            log.info(format_args!("APRS-IS TCP test: {addr} port {port}"));
            let started = std::time::Instant::now();

            match probe::aprsis::probe(*addr, port, &self.server.id).await {
                Ok(()) => {
                    let rtt = started.elapsed().as_secs_f64();
                    log.info(format_args!("APRS-IS TCP OK: {addr} port {port} ({rtt:.3} s)"));
                    self.score.poll_t_aprsis.insert(*af, rtt);
                    ok_count += 1;
                }
                Err(e) => {
                    self.error(
                        log,
                        PollError::new(
                            format!("{}-{}", af.is_prefix(), e.code),
                            format!("{af} TCP {port}: {}", e.message),
                        ),
                    );
                    ok = false;
                }
            }
        }

        ok && ok_count > 0
    }
}

/// Flavor order for this server: the last detected flavor first, then the
/// configured default order.
fn try_order(ctx: &PollerCtx, server_id: &str) -> Vec<Software> {
    let mut order = ctx.settings.probe_order.clone();

    if let Some(known) = ctx.caches.software_type.get(server_id) {
        let known = *known;
        order.retain(|f| *f != known);
        order.insert(0, known);
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PollerSettings;
    use aprs2_store::{Db, MemStore};

    fn test_ctx() -> PollerCtx {
        let settings: PollerSettings = toml::from_str(
            r#"portal_rotates_url = "https://portal.example.com/rotates.json""#,
        )
        .unwrap();

        PollerCtx::new(
            Db::new(Arc::new(MemStore::new())),
            aprs2_metrics::Graphite::disabled(),
            settings,
        )
        .unwrap()
    }

    fn server(id: &str) -> Server {
        Server {
            id: id.to_owned(),
            host: Some("test".to_owned()),
            domain: Some("aprs2.net".to_owned()),
            ipv4: Some("192.0.2.1".parse().unwrap()),
            ipv6: None,
            member: vec![],
            deleted: false,
            out_of_service: false,
            email: None,
            email_alerts: false,
        }
    }

    #[test]
    fn cached_flavor_is_probed_first() {
        let ctx = test_ctx();

        assert_eq!(
            try_order(&ctx, "T2NEW"),
            vec![Software::Javap3, Software::Aprsc, Software::Javap4]
        );

        ctx.caches
            .software_type
            .insert("T2KNOWN".to_owned(), Software::Javap4);
        assert_eq!(
            try_order(&ctx, "T2KNOWN"),
            vec![Software::Javap4, Software::Javap3, Software::Aprsc]
        );
    }

    #[test]
    fn identity_is_preserved_from_previous_props() {
        let previous = Props {
            software: Some(Software::Aprsc),
            id: Some("T2FINLAND".to_owned()),
            soft: Some("aprsc".to_owned()),
            vers: Some("2.1.15".to_owned()),
            os: Some("Linux".to_owned()),
            clients: Some(50),
            ..Props::default()
        };

        let mut current = Props::default();
        preserve_identity(&mut current, &previous);

        assert_eq!(current.software, Some(Software::Aprsc));
        assert_eq!(current.soft.as_deref(), Some("aprsc"));
        assert_eq!(current.vers.as_deref(), Some("2.1.15"));
        assert_eq!(current.os.as_deref(), Some("Linux"));
        // Volatile fields are not carried over.
        assert_eq!(current.clients, None);
    }

    #[tokio::test]
    async fn last_change_advances_only_on_transitions() {
        let ctx = test_ctx();
        let server = server("T2TEST");
        let mut log = PollLog::new("T2TEST");

        let first = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            None,
            1000,
            &mut log,
        )
        .await;
        assert_eq!(first.last_change, 1000);

        let second = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            Some(first.clone()),
            1300,
            &mut log,
        )
        .await;
        assert_eq!(second.last_change, 1000, "no transition, no bump");
        assert_eq!(second.last_test, 1300);

        let third = build_status(
            &ctx,
            &server,
            false,
            Props::default(),
            vec![PollError::new("id-mismatch", "oops")],
            Some(second),
            1600,
            &mut log,
        )
        .await;
        assert_eq!(third.last_change, 1600, "ok -> fail bumps last_change");
        assert_eq!(third.status, ServerState::Fail);
    }

    #[tokio::test]
    async fn out_of_service_servers_accrue_no_availability() {
        let ctx = test_ctx();
        let mut server = server("T2OOS");
        server.out_of_service = true;
        let mut log = PollLog::new("T2OOS");

        let first = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            None,
            1000,
            &mut log,
        )
        .await;
        let second = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            Some(first),
            1300,
            &mut log,
        )
        .await;

        assert_eq!(second.avail_3, None);
        assert_eq!(second.avail_30, None);
    }

    #[tokio::test]
    async fn oversized_poll_gap_does_not_accrue_availability() {
        let ctx = test_ctx();
        let server = server("T2GAP");
        let mut log = PollLog::new("T2GAP");

        let first = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            None,
            1000,
            &mut log,
        )
        .await;

        // Three poll intervals plus one second: outside the window.
        let gap = ctx.settings.poll_interval * 3;
        let second = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            Some(first),
            1000 + gap,
            &mut log,
        )
        .await;
        assert_eq!(second.avail_3, None);

        // A regular interval accrues.
        let third = build_status(
            &ctx,
            &server,
            true,
            Props::default(),
            vec![],
            Some(second),
            1000 + gap + 300,
            &mut log,
        )
        .await;
        assert_eq!(third.avail_3, Some(100.0));
    }

    #[test]
    fn rates_are_derived_from_counter_deltas() {
        let ctx = test_ctx();
        let server = server("T2RATE");

        ctx.caches.rates.insert(
            "T2RATE".to_owned(),
            RatesEntry {
                t: chrono::Utc::now().timestamp() as f64 - 100.0,
                total_bytes_in: 1000.0,
                total_bytes_out: 500.0,
                connects: 10.0,
            },
        );

        let mut prober = Prober {
            ctx: &ctx,
            server: &server,
            props: Props {
                total_bytes_in: Some(11000.0),
                total_bytes_out: Some(500.0),
                connects: Some(10),
                ..Props::default()
            },
            errors: vec![],
            score: Score::new(),
        };
        prober.calculate_rates();

        // 10000 bytes over ~100 s.
        let rate = prober.props.rate_bytes_in.unwrap();
        assert!((rate - 100.0).abs() < 5.0, "{rate}");
        // Unchanged counters produce no rate.
        assert_eq!(prober.props.rate_bytes_out, None);
        assert_eq!(prober.props.rate_connects, None);
    }

    #[test]
    fn counter_reset_skips_the_rate() {
        let ctx = test_ctx();
        let server = server("T2RESET");

        ctx.caches.rates.insert(
            "T2RESET".to_owned(),
            RatesEntry {
                t: chrono::Utc::now().timestamp() as f64 - 100.0,
                total_bytes_in: 999_999.0,
                total_bytes_out: 999_999.0,
                connects: 999.0,
            },
        );

        let mut prober = Prober {
            ctx: &ctx,
            server: &server,
            props: Props {
                total_bytes_in: Some(100.0),
                total_bytes_out: Some(100.0),
                connects: Some(1),
                ..Props::default()
            },
            errors: vec![],
            score: Score::new(),
        };
        prober.calculate_rates();

        assert_eq!(prober.props.rate_bytes_in, None);

        // The cache now holds the fresh counters for the next round.
        let entry = ctx.caches.rates.get("T2RESET").unwrap();
        assert_eq!(entry.total_bytes_in, 100.0);
    }

    #[tokio::test]
    async fn missing_mandatory_property_fails_with_web_props() {
        let ctx = test_ctx();
        let server = server("T2PROPS");
        let mut log = PollLog::new("T2PROPS");

        let mut prober = Prober {
            ctx: &ctx,
            server: &server,
            props: Props {
                id: Some("T2PROPS".to_owned()),
                os: Some("Linux".to_owned()),
                soft: Some("aprsc".to_owned()),
                vers: Some("2.1.15".to_owned()),
                clients: Some(1),
                clients_max: Some(10),
                connects: None,
                ..Props::default()
            },
            errors: vec![],
            score: Score::new(),
        };

        assert!(!prober.check_properties(&mut log));
        assert_eq!(prober.errors[0].code, "web-props");
        assert!(prober.errors[0].message.contains("connects"));
    }

    #[tokio::test]
    async fn id_mismatch_is_reported() {
        let ctx = test_ctx();
        let server = server("T2EXPECTED");
        let mut log = PollLog::new("T2EXPECTED");

        let mut prober = Prober {
            ctx: &ctx,
            server: &server,
            props: Props {
                id: Some("T2OTHER".to_owned()),
                os: Some("Linux".to_owned()),
                soft: Some("aprsc".to_owned()),
                vers: Some("2.1.15".to_owned()),
                clients: Some(1),
                clients_max: Some(10),
                connects: Some(1),
                total_bytes_in: Some(1.0),
                total_bytes_out: Some(1.0),
                ..Props::default()
            },
            errors: vec![],
            score: Score::new(),
        };

        assert!(!prober.check_properties(&mut log));
        assert_eq!(prober.errors.len(), 1);
        assert_eq!(prober.errors[0].code, "id-mismatch");
    }
}
