//! Rotate membership selection and DNS record planning.

use std::collections::{BTreeMap, HashMap};

use aprs2_metrics::Graphite;
use aprs2_model::{MergedStatus, RotateStats, Server};
use aprs2_store::Db;

use crate::publish::{DnsRecords, Publisher};
use crate::settings::DnsSettings;

/// Members whose worst listener load exceeds this percentage are not
/// eligible for rotates.
const MAX_ROTATE_LOAD: f64 = 80.0;

/// Take the best 55 % of the candidates, so load balancing happens even in
/// small rotates.
const SELECT_FRACTION: f64 = 0.55;

/// Caps keep the DNS-UDP reply under 512 bytes; there are still resolvers
/// out there that do neither EDNS nor TCP.
const V4_MAX: usize = 8;
const V6_MAX: usize = 3;

const HUBS_ROTATE: &str = "hubs.aprs2.net";

/// Update every managed rotate, the individual host names and the rotate
/// statistics.
pub async fn update_dns(
    db: &Db,
    publisher: &mut Publisher,
    graphite: &Graphite,
    settings: &DnsSettings,
    servers: &HashMap<String, Server>,
    merged: &HashMap<String, MergedStatus>,
) -> anyhow::Result<()> {
    let rotates = db.rotates().await?;

    // Which servers end up participating in which rotates, for the UI.
    let mut participating: BTreeMap<String, BTreeMap<String, i32>> = BTreeMap::new();

    let mut domains: Vec<&String> = rotates.keys().collect();
    domains.sort();

    for domain in domains {
        if settings.is_unmanaged(domain) {
            continue;
        }

        let selection = select_members(
            domain,
            &rotates[domain].members,
            servers,
            merged,
            &settings.master_rotate,
        );

        tracing::info!(
            %domain,
            v4 = ?selection.v4,
            left_out_v4 = ?selection.left_out_v4,
            v6 = ?selection.v6,
            left_out_v6 = ?selection.left_out_v6,
            "Processing rotate"
        );

        if selection.v4.is_empty() {
            if *domain == settings.master_rotate {
                tracing::error!(
                    "Ouch! Master rotate {domain} has no working servers - not doing anything!"
                );
                continue;
            }

            tracing::info!(
                "VERDICT {domain}: No working servers, CNAME {}",
                settings.master_rotate
            );
            publisher
                .push(domain, domain, DnsRecords::cname(&settings.master_rotate))
                .await;
            continue;
        }

        for id in selection.v4.iter().chain(&selection.v6) {
            participating
                .entry(id.clone())
                .or_default()
                .insert(domain.clone(), 1);
        }

        let records = DnsRecords::Addresses {
            v4: addresses(&selection.v4, servers, |s| s.ipv4.map(|a| a.to_string())),
            v6: addresses(&selection.v6, servers, |s| s.ipv6.map(|a| a.to_string())),
        };
        publisher.push(domain, domain, records).await;

        let stats = rotate_stats(&selection.ok, &selection.not_deleted, merged);
        log_stats(domain, &stats, graphite);
        db.store_rotate_stats(domain, &stats).await?;
    }

    update_dns_hosts(publisher, settings, servers, merged).await;

    db.store_rotate_status(&participating).await?;

    update_total_stats(db, graphite, servers, merged).await?;

    Ok(())
}

/// Push the addresses of the individual server host names. A server that is
/// gone or failing gets a CNAME to the master rotate instead, so clients
/// configured with its host name keep connecting somewhere. Hub members are
/// exempt: they must never draw general client traffic.
async fn update_dns_hosts(
    publisher: &mut Publisher,
    settings: &DnsSettings,
    servers: &HashMap<String, Server>,
    merged: &HashMap<String, MergedStatus>,
) {
    let mut names: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();
    let mut names_cnamed: std::collections::BTreeSet<String> = Default::default();

    for (id, server) in servers {
        let Some(fqdn) = server.fqdn() else {
            tracing::warn!(%id, "Server has no host/domain, cannot publish");
            continue;
        };

        let merged_ok = merged.get(id).is_some_and(|m| m.status.is_ok());
        let unhealthy = server.out_of_service || server.deleted || !merged_ok;

        if unhealthy && !server.is_member_of(HUBS_ROTATE) {
            names_cnamed.insert(fqdn);
        } else {
            let entry = names.entry(fqdn).or_default();
            if let Some(ipv4) = server.ipv4 {
                entry.0.push(ipv4.to_string());
            }
            if let Some(ipv6) = server.ipv6 {
                entry.1.push(ipv6.to_string());
            }
        }
    }

    for (fqdn, (v4, v6)) in &names {
        publisher
            .push(
                fqdn,
                fqdn,
                DnsRecords::Addresses {
                    v4: v4.clone(),
                    v6: v6.clone(),
                },
            )
            .await;
    }

    // CNAMEs only for names that did not get address records through
    // another server sharing the same FQDN.
    for fqdn in &names_cnamed {
        if !names.contains_key(fqdn) {
            publisher
                .push(fqdn, fqdn, DnsRecords::cname(&settings.master_rotate))
                .await;
        }
    }
}

async fn update_total_stats(
    db: &Db,
    graphite: &Graphite,
    servers: &HashMap<String, Server>,
    merged: &HashMap<String, MergedStatus>,
) -> anyhow::Result<()> {
    let not_deleted: Vec<String> = servers
        .values()
        .filter(|s| !s.deleted)
        .map(|s| s.id.clone())
        .collect();
    let ok: Vec<String> = not_deleted
        .iter()
        .filter(|id| {
            let server_ok = servers.get(*id).is_some_and(|s| !s.out_of_service);
            let merged_ok = merged
                .get(*id)
                .is_some_and(|m| m.status.is_ok() && m.score.is_some());
            server_ok && merged_ok
        })
        .cloned()
        .collect();

    let stats = rotate_stats(&ok, &not_deleted, merged);
    log_stats("total", &stats, graphite);
    db.store_rotate_stats("total", &stats).await?;

    Ok(())
}

fn log_stats(domain: &str, stats: &RotateStats, graphite: &Graphite) {
    tracing::info!(
        "{domain}: {} clients on {}/{} servers, total data rate {:.0}/{:.0} bytes/sec in/out",
        stats.clients,
        stats.servers_ok,
        stats.servers,
        stats.rate_bytes_in,
        stats.rate_bytes_out
    );

    let sender = graphite.sender(&format!("rotate.{domain}"));
    sender.send("clients", stats.clients as f64);
    sender.send("servers_ok", stats.servers_ok as f64);
    sender.send("rate_bytes_in", stats.rate_bytes_in);
    sender.send("rate_bytes_out", stats.rate_bytes_out);
}

pub(crate) struct Selection {
    /// All acceptable members, regardless of address family.
    pub ok: Vec<String>,
    pub not_deleted: Vec<String>,
    /// Selected members in score order.
    pub v4: Vec<String>,
    pub v6: Vec<String>,
    pub left_out_v4: Vec<String>,
    pub left_out_v6: Vec<String>,
}

/// Pick the rotate members: healthy, lightly loaded, sorted by score, best
/// 55 % within the reply-size caps.
pub(crate) fn select_members(
    domain: &str,
    members: &[String],
    servers: &HashMap<String, Server>,
    merged: &HashMap<String, MergedStatus>,
    master_rotate: &str,
) -> Selection {
    let not_deleted: Vec<String> = members
        .iter()
        .filter(|id| servers.get(*id).is_some_and(|s| !s.deleted))
        .cloned()
        .collect();

    let ok: Vec<String> = not_deleted
        .iter()
        .filter(|id| {
            let Some(m) = merged.get(*id) else {
                return false;
            };
            let load_ok = m
                .props
                .as_ref()
                .and_then(|p| p.worst_load)
                .unwrap_or(100.0)
                <= MAX_ROTATE_LOAD;

            m.status.is_ok()
                && m.score.is_some()
                && load_ok
                && servers.get(*id).is_some_and(|s| !s.out_of_service)
        })
        .cloned()
        .collect();

    let submit_ok = |id: &String| {
        merged
            .get(id)
            .and_then(|m| m.props.as_ref())
            .and_then(|p| p.submit_http_ipv4)
            .is_some()
    };

    let mut v4: Vec<String> = ok
        .iter()
        .filter(|id| servers.get(*id).is_some_and(|s| s.ipv4.is_some()))
        .cloned()
        .collect();
    let mut v6: Vec<String> = ok
        .iter()
        .filter(|id| servers.get(*id).is_some_and(|s| s.ipv6.is_some()))
        .cloned()
        .collect();

    // The master rotate is what client software defaults to; only servers
    // with a working HTTP submit port belong there.
    if domain == master_rotate {
        v4.retain(&submit_ok);
        v6.retain(&submit_ok);
    }

    let score_of = |id: &String| merged.get(id).and_then(|m| m.score).unwrap_or(f64::MAX);
    v4.sort_by(|a, b| score_of(a).total_cmp(&score_of(b)));
    v6.sort_by(|a, b| score_of(a).total_cmp(&score_of(b)));

    let left_out_v4 = v4.split_off(rotate_limit(v4.len(), V4_MAX).min(v4.len()));
    let left_out_v6 = v6.split_off(rotate_limit(v6.len(), V6_MAX).min(v6.len()));

    Selection {
        ok,
        not_deleted,
        v4,
        v6,
        left_out_v4,
        left_out_v6,
    }
}

/// `round(n * 0.55)` clamped into `[2, cap]`.
pub(crate) fn rotate_limit(count: usize, cap: usize) -> usize {
    ((count as f64 * SELECT_FRACTION).round() as usize)
        .min(cap)
        .max(2)
}

fn addresses(
    ids: &[String],
    servers: &HashMap<String, Server>,
    addr: impl Fn(&Server) -> Option<String>,
) -> Vec<String> {
    ids.iter()
        .filter_map(|id| servers.get(id).and_then(&addr))
        .collect()
}

fn rotate_stats(
    ok: &[String],
    not_deleted: &[String],
    merged: &HashMap<String, MergedStatus>,
) -> RotateStats {
    let mut clients = 0;
    let mut rate_bytes_in = 0.0;
    let mut rate_bytes_out = 0.0;

    for id in ok {
        let Some(props) = merged.get(id).and_then(|m| m.props.as_ref()) else {
            continue;
        };

        clients += props.clients.unwrap_or(0);
        rate_bytes_in += props.rate_bytes_in.unwrap_or(0.0);
        rate_bytes_out += props.rate_bytes_out.unwrap_or(0.0);
    }

    RotateStats {
        clients,
        servers_ok: ok.len(),
        servers: not_deleted.len(),
        rate_bytes_in,
        rate_bytes_out,
    }
}
