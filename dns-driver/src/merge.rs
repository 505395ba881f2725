//! Cross-site result fusion.
//!
//! Each poller has its own view of every server; the merge produces the one
//! status and score the rotate selection runs on. A server is considered up
//! when at least one site sees it up and the up-fraction clears one half
//! (with a little slack so a 1-of-2 split still counts).

use std::collections::{BTreeMap, HashMap};

use aprs2_metrics::Graphite;
use aprs2_model::{MergedStatus, Scorebase, Server, ServerState, ServerStatus};
use aprs2_store::{Db, StoreError};

use crate::fetch::StatusSet;

const OK_FRACTION: f64 = 0.48;

/// Availability below this percentage starts drawing a score penalty.
const AVAIL_PENALTY_BELOW: f64 = 99.98;
const AVAIL_PENALTY_CAP: f64 = 500.0;

/// Fuse the per-site results, update availability bookkeeping and persist
/// the merged records.
pub async fn merge_status(
    db: &Db,
    graphite: &Graphite,
    servers: &HashMap<String, Server>,
    status_set: &StatusSet,
    poll_interval: i64,
    now: i64,
) -> Result<HashMap<String, MergedStatus>, StoreError> {
    let mut merged = HashMap::new();

    for (id, sites) in status_set {
        let mut m = fuse(sites);

        let prev: Option<MergedStatus> = db.server_status(id).await?;
        let server = servers.get(id);

        finish(&mut m, prev.as_ref());

        // Availability bookkeeping: only for servers that are in service,
        // and only across sane poll intervals.
        if let (Some(prev_test), Some(last_test)) =
            (prev.as_ref().and_then(|p| p.last_test), m.last_test)
        {
            let tdif = last_test - prev_test;
            if let Some(prev) = &prev {
                m.avail_3 = prev.avail_3;
                m.avail_30 = prev.avail_30;
            }

            if server.is_some_and(|s| s.out_of_service) {
                tracing::debug!(%id, "server out_of_service, not updating availability stats");
            } else if tdif > 0 && tdif < poll_interval * 3 {
                let (a3, a30) = db.update_avail(id, tdif, m.status.is_ok(), now).await?;
                m.avail_3 = a3;
                m.avail_30 = a30;
            } else {
                tracing::debug!(%id, tdif, "tdif not good, using old availability stats");
            }
        }

        apply_availability_penalty(&mut m);

        db.set_server_status(id, &m).await?;
        send_metrics(graphite, id, &m);

        merged.insert(id.clone(), m);
    }

    Ok(merged)
}

/// Pure fusion of the per-site records for one server.
pub(crate) fn fuse(sites: &HashMap<String, ServerStatus>) -> MergedStatus {
    let mut ok_count = 0;
    let mut latest: Option<&ServerStatus> = None;
    let mut scores = Vec::new();
    let mut errors: BTreeMap<String, String> = BTreeMap::new();
    let mut merged_scorebase: BTreeMap<String, Scorebase> = BTreeMap::new();

    for (site, status) in sites {
        if latest.is_none_or(|l| l.last_test < status.last_test) {
            latest = Some(status);
        }

        if status.status.is_ok() {
            ok_count += 1;
        }

        if let Some(props) = &status.props {
            if let Some(score) = props.score {
                scores.push(score);
            }
            if let Some(scorebase) = &props.scorebase {
                merged_scorebase.insert(site.clone(), scorebase.clone());
            }
        }

        for e in &status.errors {
            errors.insert(e.code.clone(), e.message.clone());
        }
    }

    let c_res = sites.len();
    let status = if ok_count >= 1 && ok_count as f64 / c_res as f64 > OK_FRACTION {
        ServerState::Ok
    } else {
        ServerState::Fail
    };

    // Prefer the most recent site's props; fall back to any site that has
    // some at all.
    let mut props = latest
        .and_then(|l| l.props.clone())
        .or_else(|| sites.values().find_map(|s| s.props.clone()));
    let score = if scores.is_empty() {
        None
    } else {
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    };
    if let (Some(props), Some(score)) = (props.as_mut(), score) {
        props.score = Some(score);
    }

    MergedStatus {
        status,
        c: format!("{ok_count}/{c_res}"),
        c_ok: ok_count,
        c_res,
        last_test: latest.map(|l| l.last_test),
        last_change: None,
        props,
        errors: errors
            .into_iter()
            .map(|(code, message)| (code, message).into())
            .collect(),
        avail_3: None,
        avail_30: None,
        score,
        merged_scorebase: if merged_scorebase.is_empty() {
            None
        } else {
            Some(merged_scorebase)
        },
        merged_score_keys: None,
    }
}

/// Carry `last_change` across cycles, advancing it exactly on transitions.
fn finish(m: &mut MergedStatus, prev: Option<&MergedStatus>) {
    m.last_change = match prev {
        Some(prev) if prev.status == m.status && prev.last_change.is_some() => prev.last_change,
        _ => m.last_test,
    };
}

/// Poor short-term availability pushes the merged score up, so recently
/// flaky servers drop out of rotates even while they currently test fine.
fn apply_availability_penalty(m: &mut MergedStatus) {
    let Some(avail_3) = m.avail_3 else {
        update_score_keys(m);
        return;
    };

    if avail_3 < AVAIL_PENALTY_BELOW
        && let Some(score) = m.score
    {
        let penalty = (((100.0 - avail_3) * 1000.0 + 1.0).ln() * 90.0).min(AVAIL_PENALTY_CAP);

        m.score = Some(score + penalty);
        if let Some(props) = m.props.as_mut() {
            props.score = m.score;
        }

        let mut master = Scorebase::new();
        master.insert(
            "availability".to_owned(),
            (penalty, format!("{avail_3:.3} %")).into(),
        );
        m.merged_scorebase
            .get_or_insert_with(BTreeMap::new)
            .insert("master".to_owned(), master);
    }

    update_score_keys(m);
}

/// Union of all score component names, for the UI table heading.
fn update_score_keys(m: &mut MergedStatus) {
    let Some(merged_scorebase) = &m.merged_scorebase else {
        return;
    };

    let mut keys: Vec<String> = merged_scorebase
        .values()
        .flat_map(|sb| sb.keys().cloned())
        .collect();
    keys.sort();
    keys.dedup();

    m.merged_score_keys = Some(keys);
}

fn send_metrics(graphite: &Graphite, id: &str, m: &MergedStatus) {
    let sender = graphite.sender(&format!("server.{id}"));
    sender.send("merged_ok", if m.status.is_ok() { 1.0 } else { 0.0 });

    if let Some(score) = m.score {
        sender.send("merged_score", score);
    }
    if let Some(avail_3) = m.avail_3 {
        sender.send("merged_avail_3", avail_3);
    }

    let Some(props) = &m.props else {
        return;
    };
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
