//! Server scoring. Lower is better, 0 is perfect, 1000 is the ceiling.

use std::collections::BTreeMap;

use aprs2_model::{Props, Scorebase};

use crate::probe::Af;

pub const SCORE_MAX: f64 = 1000.0;

/// RTTs below this many seconds contribute nothing, to level the playing
/// field between nearby and well-connected far-away servers.
const RTT_GOOD_ENOUGH: f64 = 0.4;
const HTTP_RTT_MUL: f64 = 50.0;
const APRSIS_RTT_MUL: f64 = 40.0;

/// An uplink established less than this many seconds ago is possibly
/// flapping; penalize up to the full range.
const UPLINK_UPTIME_PENALTY_TIME: f64 = 900.0;

const UPTIME_SCORE_RANGE: f64 = 30.0 * 60.0;
const UPTIME_MAX_PENALTY: f64 = 500.0;

/// Collects measurements from one poll and derives the total score.
pub struct Score {
    /// HTTP status page round-trip time, seconds.
    pub http_status_t: Option<f64>,
    /// APRS-IS login round-trip time per address family, seconds.
    pub poll_t_aprsis: BTreeMap<Af, f64>,
    total: f64,
    components: Scorebase,
    /// Minimum acceptable version per software name; older gets the penalty.
    version_penalty: Vec<(&'static str, &'static str, f64)>,
}

impl Default for Score {
    fn default() -> Self {
        Self::new()
    }
}

impl Score {
    pub fn new() -> Self {
        Self {
            http_status_t: None,
            poll_t_aprsis: BTreeMap::new(),
            total: 0.0,
            components: Scorebase::new(),
            version_penalty: vec![("aprsc", "2.0.18", 400.0)],
        }
    }

    pub fn add(&mut self, name: &str, value: f64, human: impl Into<String>) {
        self.total += value;
        self.components
            .insert(name.to_owned(), (value, human.into()).into());
    }

    /// Compute the total. Missing HTTP status or a total APRS-IS failure
    /// short-circuits to the ceiling.
    pub fn total(&mut self, props: &Props) -> f64 {
        let Some(http_t) = self.http_status_t else {
            return SCORE_MAX;
        };

        self.add(
            "http_rtt",
            (http_t - RTT_GOOD_ENOUGH).max(0.0) * HTTP_RTT_MUL,
            format!("{http_t:.3} s"),
        );

        // At least one address family must have answered on the APRS-IS
        // port.
        if self.poll_t_aprsis.is_empty() {
            return SCORE_MAX;
        }

        let mut is_score = 0.0;
        let mut rtt_sum = 0.0;
        for t in self.poll_t_aprsis.values() {
            rtt_sum += t;
            is_score += (t - RTT_GOOD_ENOUGH).max(0.0) * APRSIS_RTT_MUL;
        }
        let families = self.poll_t_aprsis.len() as f64;
        self.add(
            "aprsis_rtt",
            is_score / families,
            format!("{:.3} s", rtt_sum / families),
        );

        let load = props.worst_load.unwrap_or(100.0);
        self.add("user_load", load * 10.0, format!("{load:.1} %"));

        self.round_components();

        // A low uptime often means a crash loop: barely any users, so the
        // load score looks great right when the server is at its worst.
        if let Some(uptime) = props.uptime {
            let uptime = uptime.max(0);
            if (uptime as f64) < UPTIME_SCORE_RANGE {
                let penalty =
                    (UPTIME_SCORE_RANGE - uptime as f64) / UPTIME_SCORE_RANGE * UPTIME_MAX_PENALTY;
                self.add("uptime", penalty, dur_str(uptime));
            }
        }

        // A recently established uplink may be flapping.
        if let Some(uplink) = props.uplinks.as_ref().and_then(|u| u.first()) {
            let up = uplink.up.max(0) as f64;
            if up < UPLINK_UPTIME_PENALTY_TIME {
                self.add(
                    "uplink_uptime",
                    UPLINK_UPTIME_PENALTY_TIME - up,
                    dur_str(uplink.up),
                );
            }
        }

        if let (Some(soft), Some(vers)) = (props.soft.as_deref(), props.vers.as_deref()) {
            for (sw, min_version, penalty) in self.version_penalty.clone() {
                if soft == sw && version_older(vers, min_version) {
                    self.add("version", penalty, vers);
                }
            }
        }

        self.total
    }

    pub fn into_components(self) -> Scorebase {
        self.components
    }

    /// Truncate positive component values to one decimal for display.
    fn round_components(&mut self) {
        for component in self.components.values_mut() {
            if component.value > 0.0 {
                component.value = (component.value * 10.0).floor() / 10.0;
            }
        }
    }
}

/// Compact duration string: `132d18h34m27s`.
pub fn dur_str(seconds: i64) -> String {
    let mut left = seconds;
    let mut s = String::new();

    for (unit, label) in [(86400, 'd'), (3600, 'h'), (60, 'm')] {
        if left >= unit {
            s.push_str(&format!("{}{label}", left / unit));
            left %= unit;
        }
    }

    if left > 0 || s.is_empty() {
        s.push_str(&format!("{left}s"));
    }

    s
}

/// Loose version comparison: split into numeric and alphabetic segments,
/// compare numerics as numbers. `2.0.9 < 2.0.18`, `2.0.11-g6099cb1 < 2.0.18`.
fn version_older(version: &str, reference: &str) -> bool {
    version_key(version) < version_key(reference)
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    Num(u64),
    Alpha(String),
}

fn version_key(v: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut numeric = false;

    for c in v.chars() {
        if c == '.' || c == '-' || c == '_' {
            flush(&mut segments, &mut current, numeric);
            continue;
        }
        if current.is_empty() {
            numeric = c.is_ascii_digit();
        } else if numeric != c.is_ascii_digit() {
            flush(&mut segments, &mut current, numeric);
            numeric = c.is_ascii_digit();
        }
        current.push(c);
    }
    flush(&mut segments, &mut current, numeric);

    segments
}

fn flush(segments: &mut Vec<Segment>, current: &mut String, numeric: bool) {
    if current.is_empty() {
        return;
    }

    let segment = if numeric {
        current
            .parse()
            .map(Segment::Num)
            .unwrap_or_else(|_| Segment::Alpha(std::mem::take(current)))
    } else {
        Segment::Alpha(current.clone())
    };

    segments.push(segment);
    current.clear();
}
