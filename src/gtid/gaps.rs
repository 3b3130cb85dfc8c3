//! Replication gap analysis
//!
//! Finds transactions a replica has retrieved from its source but not yet
//! executed. Diagnostic only; errant detection is always left to the server.
//!
//! Works on intervals per server identity, so cost follows the number of
//! range tokens rather than the number of transactions.

use std::collections::{BTreeMap, BTreeSet};

use super::set::{ExplodedGtid, GtidRangeEntry, GtidSet, Interval};

/// Transactions in `retrieved` that are missing from `executed`, one entry
/// per server identity in identity order.
pub fn find_gaps(retrieved: &GtidSet, executed: &GtidSet) -> GtidSet {
    let executed = intervals_by_server(executed);

    intervals_by_server(retrieved)
        .into_iter()
        .filter_map(|(server_id, wanted)| {
            let missing = match executed.get(server_id) {
                Some(have) => subtract(&wanted, have),
                None => wanted,
            };
            if missing.is_empty() {
                return None;
            }
            Some(GtidRangeEntry {
                server_id: server_id.to_string(),
                ranges: render(&missing),
            })
        })
        .collect()
}

/// Collapse single transactions back into run-length encoded entries
pub fn summarize(gtids: &[ExplodedGtid]) -> GtidSet {
    let mut by_server: BTreeMap<&str, BTreeSet<u64>> = BTreeMap::new();
    for gtid in gtids {
        by_server
            .entry(gtid.server_id.as_str())
            .or_default()
            .insert(gtid.transaction);
    }

    by_server
        .into_iter()
        .map(|(server_id, numbers)| {
            let intervals = merge(
                numbers
                    .into_iter()
                    .map(|n| Interval { start: n, end: n })
                    .collect(),
            );
            GtidRangeEntry {
                server_id: server_id.to_string(),
                ranges: render(&intervals),
            }
        })
        .collect()
}

/// Sorted, merged intervals keyed by server identity. Reversed and malformed
/// tokens are dropped.
fn intervals_by_server(set: &GtidSet) -> BTreeMap<&str, Vec<Interval>> {
    let mut by_server: BTreeMap<&str, Vec<Interval>> = BTreeMap::new();
    for entry in set.entries() {
        let intervals = by_server.entry(entry.server_id.as_str()).or_default();
        intervals.extend(
            entry
                .ranges
                .split(':')
                .filter_map(Interval::parse)
                .filter(|iv| iv.start <= iv.end),
        );
    }
    by_server
        .into_iter()
        .map(|(server_id, intervals)| (server_id, merge(intervals)))
        .collect()
}

/// Sort and join overlapping or adjacent intervals
fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// `wanted \ have`; both sorted and merged
fn subtract(wanted: &[Interval], have: &[Interval]) -> Vec<Interval> {
    let mut result = Vec::new();
    let mut first = 0;

    for iv in wanted {
        while first < have.len() && have[first].end < iv.start {
            first += 1;
        }

        let mut start = iv.start;
        let mut k = first;
        loop {
            match have.get(k) {
                Some(h) if h.start <= iv.end => {
                    if h.start > start {
                        result.push(Interval {
                            start,
                            end: h.start - 1,
                        });
                    }
                    if h.end >= iv.end {
                        break;
                    }
                    start = start.max(h.end + 1);
                    k += 1;
                }
                _ => {
                    result.push(Interval { start, end: iv.end });
                    break;
                }
            }
        }
    }
    result
}

fn render(intervals: &[Interval]) -> String {
    intervals
        .iter()
        .map(|iv| {
            if iv.start == iv.end {
                iv.start.to_string()
            } else {
                format!("{}-{}", iv.start, iv.end)
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}
