//! GTID Set
//!
//! Parsing, filtering and expansion of GTID set strings as reported by
//! `@@GLOBAL.GTID_EXECUTED`, `Retrieved_Gtid_Set` or `GTID_SUBTRACT()`.
//!
//! Example input:
//! `230ea8ea-81e3-11e4-972a-e25ec4bd140a:1-10539,`
//! `316d193c-70e5-11e5-adb2-ecf4bb2262ff:1-8935:8984-6124596`

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One server identity's contribution to a GTID set,
/// e.g. `316d193c-70e5-11e5-adb2-ecf4bb2262ff:1-8935:8984-6124596`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidRangeEntry {
    /// Originating server identity (normally a UUID, not validated)
    pub server_id: String,
    /// Colon separated interval tokens, kept verbatim
    pub ranges: String,
}

impl GtidRangeEntry {
    /// Parse a single `server_id:ranges` entry
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (server_id, ranges) = text
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("cannot parse GTID entry from '{}'", text)))?;

        if server_id.is_empty() {
            return Err(Error::Parse(format!("empty server identity in '{}'", text)));
        }
        if ranges.is_empty() {
            return Err(Error::Parse(format!("empty GTID range in '{}'", text)));
        }

        Ok(Self {
            server_id: server_id.to_string(),
            ranges: ranges.to_string(),
        })
    }

    /// Expand the ranges into one GTID per transaction number.
    ///
    /// Reversed ranges (`5-1`) and tokens that are neither `N` nor `N-M`
    /// contribute nothing.
    pub fn explode(&self) -> Vec<ExplodedGtid> {
        let mut result = Vec::new();
        for token in self.ranges.split(':') {
            match Interval::parse(token) {
                Some(Interval { start, end }) if start <= end => {
                    result.extend((start..=end).map(|n| ExplodedGtid {
                        server_id: self.server_id.clone(),
                        transaction: n,
                    }));
                }
                _ => {}
            }
        }
        result
    }
}

impl fmt::Display for GtidRangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.ranges)
    }
}

/// Inclusive interval token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(super) struct Interval {
    pub(super) start: u64,
    pub(super) end: u64,
}

impl Interval {
    /// Match `N` or `N-M`, digits only
    pub(super) fn parse(token: &str) -> Option<Self> {
        fn number(s: &str) -> Option<u64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            s.parse().ok()
        }

        match token.split_once('-') {
            Some((start, end)) => Some(Self {
                start: number(start)?,
                end: number(end)?,
            }),
            None => {
                let n = number(token)?;
                Some(Self { start: n, end: n })
            }
        }
    }
}

/// A single transaction identifier, `server_id:transaction`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExplodedGtid {
    pub server_id: String,
    pub transaction: u64,
}

impl ExplodedGtid {
    /// Check the identifier can be spliced into `SET GTID_NEXT='...'`
    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(Error::Parse("empty server identity".into()));
        }
        if self
            .server_id
            .chars()
            .any(|c| c == '\'' || c == '\\' || c == '"' || c.is_whitespace())
        {
            return Err(Error::Parse(format!(
                "server identity '{}' contains characters not allowed in GTID_NEXT",
                self.server_id
            )));
        }
        if self.transaction == 0 {
            return Err(Error::Parse(format!(
                "transaction number 0 is not a valid GTID for {}",
                self.server_id
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ExplodedGtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server_id, self.transaction)
    }
}

/// Ordered set of GTID range entries. Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    entries: Vec<GtidRangeEntry>,
}

impl GtidSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated GTID set. The empty string is the empty set.
    pub fn parse(text: &str) -> Result<Self> {
        let entries = text
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(GtidRangeEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[GtidRangeEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, keeping insertion order
    pub fn push(&mut self, entry: GtidRangeEntry) {
        self.entries.push(entry);
    }

    /// Number of transactions the set names, counted without expanding it.
    /// Reversed and malformed tokens count as zero, as in `explode`.
    pub fn transaction_count(&self) -> u64 {
        self.entries
            .iter()
            .flat_map(|e| e.ranges.split(':'))
            .filter_map(Interval::parse)
            .filter(|iv| iv.start <= iv.end)
            .map(|iv| iv.end - iv.start + 1)
            .fold(0u64, u64::saturating_add)
    }

    /// Expand every entry into single transaction identifiers
    pub fn explode(&self) -> Vec<ExplodedGtid> {
        self.entries.iter().flat_map(GtidRangeEntry::explode).collect()
    }

    /// Drop entries belonging to `server_id`.
    ///
    /// Returns the filtered set and whether anything was removed.
    pub fn remove_server(&self, server_id: &str) -> (GtidSet, bool) {
        let kept: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.server_id != server_id)
            .cloned()
            .collect();
        let removed = kept.len() != self.entries.len();
        (GtidSet { entries: kept }, removed)
    }

    /// Keep only entries whose identity is in `server_ids`.
    ///
    /// Returns the filtered set and whether anything was removed.
    pub fn retain_servers<S: AsRef<str>>(&self, server_ids: &[S]) -> (GtidSet, bool) {
        let wanted: HashSet<&str> = server_ids.iter().map(AsRef::as_ref).collect();
        let kept: Vec<_> = self
            .entries
            .iter()
            .filter(|e| wanted.contains(e.server_id.as_str()))
            .cloned()
            .collect();
        let any_removed = kept.len() != self.entries.len();
        (GtidSet { entries: kept }, any_removed)
    }

    /// Identities present in both sets, without ranges
    pub fn shared_server_ids(&self, other: &GtidSet) -> HashSet<String> {
        let ours: HashSet<&str> = self.entries.iter().map(|e| e.server_id.as_str()).collect();
        other
            .entries
            .iter()
            .filter(|e| ours.contains(e.server_id.as_str()))
            .map(|e| e.server_id.clone())
            .collect()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl FromIterator<GtidRangeEntry> for GtidSet {
    fn from_iter<I: IntoIterator<Item = GtidRangeEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Ordered single-transaction GTIDs to inject, consumed once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixPlan {
    gtids: Vec<ExplodedGtid>,
}

impl FixPlan {
    /// Derive a plan by exploding an errant GTID set string
    pub fn from_errant(errant: &str) -> Result<Self> {
        let set = GtidSet::parse(errant)?;
        Ok(Self { gtids: set.explode() })
    }

    pub fn len(&self) -> usize {
        self.gtids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gtids.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExplodedGtid> {
        self.gtids.iter()
    }
}

impl IntoIterator for FixPlan {
    type Item = ExplodedGtid;
    type IntoIter = std::vec::IntoIter<ExplodedGtid>;

    fn into_iter(self) -> Self::IntoIter {
        self.gtids.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: &str = "1d1fff5a-c9bc-11ed-9c19-02a36d996b94";
    const U2: &str = "2af7e535-9255-11f0-87f8-76ae10baffb1";

    fn strings(gtids: &[ExplodedGtid]) -> Vec<String> {
        gtids.iter().map(ToString::to_string).collect()
    }

    fn entry(server_id: &str, ranges: &str) -> GtidRangeEntry {
        GtidRangeEntry {
            server_id: server_id.into(),
            ranges: ranges.into(),
        }
    }

    #[test]
    fn test_parse_empty() {
        let set = GtidSet::parse("").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");

        let set = GtidSet::parse("  ,  ").unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_parse_entries() {
        let text = format!("{U1}:1-5,\n {U2}:10-15:20");
        let set = GtidSet::parse(&text).unwrap();
        assert_eq!(set.entries(), &[entry(U1, "1-5"), entry(U2, "10-15:20")]);
    }

    #[test]
    fn test_parse_failures() {
        assert!(GtidSet::parse("invalid-gtid-format").is_err());
        assert!(GtidSet::parse(":1-5").is_err());
        assert!(GtidSet::parse(&format!("{U1}:")).is_err());
        // Identity format is not validated, only non-emptiness
        let set = GtidSet::parse("not-a-uuid:1").unwrap();
        assert_eq!(set.entries()[0].server_id, "not-a-uuid");
    }

    #[test]
    fn test_round_trip() {
        let inputs = [
            String::new(),
            format!("{U1}:1"),
            format!("{U1}:1-8935:8984-6124596,{U2}:1-56"),
            format!("{U2}:7,{U1}:1-3"),
        ];
        for input in inputs {
            let set = GtidSet::parse(&input).unwrap();
            let again = GtidSet::parse(&set.to_string()).unwrap();
            assert_eq!(set, again, "round trip of '{}'", input);
        }
    }

    #[test]
    fn test_explode() {
        assert_eq!(strings(&entry("id", "5").explode()), vec!["id:5"]);
        assert_eq!(
            strings(&entry("id", "1-3").explode()),
            vec!["id:1", "id:2", "id:3"]
        );
        assert_eq!(
            strings(&entry("id", "1-2:5-6").explode()),
            vec!["id:1", "id:2", "id:5", "id:6"]
        );
        assert!(entry("id", "5-1").explode().is_empty());
    }

    #[test]
    fn test_explode_skips_garbage_tokens() {
        let exploded = entry("id", "x:2:3-a:-4:4-4").explode();
        assert_eq!(strings(&exploded), vec!["id:2", "id:4"]);
    }

    #[test]
    fn test_explode_set_keeps_entry_order() {
        let set = GtidSet::parse(&format!("{U1}:1-3,{U2}:5-7")).unwrap();
        assert_eq!(
            strings(&set.explode()),
            vec![
                format!("{U1}:1"),
                format!("{U1}:2"),
                format!("{U1}:3"),
                format!("{U2}:5"),
                format!("{U2}:6"),
                format!("{U2}:7"),
            ]
        );
    }

    #[test]
    fn test_remove_server() {
        let set = GtidSet::parse(&format!("{U1}:1-3,{U2}:5,other:9")).unwrap();

        let (filtered, removed) = set.remove_server(U2);
        assert!(removed);
        assert_eq!(filtered.to_string(), format!("{U1}:1-3,other:9"));

        let (unchanged, removed) = set.remove_server("missing");
        assert!(!removed);
        assert_eq!(unchanged, set);
    }

    #[test]
    fn test_retain_servers() {
        let set = GtidSet::parse(&format!("{U1}:1-3,{U2}:5,other:9")).unwrap();

        let (filtered, any_removed) = set.retain_servers(&["other", U1]);
        assert!(any_removed);
        assert_eq!(filtered.to_string(), format!("{U1}:1-3,other:9"));

        let (same, any_removed) = set.retain_servers(&[U1, U2, "other"]);
        assert!(!any_removed);
        assert_eq!(same, set);
    }

    #[test]
    fn test_shared_server_ids() {
        let a = GtidSet::parse(&format!("{U1}:1-3,{U2}:5")).unwrap();
        let b = GtidSet::parse(&format!("{U2}:1-9,third:1")).unwrap();
        let shared = a.shared_server_ids(&b);
        assert_eq!(shared.len(), 1);
        assert!(shared.contains(U2));
    }

    #[test]
    fn test_fix_plan_from_errant() {
        let plan = FixPlan::from_errant("u1:6-10").unwrap();
        assert_eq!(plan.len(), 5);
        assert_eq!(
            plan.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["u1:6", "u1:7", "u1:8", "u1:9", "u1:10"]
        );

        assert!(FixPlan::from_errant("").unwrap().is_empty());
        assert!(FixPlan::from_errant("u1:5-1").unwrap().is_empty());
        assert!(FixPlan::from_errant("no-colon").is_err());
    }

    #[test]
    fn test_validate_gtid() {
        let ok = ExplodedGtid { server_id: U1.into(), transaction: 7 };
        assert!(ok.validate().is_ok());

        let quoted = ExplodedGtid { server_id: "a'b".into(), transaction: 1 };
        assert!(quoted.validate().is_err());

        let zero = ExplodedGtid { server_id: U1.into(), transaction: 0 };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_transaction_count_without_expanding() {
        let set = GtidSet::parse(&format!("{U1}:1-4000000000:4000000005,{U2}:7-3:9")).unwrap();
        assert_eq!(set.transaction_count(), 4_000_000_002);
        assert_eq!(GtidSet::new().transaction_count(), 0);
    }
}
