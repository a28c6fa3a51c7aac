//! GTID structures for MariaDB and MySQL flavors.
//!
//! MariaDB GTIDs are `domain-server-sequence` triplets; a server position is
//! a comma-separated list with at most one entry per replication domain.
//! MySQL GTID sets (`uuid:interval[,...]`) are kept as normalized opaque
//! strings: the core only ever compares them for equality, promotion on the
//! MySQL path uses auto-positioning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single MariaDB GTID: domain, originating server id, sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub domain_id: u32,
    pub server_id: u64,
    pub seq_no: u64,
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain_id, self.server_id, self.seq_no)
    }
}

impl FromStr for Gtid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '-');
        let domain_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid gtid domain in {:?}", s))?;
        let server_id = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid gtid server id in {:?}", s))?;
        let seq_no = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid gtid sequence in {:?}", s))?;
        Ok(Gtid {
            domain_id,
            server_id,
            seq_no,
        })
    }
}

/// A MariaDB GTID position: at most one [`Gtid`] per domain, kept sorted by
/// domain id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidList {
    entries: Vec<Gtid>,
}

impl GtidList {
    /// Parse a position string such as `"0-1-100,1-2-5"`.
    ///
    /// Malformed segments are skipped: the backend occasionally reports
    /// transient garbage mid-rotation and a position must never fail to load.
    pub fn parse(s: &str) -> Self {
        let mut by_domain: BTreeMap<u32, Gtid> = BTreeMap::new();
        for seg in s.split(',') {
            let seg = seg.trim();
            if seg.is_empty() {
                continue;
            }
            if let Ok(gtid) = seg.parse::<Gtid>() {
                by_domain.insert(gtid.domain_id, gtid);
            }
        }
        GtidList {
            entries: by_domain.into_values().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[Gtid] {
        &self.entries
    }

    /// Sequence number for one domain, if present.
    pub fn seq_for_domain(&self, domain_id: u32) -> Option<u64> {
        self.entries
            .iter()
            .find(|g| g.domain_id == domain_id)
            .map(|g| g.seq_no)
    }

    /// Sum of sequence numbers across domains. Used as a coarse total order
    /// when ranking failover candidates.
    pub fn seq_total(&self) -> u64 {
        self.entries.iter().map(|g| g.seq_no).sum()
    }

    /// Positional equality: same domains, same server ids, same sequences.
    /// The relay-log drain loop compares IO and SQL positions with this.
    pub fn equal(&self, other: &GtidList) -> bool {
        self == other
    }

    /// Record a transaction: replaces the domain entry when the sequence
    /// advances. No-op for stale sequences.
    pub fn advance(&mut self, gtid: Gtid) {
        match self
            .entries
            .iter_mut()
            .find(|g| g.domain_id == gtid.domain_id)
        {
            Some(existing) => {
                if gtid.seq_no > existing.seq_no {
                    *existing = gtid;
                }
            }
            None => {
                self.entries.push(gtid);
                self.entries.sort_by_key(|g| g.domain_id);
            }
        }
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for gtid in &self.entries {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", gtid)?;
            first = false;
        }
        Ok(())
    }
}

/// A MySQL GTID set kept as a normalized opaque string
/// (lowercased, whitespace stripped).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MysqlGtidSet(String);

impl MysqlGtidSet {
    pub fn parse(s: &str) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        MysqlGtidSet(normalized)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MysqlGtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
