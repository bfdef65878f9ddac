// XA command vocabulary and transaction identifiers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::common::types::{ResultSet, Xid};

/// Format of the 14-digit timestamps used in xids and recovery entries
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Current UTC time as a 14-digit timestamp
pub fn timestamp_now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Statements sent to a backend to drive one branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaCommand<'a> {
    Start(&'a str),
    End(&'a str),
    Prepare(&'a str),
    Commit(&'a str),
    CommitOnePhase(&'a str),
    Rollback(&'a str),
    Recover,
}

impl fmt::Display for XaCommand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XaCommand::Start(xid) => write!(f, "XA START '{}'", xid),
            XaCommand::End(xid) => write!(f, "XA END '{}'", xid),
            XaCommand::Prepare(xid) => write!(f, "XA PREPARE '{}'", xid),
            XaCommand::Commit(xid) => write!(f, "XA COMMIT '{}'", xid),
            XaCommand::CommitOnePhase(xid) => write!(f, "XA COMMIT '{}' ONE PHASE", xid),
            XaCommand::Rollback(xid) => write!(f, "XA ROLLBACK '{}'", xid),
            XaCommand::Recover => write!(f, "XA RECOVER"),
        }
    }
}

/// Allocates globally unique xids of the form `<prefix>-<timestamp>-<seq>`
#[derive(Debug)]
pub struct XidGenerator {
    prefix: String,
    next_seq: AtomicU64,
}

impl XidGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn next_xid(&self) -> Xid {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}-{}", self.prefix, timestamp_now(), seq)
    }
}

/// Rebuild the xids from an `XA RECOVER` result.
///
/// Each row is `(formatID, gtrid_length, bqual_length, data)` and the xid is the
/// leading `gtrid_length` bytes of `data`. Rows that do not have this shape are
/// skipped.
pub fn parse_recover_result(rs: &ResultSet) -> Vec<Xid> {
    rs.rows
        .iter()
        .filter_map(|row| {
            let gtrid_len = usize::try_from(row.get(1)?.as_i64()?).ok()?;
            let data = decode_xid_data(row.get(3)?.as_str()?)?;
            let gtrid = data.get(..gtrid_len)?;
            String::from_utf8(gtrid.to_vec()).ok()
        })
        .collect()
}

// `XA RECOVER CONVERT XID` renders data as 0x-prefixed hex
fn decode_xid_data(data: &str) -> Option<Vec<u8>> {
    match data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")) {
        Some(hex_data) => hex::decode(hex_data).ok(),
        None => Some(data.as_bytes().to_vec()),
    }
}
