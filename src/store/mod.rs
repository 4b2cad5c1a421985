//! Shared key/value stores: the deployment ledger and the sink status cache
//!
//! Both stores only rely on single-key atomicity. Every write is idempotent
//! on its own so multi-step updates can be resumed after a crash.

pub mod ledger;
pub mod status_cache;

pub use ledger::{ledger_key, DeploymentLedger, MemoryLedger, RedisLedger, LEDGER_KEY_PREFIX};
pub use status_cache::{
    status_key, MemoryStatusCache, RedisStatusCache, StatusCache, STATUS_KEY_PREFIX,
};

use redis::aio::ConnectionManager;

use crate::error::Result;

const SCAN_COUNT: usize = 100;

/// Collect all keys matching a glob pattern using cursor-based SCAN
pub(crate) async fn scan_keys(conn: &mut ConnectionManager, pattern: &str) -> Result<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();

    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(conn)
            .await?;

        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }

    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Escape glob metacharacters so an id only matches itself in SCAN patterns
pub(crate) fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
