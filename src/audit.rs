//! Persistent audit trail of payment authorizations and their disposition.
//!
//! One row per nonce, keyed unique. Rows are inserted when a payload passes
//! verification (`INSERT OR IGNORE`, so repeated verifies stay idempotent) and
//! move monotonically from `verified` to `settled` or `failed`; there are no
//! reverse transitions. The store records outcomes and never gates a payment
//! decision: a write failure is logged by the caller, not surfaced to payers.

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::types::{Nonce, PaymentRequirements, TokenAmount, TransactionHash, UptoPayload};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS payments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        payer TEXT NOT NULL,
        recipient TEXT NOT NULL,
        token TEXT NOT NULL,
        authorized_amount TEXT NOT NULL,
        settled_amount TEXT,
        nonce TEXT NOT NULL UNIQUE,
        tx_hash TEXT,
        status TEXT NOT NULL DEFAULT 'verified',
        error TEXT,
        network TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        settled_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_payments_payer ON payments(payer);
    CREATE INDEX IF NOT EXISTS idx_payments_status ON payments(status);
    CREATE INDEX IF NOT EXISTS idx_payments_nonce ON payments(nonce);
";

/// Audit row fields captured at verification time.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub payer: String,
    pub recipient: String,
    pub token: String,
    pub authorized_amount: String,
    pub nonce: String,
    pub network: String,
}

impl PaymentRecord {
    /// Extracts the audit fields from a verified payload and its requirements.
    pub fn from_payment(payload: &UptoPayload, requirements: &PaymentRequirements) -> Self {
        let authorization = &payload.permit_2_authorization;
        PaymentRecord {
            payer: authorization.from.to_string(),
            recipient: authorization.witness.to.to_string(),
            token: authorization.permitted.token.to_string(),
            authorized_amount: authorization.permitted.amount.to_string(),
            nonce: authorization.nonce.to_string(),
            network: requirements.network.to_string(),
        }
    }
}

/// Aggregate view over all audit rows, served from `GET /stats`.
///
/// `savings_percent` is how much payers saved relative to what they signed:
/// `round(100 * (1 - totalSettled / totalAuthorized))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStats {
    pub total_payments: u64,
    pub settled_payments: u64,
    pub total_authorized: String,
    pub total_settled: String,
    pub savings_percent: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// SQLite-backed audit store. Concurrent writers are serialized through the
/// connection mutex; the `UNIQUE(nonce)` constraint is the only cross-request
/// invariant enforced at the database layer.
pub struct AuditStore {
    conn: Mutex<Connection>,
}

impl AuditStore {
    /// Opens (or creates) the audit database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, AuditError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, useful for tests.
    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Records a freshly verified authorization.
    ///
    /// Idempotent over the nonce: a second verify of the same payload leaves
    /// the existing row (and its status) untouched.
    pub fn record_verified(&self, record: &PaymentRecord) -> Result<(), AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO payments
                (payer, recipient, token, authorized_amount, nonce, status, network, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'verified', ?6, ?7)",
            params![
                record.payer,
                record.recipient,
                record.token,
                record.authorized_amount,
                record.nonce,
                record.network,
                now_secs(),
            ],
        )?;
        Ok(())
    }

    /// Moves a row from `verified` to `settled`, recording the amount and
    /// transaction hash. Rows already settled or failed are left untouched.
    pub fn mark_settled(
        &self,
        nonce: &Nonce,
        settled_amount: &TokenAmount,
        tx_hash: &TransactionHash,
    ) -> Result<(), AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE payments
                SET status = 'settled', settled_amount = ?1, tx_hash = ?2, settled_at = ?3
              WHERE nonce = ?4 AND status = 'verified'",
            params![
                settled_amount.to_string(),
                tx_hash.to_string(),
                now_secs(),
                nonce.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Moves a row from `verified` to `failed`, recording the error tag.
    pub fn mark_failed(&self, nonce: &Nonce, error: &str) -> Result<(), AuditError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE payments
                SET status = 'failed', error = ?1, settled_at = ?2
              WHERE nonce = ?3 AND status = 'verified'",
            params![error, now_secs(), nonce.to_string()],
        )?;
        Ok(())
    }

    /// Single-pass aggregates over the whole table.
    pub fn stats(&self) -> Result<PaymentStats, AuditError> {
        let conn = self.conn.lock().unwrap();
        let (total_payments, settled_payments, total_authorized, total_settled): (
            u64,
            u64,
            i64,
            i64,
        ) = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(CASE WHEN status = 'settled' THEN 1 END),
                    COALESCE(SUM(CAST(authorized_amount AS INTEGER)), 0),
                    COALESCE(SUM(CASE WHEN status = 'settled'
                                      THEN CAST(settled_amount AS INTEGER)
                                      ELSE 0 END), 0)
               FROM payments",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let savings_percent = if total_authorized > 0 {
            ((1.0 - total_settled as f64 / total_authorized as f64) * 100.0).round() as i64
        } else {
            0
        };
        Ok(PaymentStats {
            total_payments,
            settled_payments,
            total_authorized: total_authorized.to_string(),
            total_settled: total_settled.to_string(),
            savings_percent,
        })
    }

    /// Current status of the row keyed by `nonce`, if any.
    pub fn status_of(&self, nonce: &Nonce) -> Result<Option<String>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let status = conn
            .query_row(
                "SELECT status FROM payments WHERE nonce = ?1",
                [nonce.to_string()],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(e),
            })?;
        Ok(status)
    }
}

fn now_secs() -> i64 {
    crate::timestamp::UnixTimestamp::now().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::B256;

    fn record(nonce: u64, authorized: u64) -> PaymentRecord {
        PaymentRecord {
            payer: "0x1111111111111111111111111111111111111111".into(),
            recipient: "0x2222222222222222222222222222222222222222".into(),
            token: "0x036CbD53842c5426634e7929541eC2318f3dCF7e".into(),
            authorized_amount: authorized.to_string(),
            nonce: nonce.to_string(),
            network: "eip155:84532".into(),
        }
    }

    fn nonce(n: u64) -> Nonce {
        Nonce::from(n)
    }

    fn tx_hash() -> TransactionHash {
        TransactionHash(B256::repeat_byte(0xcd))
    }

    #[test]
    fn verify_insert_is_idempotent() {
        let store = AuditStore::open_in_memory().unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_payments, 1);
    }

    #[test]
    fn settles_move_verified_rows() {
        let store = AuditStore::open_in_memory().unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        store
            .mark_settled(&nonce(1), &TokenAmount::from(43_700u64), &tx_hash())
            .unwrap();
        assert_eq!(store.status_of(&nonce(1)).unwrap().as_deref(), Some("settled"));
    }

    #[test]
    fn failures_move_verified_rows() {
        let store = AuditStore::open_in_memory().unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        store.mark_failed(&nonce(1), "transaction_reverted").unwrap();
        assert_eq!(store.status_of(&nonce(1)).unwrap().as_deref(), Some("failed"));
    }

    #[test]
    fn transitions_are_monotonic() {
        let store = AuditStore::open_in_memory().unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        store.mark_failed(&nonce(1), "transaction_reverted").unwrap();
        // A later settle attempt must not resurrect the failed row
        store
            .mark_settled(&nonce(1), &TokenAmount::from(1u64), &tx_hash())
            .unwrap();
        assert_eq!(store.status_of(&nonce(1)).unwrap().as_deref(), Some("failed"));
    }

    #[test]
    fn settle_of_unknown_nonce_is_a_noop() {
        let store = AuditStore::open_in_memory().unwrap();
        store
            .mark_settled(&nonce(9), &TokenAmount::from(1u64), &tx_hash())
            .unwrap();
        assert!(store.status_of(&nonce(9)).unwrap().is_none());
    }

    #[test]
    fn aggregates_count_only_settled_amounts() {
        let store = AuditStore::open_in_memory().unwrap();
        store.record_verified(&record(1, 1_000_000)).unwrap();
        store.record_verified(&record(2, 1_000_000)).unwrap();
        store.record_verified(&record(3, 2_000_000)).unwrap();
        store
            .mark_settled(&nonce(1), &TokenAmount::from(400_000u64), &tx_hash())
            .unwrap();
        store
            .mark_settled(&nonce(2), &TokenAmount::from(600_000u64), &tx_hash())
            .unwrap();
        store.mark_failed(&nonce(3), "transaction_reverted").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_payments, 3);
        assert_eq!(stats.settled_payments, 2);
        assert_eq!(stats.total_authorized, "4000000");
        assert_eq!(stats.total_settled, "1000000");
        // 1 - 1M/4M = 75%
        assert_eq!(stats.savings_percent, 75);
    }

    #[test]
    fn stats_on_empty_store_are_zero() {
        let store = AuditStore::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_payments, 0);
        assert_eq!(stats.savings_percent, 0);
        assert_eq!(stats.total_authorized, "0");
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        {
            let store = AuditStore::open(&path).unwrap();
            store.record_verified(&record(7, 500_000)).unwrap();
        }
        {
            let store = AuditStore::open(&path).unwrap();
            assert_eq!(
                store.status_of(&nonce(7)).unwrap().as_deref(),
                Some("verified")
            );
        }
    }

    #[test]
    fn stats_serialize_camel_case() {
        let stats = PaymentStats {
            total_payments: 2,
            settled_payments: 1,
            total_authorized: "2000000".into(),
            total_settled: "43700".into(),
            savings_percent: 98,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalPayments"], 2);
        assert_eq!(json["settledPayments"], 1);
        assert_eq!(json["totalAuthorized"], "2000000");
        assert_eq!(json["totalSettled"], "43700");
        assert_eq!(json["savingsPercent"], 98);
    }
}
