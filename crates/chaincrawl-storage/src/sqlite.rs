//! SQLite storage backend for ChainCrawl.
//!
//! Persists blocks, transactions, checkpoints, and issues to a single SQLite
//! file through `sqlx`, with WAL mode on. Batch writes run inside one
//! transaction each, so a failed batch leaves nothing behind.
//!
//! # Usage
//! ```rust,no_run
//! use chaincrawl_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./chaincrawl.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use chaincrawl_core::error::CrawlerError;
use chaincrawl_core::issue::Issue;
use chaincrawl_core::model::{BlockRow, Checkpoint, CheckpointKind, TransactionRow};
use chaincrawl_core::storage::Storage;

/// Keeps `IN (...)` lists under SQLite's bound-parameter limit.
const IN_CHUNK: usize = 500;

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, uncle_hash, state_root, transactions_root, \
     receipts_root, miner, timestamp, size, gas_limit, gas_used, difficulty, total_difficulty, \
     transaction_count, system_transaction_count, creator, attestor, mint_duration";

const TX_COLUMNS: &str =
    "hash, block_number, block_hash, transaction_index, from_address, to_address, value, nonce, gas, gas_price";

fn storage_err(e: sqlx::Error) -> CrawlerError {
    CrawlerError::Storage(e.to_string())
}

/// SQLite-backed crawler storage.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./chaincrawl.db"`) or a full
    /// SQLite URL (`"sqlite:./chaincrawl.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, CrawlerError> {
        if path == "sqlite::memory:" || path == ":memory:" {
            return Self::in_memory().await;
        }
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// One connection that never idles out, so every query sees the same
    /// database. All data is lost when the storage is dropped.
    pub async fn in_memory() -> Result<Self, CrawlerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    // ─── Inspection ─────────────────────────────────────────────────────────────

    pub async fn block_count(&self) -> Result<u64, CrawlerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    pub async fn transaction_count(&self) -> Result<u64, CrawlerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM transactions")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn block_from_row(r: &SqliteRow) -> BlockRow {
    BlockRow {
        number: r.get::<i64, _>("number") as u64,
        hash: r.get("hash"),
        parent_hash: r.get("parent_hash"),
        uncle_hash: r.get("uncle_hash"),
        state_root: r.get("state_root"),
        transactions_root: r.get("transactions_root"),
        receipts_root: r.get("receipts_root"),
        miner: r.get("miner"),
        timestamp: r.get("timestamp"),
        size: r.get::<i64, _>("size") as u64,
        gas_limit: r.get::<i64, _>("gas_limit") as u64,
        gas_used: r.get::<i64, _>("gas_used") as u64,
        difficulty: r.get("difficulty"),
        total_difficulty: r.get("total_difficulty"),
        transaction_count: r.get::<i64, _>("transaction_count") as u32,
        system_transaction_count: r.get::<i64, _>("system_transaction_count") as u32,
        creator: r.get("creator"),
        attestor: r.get("attestor"),
        mint_duration: r.get::<Option<i64>, _>("mint_duration").map(|d| d as u64),
    }
}

fn transaction_from_row(r: &SqliteRow) -> TransactionRow {
    TransactionRow {
        hash: r.get("hash"),
        block_number: r.get::<i64, _>("block_number") as u64,
        block_hash: r.get("block_hash"),
        transaction_index: r.get::<i64, _>("transaction_index") as u32,
        from: r.get("from_address"),
        to: r.get("to_address"),
        value: r.get("value"),
        nonce: r.get::<i64, _>("nonce") as u64,
        gas: r.get::<i64, _>("gas") as u64,
        gas_price: r.get("gas_price"),
    }
}

fn issue_from_row(r: &SqliteRow) -> Result<Issue, CrawlerError> {
    let kind: String = r.get("kind");
    let extras: String = r.get("extras");
    Ok(Issue {
        kind: kind.parse().map_err(CrawlerError::Storage)?,
        block_number: r.get::<i64, _>("block_number") as u64,
        block_hash: r.get("block_hash"),
        tx_hash: r.get("tx_hash"),
        extras: serde_json::from_str::<BTreeMap<_, _>>(&extras)
            .map_err(|e| CrawlerError::Storage(format!("corrupt issue extras: {e}")))?,
        checksum: r.get("checksum"),
        observed_at: r.get("observed_at"),
    })
}

// ─── Storage impl ────────────────────────────────────────────────────────────

#[async_trait]
impl Storage for SqliteStorage {
    /// Create tables and enable WAL mode.
    async fn migrate(&self) -> Result<(), CrawlerError> {
        // in-memory databases answer "memory"; that is fine
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                number                   INTEGER PRIMARY KEY,
                hash                     TEXT    NOT NULL,
                parent_hash              TEXT    NOT NULL,
                uncle_hash               TEXT    NOT NULL,
                state_root               TEXT    NOT NULL,
                transactions_root        TEXT    NOT NULL,
                receipts_root            TEXT    NOT NULL,
                miner                    TEXT    NOT NULL,
                timestamp                INTEGER NOT NULL,
                size                     INTEGER NOT NULL,
                gas_limit                INTEGER NOT NULL,
                gas_used                 INTEGER NOT NULL,
                difficulty               TEXT    NOT NULL,
                total_difficulty         TEXT    NOT NULL,
                transaction_count        INTEGER NOT NULL,
                system_transaction_count INTEGER NOT NULL,
                creator                  TEXT,
                attestor                 TEXT,
                mint_duration            INTEGER
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks (hash);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash              TEXT    PRIMARY KEY,
                block_number      INTEGER NOT NULL,
                block_hash        TEXT    NOT NULL,
                transaction_index INTEGER NOT NULL,
                from_address      TEXT    NOT NULL,
                to_address        TEXT,
                value             TEXT    NOT NULL,
                nonce             INTEGER NOT NULL,
                gas               INTEGER NOT NULL,
                gas_price         TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions (block_number);")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                kind         TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS issues (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                kind         TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                tx_hash      TEXT    NOT NULL,
                extras       TEXT    NOT NULL,
                checksum     TEXT    NOT NULL UNIQUE,
                observed_at  INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!("sqlite schema ready");
        Ok(())
    }

    async fn get_blocks(&self, numbers: &[u64]) -> Result<Vec<BlockRow>, CrawlerError> {
        let mut out = Vec::with_capacity(numbers.len());
        for chunk in numbers.chunks(IN_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE number IN ("));
            let mut list = qb.separated(", ");
            for n in chunk {
                list.push_bind(*n as i64);
            }
            list.push_unseparated(") ORDER BY number");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
            out.extend(rows.iter().map(block_from_row));
        }
        Ok(out)
    }

    async fn get_blocks_by_hashes(&self, hashes: &[String]) -> Result<Vec<BlockRow>, CrawlerError> {
        let mut out = Vec::new();
        for chunk in hashes.chunks(IN_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE hash IN ("));
            let mut list = qb.separated(", ");
            for h in chunk {
                list.push_bind(h.as_str());
            }
            list.push_unseparated(") ORDER BY number");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
            out.extend(rows.iter().map(block_from_row));
        }
        Ok(out)
    }

    async fn save_blocks(&self, new: &[BlockRow], changed: &[BlockRow]) -> Result<(), CrawlerError> {
        if new.is_empty() && changed.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for b in new.iter().chain(changed) {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO blocks ({BLOCK_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(b.number as i64)
            .bind(&b.hash)
            .bind(&b.parent_hash)
            .bind(&b.uncle_hash)
            .bind(&b.state_root)
            .bind(&b.transactions_root)
            .bind(&b.receipts_root)
            .bind(&b.miner)
            .bind(b.timestamp)
            .bind(b.size as i64)
            .bind(b.gas_limit as i64)
            .bind(b.gas_used as i64)
            .bind(&b.difficulty)
            .bind(&b.total_difficulty)
            .bind(b.transaction_count as i64)
            .bind(b.system_transaction_count as i64)
            .bind(&b.creator)
            .bind(&b.attestor)
            .bind(b.mint_duration.map(|d| d as i64))
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(new = new.len(), changed = changed.len(), "blocks saved");
        Ok(())
    }

    async fn get_transactions(&self, hashes: &[String]) -> Result<Vec<TransactionRow>, CrawlerError> {
        let mut out = Vec::with_capacity(hashes.len());
        for chunk in hashes.chunks(IN_CHUNK) {
            let mut qb =
                QueryBuilder::<Sqlite>::new(format!("SELECT {TX_COLUMNS} FROM transactions WHERE hash IN ("));
            let mut list = qb.separated(", ");
            for h in chunk {
                list.push_bind(h.as_str());
            }
            list.push_unseparated(")");
            let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
            out.extend(rows.iter().map(transaction_from_row));
        }
        Ok(out)
    }

    async fn save_transactions(
        &self,
        new: &[TransactionRow],
        changed: &[TransactionRow],
    ) -> Result<(), CrawlerError> {
        if new.is_empty() && changed.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for t in new.iter().chain(changed) {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO transactions ({TX_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&t.hash)
            .bind(t.block_number as i64)
            .bind(&t.block_hash)
            .bind(t.transaction_index as i64)
            .bind(&t.from)
            .bind(&t.to)
            .bind(&t.value)
            .bind(t.nonce as i64)
            .bind(t.gas as i64)
            .bind(&t.gas_price)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        debug!(new = new.len(), changed = changed.len(), "transactions saved");
        Ok(())
    }

    async fn get_checkpoint(&self, kind: CheckpointKind) -> Result<Option<Checkpoint>, CrawlerError> {
        let row = sqlx::query("SELECT block_number, updated_at FROM checkpoints WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        Ok(row.map(|r| Checkpoint {
            kind,
            block_number: r.get::<i64, _>("block_number") as u64,
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save_checkpoint(&self, kind: CheckpointKind, block_number: u64) -> Result<(), CrawlerError> {
        let cp = Checkpoint::new(kind, block_number);
        sqlx::query(
            "INSERT INTO checkpoints (kind, block_number, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(kind) DO UPDATE SET
                block_number = MAX(checkpoints.block_number, excluded.block_number),
                updated_at   = excluded.updated_at",
        )
        .bind(kind.as_str())
        .bind(cp.block_number as i64)
        .bind(cp.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(kind = %kind, block = block_number, "checkpoint saved");
        Ok(())
    }

    async fn save_issues(&self, issues: &[Issue]) -> Result<usize, CrawlerError> {
        if issues.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let mut inserted = 0u64;
        for issue in issues {
            let extras = serde_json::to_string(&issue.extras).map_err(|e| CrawlerError::Storage(e.to_string()))?;
            let res = sqlx::query(
                "INSERT OR IGNORE INTO issues
                 (kind, block_number, block_hash, tx_hash, extras, checksum, observed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(issue.kind.as_str())
            .bind(issue.block_number as i64)
            .bind(&issue.block_hash)
            .bind(&issue.tx_hash)
            .bind(&extras)
            .bind(&issue.checksum)
            .bind(issue.observed_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
            inserted += res.rows_affected();
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(inserted as usize)
    }

    async fn issues(&self) -> Result<Vec<Issue>, CrawlerError> {
        let rows = sqlx::query(
            "SELECT kind, block_number, block_hash, tx_hash, extras, checksum, observed_at
             FROM issues ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(issue_from_row).collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str) -> BlockRow {
        BlockRow {
            number,
            hash: hash.into(),
            parent_hash: "0x00".into(),
            miner: "0xminer".into(),
            timestamp: 1_700_000_000 + number as i64,
            gas_limit: 30_000_000,
            difficulty: "2".into(),
            total_difficulty: "200".into(),
            transaction_count: 3,
            system_transaction_count: 1,
            creator: Some("0xcreator".into()),
            mint_duration: Some(3),
            ..Default::default()
        }
    }

    fn tx(hash: &str, block_number: u64) -> TransactionRow {
        TransactionRow {
            hash: hash.into(),
            block_number,
            block_hash: format!("0x{block_number:02x}"),
            transaction_index: 0,
            from: "0xfrom".into(),
            to: None,
            value: "1000000000000000000".into(),
            nonce: 7,
            gas: 21_000,
            gas_price: "5000000000".into(),
        }
    }

    #[tokio::test]
    async fn block_rows_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save_blocks(&[block(100, "0xaa"), block(101, "0xbb")], &[]).await.unwrap();

        let rows = store.get_blocks(&[101, 100, 999]).await.unwrap();
        assert_eq!(rows, vec![block(100, "0xaa"), block(101, "0xbb")]);

        let by_hash = store.get_blocks_by_hashes(&["0xbb".into()]).await.unwrap();
        assert_eq!(by_hash[0].number, 101);
    }

    #[tokio::test]
    async fn changed_rows_overwrite_in_place() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save_blocks(&[block(100, "0xaa")], &[]).await.unwrap();
        store.save_blocks(&[], &[block(100, "0xcc")]).await.unwrap();

        assert_eq!(store.block_count().await.unwrap(), 1);
        assert_eq!(store.get_blocks(&[100]).await.unwrap()[0].hash, "0xcc");
    }

    #[tokio::test]
    async fn transaction_rebinding() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save_transactions(&[tx("0x01", 10)], &[]).await.unwrap();
        store.save_transactions(&[], &[tx("0x01", 12)]).await.unwrap();

        let rows = store.get_transactions(&["0x01".into(), "0x02".into()]).await.unwrap();
        assert_eq!(rows, vec![tx("0x01", 12)]);
        assert_eq!(store.transaction_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn checkpoint_keeps_the_maximum() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.get_checkpoint(CheckpointKind::Index).await.unwrap().is_none());

        store.save_checkpoint(CheckpointKind::Index, 110).await.unwrap();
        store.save_checkpoint(CheckpointKind::Index, 95).await.unwrap();
        store.save_checkpoint(CheckpointKind::Trace, 7).await.unwrap();

        assert_eq!(store.highest_index_block().await.unwrap(), Some(110));
        assert_eq!(store.highest_trace_block().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn issue_checksum_is_unique() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let reorg = Issue::reorg(105, "0xaa", "0xbb");
        let dup = Issue::duplicated_tx_hash("0x01", 12, "0x0c", 10, "0x0a");

        assert_eq!(store.save_issues(&[reorg.clone(), dup.clone()]).await.unwrap(), 2);
        assert_eq!(store.save_issues(&[reorg.clone()]).await.unwrap(), 0);

        let stored = store.issues().await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].checksum, reorg.checksum);
        assert_eq!(stored[1].extras, dup.extras);
        assert_eq!(stored[1].expected_checksum(), dup.checksum);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.save_blocks(&[block(1, "0x01")], &[]).await.unwrap();
        store.migrate().await.unwrap();
        assert_eq!(store.block_count().await.unwrap(), 1);
    }
}
