//! Per-day sequence codes (`Q` + `YYYYMMDD` + sequence), used as group namespaces.

use crate::errors::{FileError, FileResult};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{fmt, sync::Arc};
use tracing::info;

const PREFIX: char = 'Q';

/// A parsed sequence code.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct SequenceCode {
    pub date: NaiveDate,
    pub seq: u32,
}

impl SequenceCode {
    /// `Q` + 8 date digits + at least 2 sequence digits, with a real date.
    pub fn parse(code: &str) -> Option<Self> {
        let rest = code.strip_prefix(PREFIX)?;
        if rest.len() < 10 || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(&rest[..8], "%Y%m%d").ok()?;
        let seq = rest[8..].parse().ok()?;
        Some(Self { date, seq })
    }

    pub fn is_valid(code: &str) -> bool {
        Self::parse(code).is_some()
    }
}

impl fmt::Display for SequenceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:02}", PREFIX, self.date.format("%Y%m%d"), self.seq)
    }
}

#[derive(Clone)]
pub struct SequenceGenerator {
    db: Arc<SqlitePool>,
}

impl SequenceGenerator {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Next code for `date`. Seed, increment and read back happen in one
    /// transaction holding the write lock, so concurrent callers always get
    /// distinct numbers.
    pub async fn generate(&self, date: NaiveDate) -> FileResult<SequenceCode> {
        let date_key = date.format("%Y-%m-%d").to_string();
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO sequence_counters (date_key, last_seq) VALUES (?, 0)
             ON CONFLICT(date_key) DO NOTHING",
        )
        .bind(&date_key)
        .execute(&mut *tx)
        .await?;

        let seq: i64 = sqlx::query_scalar(
            "UPDATE sequence_counters SET last_seq = last_seq + 1 WHERE date_key = ? RETURNING last_seq",
        )
        .bind(&date_key)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let seq = u32::try_from(seq)
            .map_err(|_| FileError::Conflict(format!("sequence for {} overflowed", date_key)))?;
        Ok(SequenceCode { date, seq })
    }

    pub async fn generate_today(&self) -> FileResult<SequenceCode> {
        self.generate(Utc::now().date_naive()).await
    }

    /// The owner's group code, minting and storing one first if it has none.
    pub async fn ensure_group_code(&self, owner_id: i64) -> FileResult<String> {
        let existing: Option<Option<String>> =
            sqlx::query_scalar("SELECT group_code FROM owners WHERE id = ?")
                .bind(owner_id)
                .fetch_optional(&*self.db)
                .await?;
        match existing {
            None => return Err(FileError::NotFound(format!("owner {}", owner_id))),
            Some(Some(code)) if !code.trim().is_empty() => return Ok(code),
            Some(_) => {}
        }

        let code = self.generate_today().await?.to_string();
        // Another request may have assigned one meanwhile; keep whichever landed first.
        sqlx::query(
            "UPDATE owners SET group_code = ? WHERE id = ? AND (group_code IS NULL OR group_code = '')",
        )
        .bind(&code)
        .bind(owner_id)
        .execute(&*self.db)
        .await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT group_code FROM owners WHERE id = ?")
                .bind(owner_id)
                .fetch_one(&*self.db)
                .await?;
        let stored = stored.unwrap_or(code);
        info!("owner {} has group code {}", owner_id, stored);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_format_and_parse() {
        let code = SequenceCode {
            date: day(2025, 1, 3),
            seq: 1,
        };
        assert_eq!(code.to_string(), "Q2025010301");
        assert_eq!(SequenceCode::parse("Q2025010301"), Some(code));
        assert_eq!(
            SequenceCode::parse("Q20250103123").map(|c| c.seq),
            Some(123)
        );
        assert!(SequenceCode::parse("Q202501031").is_none());
        assert!(SequenceCode::parse("P2025010301").is_none());
        assert!(SequenceCode::parse("Q2025139901").is_none());
        assert!(!SequenceCode::is_valid("Q20250103ab"));
    }

    #[tokio::test]
    async fn test_generate_counts_per_day() {
        let generator = SequenceGenerator::new(db::test_pool().await);
        let d1 = day(2025, 1, 3);
        let d2 = day(2025, 1, 4);

        assert_eq!(generator.generate(d1).await.unwrap().seq, 1);
        assert_eq!(generator.generate(d1).await.unwrap().seq, 2);
        assert_eq!(generator.generate(d2).await.unwrap().to_string(), "Q2025010401");
    }

    #[tokio::test]
    async fn test_concurrent_generate_is_gapless() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("seq.db").display());
        let pool = db::connect(&url, 8).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let generator = SequenceGenerator::new(pool);
        let date = day(2025, 6, 1);

        let handles: Vec<_> = (0..24)
            .map(|_| {
                let generator = generator.clone();
                tokio::spawn(async move { generator.generate(date).await.unwrap().seq })
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.unwrap()));
        }
        assert_eq!(seen, (1..=24).collect::<HashSet<u32>>());
    }

    #[tokio::test]
    async fn test_ensure_group_code() {
        let pool = db::test_pool().await;
        sqlx::query("INSERT INTO owners (id, name) VALUES (1, 'Acme')")
            .execute(&*pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO owners (id, name, group_code) VALUES (2, 'Beta', 'Q2024010105')")
            .execute(&*pool)
            .await
            .unwrap();
        let generator = SequenceGenerator::new(pool);

        let first = generator.ensure_group_code(1).await.unwrap();
        assert!(SequenceCode::is_valid(&first));
        assert_eq!(generator.ensure_group_code(1).await.unwrap(), first);
        assert_eq!(generator.ensure_group_code(2).await.unwrap(), "Q2024010105");
        assert!(matches!(
            generator.ensure_group_code(3).await,
            Err(FileError::NotFound(_))
        ));
    }
}
