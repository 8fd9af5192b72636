use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use newshound_core::{Article, ArticleRecord, Ticker, TickerStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("stored {column} is not a valid timestamp: {value:?}")]
    CorruptTimestamp { column: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

const ARTICLE_COLUMNS: &str = r#"
    a.id, a.ticker_id, t.symbol AS ticker_symbol, a.url, a.title, a.date_published,
    a.source, a.author, a.text, a.summary, a.sentiment, a.fetch_date
"#;

/// Single-connection pool; each write is its own transaction.
#[derive(Debug, Clone)]
pub struct NewsStore {
    pool: SqlitePool,
}

impl NewsStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = single_connection_pool().connect_with(options).await?;
        info!(path = %path.display(), "opened news store");
        Self::from_pool(pool).await
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = single_connection_pool().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Keyed by `record.url`. Creates the ticker row on first sight.
    pub async fn upsert_article(&self, record: &ArticleRecord) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let ticker_id = touch_ticker(&mut tx, &record.ticker_symbol, record.fetch_date).await?;

        let existed = sqlx::query("SELECT 1 FROM articles WHERE url = ?")
            .bind(&record.url)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        sqlx::query(
            r#"
            INSERT INTO articles
                (ticker_id, url, title, date_published, source, author, text, summary, sentiment, fetch_date)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (url) DO UPDATE SET
                ticker_id = excluded.ticker_id,
                title = excluded.title,
                date_published = excluded.date_published,
                source = excluded.source,
                author = excluded.author,
                text = excluded.text,
                summary = excluded.summary,
                sentiment = excluded.sentiment,
                fetch_date = excluded.fetch_date
            "#,
        )
        .bind(ticker_id)
        .bind(&record.url)
        .bind(&record.title)
        .bind(encode_timestamp(record.date_published))
        .bind(&record.source)
        .bind(&record.author)
        .bind(&record.text)
        .bind(&record.summary)
        .bind(record.sentiment)
        .bind(encode_timestamp(record.fetch_date))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let outcome = if existed {
            UpsertOutcome::Replaced
        } else {
            UpsertOutcome::Inserted
        };
        debug!(url = %record.url, ticker = %record.ticker_symbol, ?outcome, "upserted article");
        Ok(outcome)
    }

    pub async fn upsert_ticker(
        &self,
        symbol: &str,
        name: Option<&str>,
        exchange: Option<&str>,
    ) -> Result<i64, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO tickers (symbol, name, exchange, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (symbol) DO UPDATE SET
                name = COALESCE(excluded.name, tickers.name),
                exchange = COALESCE(excluded.exchange, tickers.exchange),
                last_updated = excluded.last_updated
            RETURNING id
            "#,
        )
        .bind(symbol)
        .bind(name)
        .bind(exchange)
        .bind(encode_timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    pub async fn find_ticker(&self, symbol: &str) -> Result<Option<Ticker>, StorageError> {
        let row = sqlx::query("SELECT id, symbol, name, exchange, last_updated FROM tickers WHERE symbol = ?")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Ticker, StorageError> {
            Ok(Ticker {
                id: row.try_get("id")?,
                symbol: row.try_get("symbol")?,
                name: row.try_get("name")?,
                exchange: row.try_get("exchange")?,
                last_updated: decode_timestamp("last_updated", row.try_get("last_updated")?)?,
            })
        })
        .transpose()
    }

    pub async fn exists_by_url(&self, url: &str) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 FROM articles WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StorageError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a JOIN tickers t ON t.id = a.ticker_id WHERE a.url = ?"
        );
        let row = sqlx::query(&sql).bind(url).fetch_optional(&self.pool).await?;
        row.as_ref().map(article_from_row).transpose()
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Article>, StorageError> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a JOIN tickers t ON t.id = a.ticker_id WHERE a.id = ?"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(article_from_row).transpose()
    }

    /// Articles for `symbol`, newest first. An unknown symbol yields an empty list.
    pub async fn find_by_ticker(&self, symbol: &str, limit: Option<u32>) -> Result<Vec<Article>, StorageError> {
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
              FROM articles a
              JOIN tickers t ON t.id = a.ticker_id
             WHERE t.symbol = ?
             ORDER BY a.date_published DESC, a.id DESC
             LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(symbol)
            .bind(limit.map(i64::from).unwrap_or(-1))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<Article>, StorageError> {
        let pattern = format!("%{query}%");
        let sql = format!(
            r#"
            SELECT {ARTICLE_COLUMNS}
              FROM articles a
              JOIN tickers t ON t.id = a.ticker_id
             WHERE a.title LIKE ? OR a.text LIKE ?
             ORDER BY a.date_published DESC, a.id DESC
             LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&pattern)
            .bind(&pattern)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(article_from_row).collect()
    }

    pub async fn ticker_stats(&self, symbol: &str) -> Result<Option<TickerStats>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(a.id) AS article_count,
                   MIN(a.date_published) AS oldest,
                   MAX(a.date_published) AS newest,
                   AVG(a.sentiment) AS avg_sentiment
              FROM articles a
              JOIN tickers t ON t.id = a.ticker_id
             WHERE t.symbol = ?
            "#,
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get("article_count")?;
        if count == 0 {
            return Ok(None);
        }
        let oldest: Option<String> = row.try_get("oldest")?;
        let newest: Option<String> = row.try_get("newest")?;
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return Ok(None);
        };

        Ok(Some(TickerStats {
            symbol: symbol.to_string(),
            count: count as u64,
            oldest_date: decode_timestamp("date_published", oldest)?,
            newest_date: decode_timestamp("date_published", newest)?,
            avg_sentiment: row.try_get("avg_sentiment")?,
        }))
    }
}

fn single_connection_pool() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
}

async fn touch_ticker(
    conn: &mut SqliteConnection,
    symbol: &str,
    seen_at: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let row = sqlx::query(
        r#"
        INSERT INTO tickers (symbol, last_updated) VALUES (?, ?)
        ON CONFLICT (symbol) DO UPDATE SET last_updated = excluded.last_updated
        RETURNING id
        "#,
    )
    .bind(symbol)
    .bind(encode_timestamp(seen_at))
    .fetch_one(conn)
    .await?;
    Ok(row.try_get("id")?)
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(column: &'static str, value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| StorageError::CorruptTimestamp { column, value })
}

fn article_from_row(row: &SqliteRow) -> Result<Article, StorageError> {
    Ok(Article {
        id: row.try_get("id")?,
        ticker_id: row.try_get("ticker_id")?,
        ticker_symbol: row.try_get("ticker_symbol")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        date_published: decode_timestamp("date_published", row.try_get("date_published")?)?,
        source: row.try_get("source")?,
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        summary: row.try_get("summary")?,
        sentiment: row.try_get("sentiment")?,
        fetch_date: decode_timestamp("fetch_date", row.try_get("fetch_date")?)?,
    })
}
