#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! The trend historian (C8): persists per-event benchmark summaries to
//! Postgres so regressions can be tracked across runs.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use loadforge_engine::{EventPath, OrderedPercentile, Summary, PERCENTILES};
use sqlx::PgPool;
use thiserror::Error;

/// Errors the historian can encounter.
#[derive(Debug, Error)]
pub enum HistorianError {
    /// The underlying Postgres query failed.
    #[error("historian query failed: {0}")]
    Db(#[from] sqlx::Error),
    /// `max_age` could not be represented as a `chrono::Duration`.
    #[error("max_age out of range")]
    InvalidMaxAge,
}

/// One column of `history_stats`. Kept as an enum rather than a raw column
/// name so callers can't inject arbitrary SQL through `get_statistics_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    /// Mean of per-frame derived latency, across frames the event appeared in.
    AverageLatency,
    /// Mean of per-frame derived throughput, across frames the event appeared in.
    AverageThroughput,
    /// Percentage of this event's occurrences that failed.
    FailPercentage,
    /// 50th percentile latency.
    Percentile50,
    /// 90th percentile latency.
    Percentile90,
    /// 95th percentile latency.
    Percentile95,
    /// 99th percentile latency.
    Percentile99,
    /// 99.9th percentile latency.
    Percentile999,
}

impl Stat {
    fn column_name(self) -> &'static str {
        match self {
            Stat::AverageLatency => "average_latency",
            Stat::AverageThroughput => "average_throughput",
            Stat::FailPercentage => "fail_percentage",
            Stat::Percentile50 => "percentile_50",
            Stat::Percentile90 => "percentile_90",
            Stat::Percentile95 => "percentile_95",
            Stat::Percentile99 => "percentile_99",
            Stat::Percentile999 => "percentile_999",
        }
    }
}

const PERCENTILE_COLUMNS: [Stat; 5] = [
    Stat::Percentile50,
    Stat::Percentile90,
    Stat::Percentile95,
    Stat::Percentile99,
    Stat::Percentile999,
];

fn percentile_value(summary: &Summary, p: f64) -> f64 {
    summary
        .percentiles
        .get(&OrderedPercentile(p))
        .copied()
        .unwrap_or(0.0)
}

/// Persists summary statistics for regression detection.
pub struct Historian {
    pool: PgPool,
}

impl Historian {
    /// Wrap an already-connected pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop and recreate `history`/`history_stats` with their indexes.
    pub async fn setup_table(&self) -> Result<(), HistorianError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DROP TABLE IF EXISTS history_stats").execute(&mut *tx).await?;
        sqlx::query("DROP TABLE IF EXISTS history").execute(&mut *tx).await?;

        sqlx::query(
            "CREATE TABLE history (
                id BIGSERIAL PRIMARY KEY,
                benchmark_id TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX history_timestamp_idx ON history (timestamp)").execute(&mut *tx).await?;

        sqlx::query(
            "CREATE TABLE history_stats (
                id BIGSERIAL PRIMARY KEY,
                benchmark BIGINT NOT NULL,
                event TEXT NOT NULL,
                average_latency DOUBLE PRECISION NOT NULL,
                average_throughput DOUBLE PRECISION NOT NULL,
                fail_percentage DOUBLE PRECISION NOT NULL,
                percentile_50 DOUBLE PRECISION NOT NULL,
                percentile_90 DOUBLE PRECISION NOT NULL,
                percentile_95 DOUBLE PRECISION NOT NULL,
                percentile_99 DOUBLE PRECISION NOT NULL,
                percentile_999 DOUBLE PRECISION NOT NULL
            )",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX history_stats_benchmark_idx ON history_stats (benchmark)").execute(&mut *tx).await?;

        tx.commit().await?;
        tracing::info!("historian tables recreated");
        Ok(())
    }

    /// Insert one `history` row for this run and one `history_stats` row
    /// per event, in a single transaction.
    pub async fn record(&self, benchmark_id: &str, summary: &BTreeMap<EventPath, Summary>) -> Result<(), HistorianError> {
        let mut tx = self.pool.begin().await?;

        let timestamp: DateTime<Utc> = Utc::now();
        let (history_id,): (i64,) =
            sqlx::query_as("INSERT INTO history (benchmark_id, timestamp) VALUES ($1, $2) RETURNING id")
                .bind(benchmark_id)
                .bind(timestamp)
                .fetch_one(&mut *tx)
                .await?;

        for (path, stat) in summary {
            let event = path.join("/");
            let percentiles: Vec<f64> = PERCENTILES.iter().map(|p| percentile_value(stat, *p)).collect();

            sqlx::query(
                "INSERT INTO history_stats
                 (benchmark, event, average_latency, average_throughput, fail_percentage,
                  percentile_50, percentile_90, percentile_95, percentile_99, percentile_999)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(history_id)
            .bind(event)
            .bind(stat.average_latency)
            .bind(stat.average_throughput)
            .bind(stat.fail_percentage)
            .bind(percentiles[0])
            .bind(percentiles[1])
            .bind(percentiles[2])
            .bind(percentiles[3])
            .bind(percentiles[4])
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Return one stat column's values for `(benchmark_id, event)`, ordered
    /// by run timestamp ascending, optionally filtered to runs within
    /// `max_age` of now.
    pub async fn get_statistics_list(
        &self,
        benchmark_id: &str,
        event: &str,
        stat: Stat,
        max_age: Option<StdDuration>,
    ) -> Result<Vec<f64>, HistorianError> {
        let column = stat.column_name();
        let mut query = format!(
            "SELECT hs.{column} FROM history h \
             JOIN history_stats hs ON h.id = hs.benchmark \
             WHERE h.benchmark_id = $1 AND hs.event = $2"
        );

        let rows: Vec<(f64,)> = if let Some(max_age) = max_age {
            let cutoff = cutoff_timestamp(max_age)?;
            query.push_str(" AND h.timestamp >= $3 ORDER BY h.timestamp ASC");
            sqlx::query_as(&query)
                .bind(benchmark_id)
                .bind(event)
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?
        } else {
            query.push_str(" ORDER BY h.timestamp ASC");
            sqlx::query_as(&query).bind(benchmark_id).bind(event).fetch_all(&self.pool).await?
        };

        Ok(rows.into_iter().map(|(value,)| value).collect())
    }

    /// Delete every `history` row for `benchmark_id` older than `max_age`,
    /// and its dependent `history_stats` rows, in one transaction.
    ///
    /// Deletes directly against the age predicate rather than collecting
    /// matching ids first and deleting per id.
    pub async fn clean(&self, benchmark_id: &str, max_age: StdDuration) -> Result<(), HistorianError> {
        let cutoff = cutoff_timestamp(max_age)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM history_stats WHERE benchmark IN (
                 SELECT id FROM history WHERE benchmark_id = $1 AND timestamp <= $2
             )",
        )
        .bind(benchmark_id)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM history WHERE benchmark_id = $1 AND timestamp <= $2")
            .bind(benchmark_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(%benchmark_id, "pruned history entries older than max_age");
        Ok(())
    }
}

fn cutoff_timestamp(max_age: StdDuration) -> Result<DateTime<Utc>, HistorianError> {
    let age = chrono::Duration::from_std(max_age).map_err(|_| HistorianError::InvalidMaxAge)?;
    Ok(Utc::now() - age)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_columns_are_unique() {
        let mut names: Vec<&str> = PERCENTILE_COLUMNS.iter().map(|s| s.column_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), PERCENTILE_COLUMNS.len());
    }

    #[test]
    fn percentile_lookup_matches_summary_keys() {
        let mut percentiles = BTreeMap::new();
        for p in PERCENTILES {
            percentiles.insert(OrderedPercentile(p), p * 1000.0);
        }
        let summary = Summary {
            average_latency: 1.0,
            average_throughput: 2.0,
            fail_percentage: 0.0,
            percentiles,
        };
        assert_eq!(percentile_value(&summary, 0.99), 0.99 * 1000.0);
    }

    fn sample_summary(average_latency: f64) -> Summary {
        let mut percentiles = BTreeMap::new();
        for p in PERCENTILES {
            percentiles.insert(OrderedPercentile(p), average_latency);
        }
        Summary { average_latency, average_throughput: 10.0, fail_percentage: 0.0, percentiles }
    }

    // Exercises the real record()/get_statistics_list() round trip against a
    // live Postgres instance. No embedded Postgres ships with this pack, so
    // this is `#[ignore]`d rather than backed by a hand-rolled fake pool;
    // run with `DATABASE_URL=postgres://... cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn record_then_get_statistics_list_round_trips_in_order() {
        let url = std::env::var("DATABASE_URL").expect("set DATABASE_URL to a scratch Postgres database");
        let pool = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
        let historian = Historian::new(pool);

        historian.setup_table().await.expect("setup_table");

        let mut first = BTreeMap::new();
        first.insert(EventPath::new(vec!["e".to_string()]), sample_summary(1.0));
        historian.record("bmk", &first).await.expect("record first");

        let mut second = BTreeMap::new();
        second.insert(EventPath::new(vec!["e".to_string()]), sample_summary(2.0));
        historian.record("bmk", &second).await.expect("record second");

        let values = historian
            .get_statistics_list("bmk", "e", Stat::AverageLatency, None)
            .await
            .expect("get_statistics_list");

        assert_eq!(values, vec![1.0, 2.0]);
    }
}
