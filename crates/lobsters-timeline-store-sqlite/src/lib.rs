#![allow(clippy::missing_errors_doc)]

//! SQLite-backed results database. Summary rows are imported once from CSV
//! and loaded per dataset by every figure.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lobsters_timeline_core::{Metric, SummaryRow};
use rusqlite::{params, Connection};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

mod csv_import;

pub use csv_import::{read_summary_csv, read_summary_rows};

const SUMMARY_MIGRATION_VERSION: i64 = 1;
const IMPORT_CONTRACT_VERSION: &str = "summary_import.v1";

const SCHEMA_SUMMARY_V1: &str = r"
CREATE TABLE IF NOT EXISTS summary_rows (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  dataset TEXT NOT NULL,
  good INTEGER NOT NULL DEFAULT 1 CHECK (good IN (0, 1)),
  op TEXT NOT NULL,
  scale INTEGER NOT NULL CHECK (scale >= 0),
  memlimit REAL NOT NULL,
  partial INTEGER NOT NULL CHECK (partial IN (0, 1)),
  until REAL NOT NULL CHECK (until >= 0),
  metric TEXT NOT NULL CHECK (metric IN ('sojourn', 'processing')),
  durable INTEGER NOT NULL CHECK (durable IN (0, 1)),
  p25 REAL NOT NULL,
  median REAL NOT NULL,
  p90 REAL NOT NULL,
  p95 REAL NOT NULL,
  p99 REAL NOT NULL,
  max REAL NOT NULL,
  mean REAL NOT NULL,
  imported_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_summary_rows_dataset_seq
  ON summary_rows(dataset, good, row_seq);
";

/// A summary row together with the loader's validation flag.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StoredRow {
    pub good: bool,
    pub row: SummaryRow,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ImportReport {
    pub contract_version: String,
    pub dataset: String,
    pub imported_rows: usize,
    pub good_rows: usize,
    pub replaced_rows: usize,
    pub imported_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DatasetSummary {
    pub dataset: String,
    pub rows: usize,
    pub good_rows: usize,
    pub last_imported_at: String,
}

pub struct SqliteSummaryStore {
    conn: Connection,
}

impl SqliteSummaryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SUMMARY_V1)
            .context("failed to apply summary schema")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SUMMARY_MIGRATION_VERSION, now_rfc3339()?],
            )
            .context("failed to register summary schema migration")?;

        Ok(())
    }

    /// Appends `rows` to `dataset` in one transaction, first dropping the
    /// dataset's existing rows when `replace` is set.
    pub fn import_rows(
        &mut self,
        dataset: &str,
        rows: &[StoredRow],
        replace: bool,
    ) -> Result<ImportReport> {
        if dataset.trim().is_empty() {
            return Err(anyhow!("dataset name MUST be provided"));
        }
        for (position, stored) in rows.iter().enumerate() {
            stored
                .row
                .validate()
                .map_err(|err| anyhow!("row {position} of dataset {dataset}: {err}"))?;
        }

        let imported_at = now_rfc3339()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;

        let replaced_rows = if replace {
            tx.execute("DELETE FROM summary_rows WHERE dataset = ?1", params![dataset])
                .with_context(|| format!("failed to clear dataset {dataset}"))?
        } else {
            0
        };

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO summary_rows(
                        dataset, good, op, scale, memlimit, partial, until, metric, durable,
                        p25, median, p90, p95, p99, max, mean, imported_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                )
                .context("failed to prepare summary row insert")?;

            for stored in rows {
                let row = &stored.row;
                stmt.execute(params![
                    dataset,
                    stored.good,
                    row.op,
                    i64::from(row.scale),
                    row.memlimit,
                    row.partial,
                    row.until,
                    row.metric.as_str(),
                    row.durable,
                    row.p25,
                    row.median,
                    row.p90,
                    row.p95,
                    row.p99,
                    row.max,
                    row.mean,
                    imported_at,
                ])
                .with_context(|| format!("failed to insert summary row into {dataset}"))?;
            }
        }

        tx.commit().context("failed to commit import transaction")?;

        let report = ImportReport {
            contract_version: IMPORT_CONTRACT_VERSION.to_string(),
            dataset: dataset.to_string(),
            imported_rows: rows.len(),
            good_rows: rows.iter().filter(|stored| stored.good).count(),
            replaced_rows,
            imported_at,
        };
        tracing::info!(
            dataset,
            imported = report.imported_rows,
            good = report.good_rows,
            replaced = report.replaced_rows,
            "imported summary rows"
        );
        Ok(report)
    }

    pub fn import_csv(&mut self, dataset: &str, path: &Path, replace: bool) -> Result<ImportReport> {
        let rows = read_summary_csv(path)?;
        tracing::debug!(path = %path.display(), rows = rows.len(), "parsed summary CSV");
        self.import_rows(dataset, &rows, replace)
    }

    /// Loads every row of `dataset` in import order; with `only_good`, rows
    /// not flagged as validated runs are skipped.
    ///
    /// A dataset that was never imported is an error. A dataset whose rows are
    /// all filtered out by `only_good` yields an empty list.
    pub fn load(&self, dataset: &str, only_good: bool) -> Result<Vec<SummaryRow>> {
        let known: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM summary_rows WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up dataset {dataset}"))?;
        if known == 0 {
            return Err(anyhow!(
                "dataset {dataset} has no imported rows; run `timeline import` first"
            ));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT op, scale, memlimit, partial, until, metric, durable,
                        p25, median, p90, p95, p99, max, mean
                 FROM summary_rows
                 WHERE dataset = ?1 AND (?2 = 0 OR good = 1)
                 ORDER BY row_seq ASC",
            )
            .context("failed to prepare summary row query")?;

        let rows = stmt
            .query_map(params![dataset, only_good], map_summary_row)
            .with_context(|| format!("failed to query dataset {dataset}"))?;
        let rows = collect_rows(rows)?;

        tracing::debug!(dataset, only_good, rows = rows.len(), "loaded dataset");
        Ok(rows)
    }

    pub fn datasets(&self) -> Result<Vec<DatasetSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT dataset, COUNT(*), SUM(good), MAX(imported_at)
                 FROM summary_rows
                 GROUP BY dataset
                 ORDER BY dataset ASC",
            )
            .context("failed to prepare dataset listing")?;

        let rows = stmt
            .query_map([], |row| {
                let count: i64 = row.get(1)?;
                let good: i64 = row.get(2)?;
                Ok(DatasetSummary {
                    dataset: row.get(0)?,
                    rows: usize::try_from(count).map_err(to_sql_error)?,
                    good_rows: usize::try_from(good).map_err(to_sql_error)?,
                    last_imported_at: row.get(3)?,
                })
            })
            .context("failed to list datasets")?;
        collect_rows(rows)
    }
}

fn map_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    let scale: i64 = row.get(1)?;
    let metric_raw: String = row.get(5)?;
    let metric = Metric::parse(&metric_raw)
        .ok_or_else(|| to_sql_error(format!("unknown metric {metric_raw:?}")))?;

    Ok(SummaryRow {
        op: row.get(0)?,
        scale: u32::try_from(scale).map_err(to_sql_error)?,
        memlimit: row.get(2)?,
        partial: row.get(3)?,
        until: row.get(4)?,
        metric,
        durable: row.get(6)?,
        p25: row.get(7)?,
        median: row.get(8)?,
        p90: row.get(9)?,
        p95: row.get(10)?,
        p99: row.get(11)?,
        max: row.get(12)?,
        mean: row.get(13)?,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format import timestamp")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteSummaryStore {
        let store = must(SqliteSummaryStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_row(until: f64, median: f64) -> SummaryRow {
        SummaryRow {
            op: "all".to_string(),
            scale: 2000,
            memlimit: 0.125,
            partial: true,
            until,
            metric: Metric::Sojourn,
            durable: false,
            p25: median / 2.0,
            median,
            p90: median * 2.0,
            p95: median * 3.0,
            p99: median * 4.0,
            max: median * 10.0,
            mean: median * 1.5,
        }
    }

    fn stored(good: bool, until: f64) -> StoredRow {
        StoredRow {
            good,
            row: fixture_row(until, until * 2.0),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn load_returns_rows_in_import_order() {
        let mut store = fixture_store();
        let rows = vec![stored(true, 4.0), stored(true, 1.0), stored(false, 2.0)];
        let report = must(store.import_rows("lobsters", &rows, false));
        assert_eq!(report.imported_rows, 3);
        assert_eq!(report.good_rows, 2);
        assert_eq!(report.replaced_rows, 0);
        assert_eq!(report.contract_version, "summary_import.v1");

        let loaded = must(store.load("lobsters", false));
        let untils: Vec<f64> = loaded.iter().map(|row| row.until).collect();
        assert_eq!(untils, vec![4.0, 1.0, 2.0]);
        assert_eq!(loaded[0], rows[0].row);
    }

    #[test]
    fn only_good_skips_unvalidated_runs() {
        let mut store = fixture_store();
        must(store.import_rows(
            "lobsters",
            &[stored(true, 1.0), stored(false, 2.0), stored(true, 3.0)],
            false,
        ));

        let loaded = must(store.load("lobsters", true));
        let untils: Vec<f64> = loaded.iter().map(|row| row.until).collect();
        assert_eq!(untils, vec![1.0, 3.0]);
    }

    #[test]
    fn only_good_with_no_good_rows_is_empty_not_error() {
        let mut store = fixture_store();
        must(store.import_rows("lobsters", &[stored(false, 1.0)], false));
        assert!(must(store.load("lobsters", true)).is_empty());
    }

    #[test]
    fn unknown_dataset_is_an_error() {
        let store = fixture_store();
        let err = match store.load("memcached", false) {
            Err(err) => err,
            Ok(_) => panic!("unknown dataset must fail"),
        };
        assert!(err.to_string().contains("memcached"));
    }

    #[test]
    fn replace_drops_previous_rows_of_the_same_dataset_only() {
        let mut store = fixture_store();
        must(store.import_rows("lobsters", &[stored(true, 1.0), stored(true, 2.0)], false));
        must(store.import_rows("other", &[stored(true, 9.0)], false));

        let report = must(store.import_rows("lobsters", &[stored(true, 5.0)], true));
        assert_eq!(report.replaced_rows, 2);

        let untils: Vec<f64> = must(store.load("lobsters", false))
            .iter()
            .map(|row| row.until)
            .collect();
        assert_eq!(untils, vec![5.0]);
        assert_eq!(must(store.load("other", false)).len(), 1);
    }

    #[test]
    fn import_rejects_invalid_rows_atomically() {
        let mut store = fixture_store();
        let mut bad = stored(true, 2.0);
        bad.row.mean = f64::INFINITY;
        assert!(store
            .import_rows("lobsters", &[stored(true, 1.0), bad], false)
            .is_err());
        assert!(store.load("lobsters", false).is_err());
    }

    #[test]
    fn datasets_lists_counts() {
        let mut store = fixture_store();
        must(store.import_rows("lobsters", &[stored(true, 1.0), stored(false, 2.0)], false));
        must(store.import_rows("noria", &[stored(true, 1.0)], false));

        let datasets = must(store.datasets());
        let summary: Vec<(&str, usize, usize)> = datasets
            .iter()
            .map(|item| (item.dataset.as_str(), item.rows, item.good_rows))
            .collect();
        assert_eq!(summary, vec![("lobsters", 2, 1), ("noria", 1, 1)]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_only_good_loads_exactly_the_good_rows(flags in prop::collection::vec(any::<bool>(), 1..40)) {
            let mut store = fixture_store();
            let rows: Vec<StoredRow> = flags
                .iter()
                .enumerate()
                .map(|(index, good)| stored(*good, f64::from(u32::try_from(index).unwrap_or(u32::MAX))))
                .collect();
            must(store.import_rows("lobsters", &rows, false));

            let everything = must(store.load("lobsters", false));
            prop_assert_eq!(everything.len(), rows.len());

            let good: Vec<SummaryRow> = rows
                .iter()
                .filter(|item| item.good)
                .map(|item| item.row.clone())
                .collect();
            prop_assert_eq!(must(store.load("lobsters", true)), good);
        }
    }
}
