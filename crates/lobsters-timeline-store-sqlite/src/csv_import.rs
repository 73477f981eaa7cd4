use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lobsters_timeline_core::{Metric, SummaryRow};
use serde::{Deserialize, Deserializer};

use crate::StoredRow;

#[derive(Debug, Deserialize)]
struct CsvSummaryRecord {
    op: String,
    scale: u32,
    memlimit: f64,
    #[serde(deserialize_with = "flag")]
    partial: bool,
    until: f64,
    metric: String,
    #[serde(deserialize_with = "flag")]
    durable: bool,
    p25: f64,
    median: f64,
    p90: f64,
    p95: f64,
    p99: f64,
    max: f64,
    mean: f64,
    #[serde(default = "default_good", deserialize_with = "flag")]
    good: bool,
}

fn default_good() -> bool {
    true
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_flag(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("expected true/false/1/0, got {raw:?}"))
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "True" | "TRUE" | "1" => Some(true),
        "false" | "False" | "FALSE" | "0" => Some(false),
        _ => None,
    }
}

/// Reads summary rows from a CSV file with a header line.
pub fn read_summary_csv(path: &Path) -> Result<Vec<StoredRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open summary CSV {}", path.display()))?;
    read_summary_rows(file).with_context(|| format!("failed to read {}", path.display()))
}

/// Reads summary rows from any CSV source with a header line.
///
/// Columns are matched by name; `good` is optional and defaults to `true`.
pub fn read_summary_rows<R: Read>(reader: R) -> Result<Vec<StoredRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<CsvSummaryRecord>().enumerate() {
        // header is line 1
        let line = index + 2;
        let record = record.with_context(|| format!("malformed summary row at line {line}"))?;
        let metric = Metric::parse(&record.metric)
            .ok_or_else(|| anyhow!("unknown metric {:?} at line {line}", record.metric))?;

        let row = SummaryRow {
            op: record.op,
            scale: record.scale,
            memlimit: record.memlimit,
            partial: record.partial,
            until: record.until,
            metric,
            durable: record.durable,
            p25: record.p25,
            median: record.median,
            p90: record.p90,
            p95: record.p95,
            p99: record.p99,
            max: record.max,
            mean: record.mean,
        };
        row.validate()
            .map_err(|err| anyhow!("invalid summary row at line {line}: {err}"))?;

        rows.push(StoredRow {
            good: record.good,
            row,
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;

    const HEADER: &str = "op,scale,memlimit,partial,until,metric,durable,p25,median,p90,p95,p99,max,mean";

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    #[test]
    fn reads_pandas_style_booleans_and_defaults_good() {
        let body = format!(
            "{HEADER}\nall,2000,0.125,True,1.0,sojourn,False,2,5,10,15,20,50,7\nall,2000,0.125,1,2,sojourn,0,3,8,12,18,25,60,9\n"
        );
        let rows = must(read_summary_rows(body.as_bytes()));

        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|stored| stored.good));
        assert!(rows[0].row.partial);
        assert!(!rows[0].row.durable);
        assert_eq!(rows[0].row.metric, Metric::Sojourn);
        assert_eq!(rows[1].row.until, 2.0);
        assert_eq!(rows[1].row.median, 8.0);
    }

    #[test]
    fn reads_explicit_good_column() {
        let body = format!(
            "{HEADER},good\nall,2000,0.125,true,1,processing,false,2,5,10,15,20,50,7,false\n"
        );
        let rows = must(read_summary_rows(body.as_bytes()));
        assert!(!rows[0].good);
        assert_eq!(rows[0].row.metric, Metric::Processing);
    }

    #[test]
    fn rejects_unknown_metric_with_line_number() {
        let body = format!(
            "{HEADER}\nall,2000,0.125,true,1,sojourn,false,2,5,10,15,20,50,7\nall,2000,0.125,true,2,queueing,false,2,5,10,15,20,50,7\n"
        );
        let err = match read_summary_rows(body.as_bytes()) {
            Err(err) => err,
            Ok(_) => panic!("unknown metric must be rejected"),
        };
        assert!(err.to_string().contains("line 3"), "{err}");
    }

    #[test]
    fn rejects_bad_flags_and_negative_until() {
        let bad_flag =
            format!("{HEADER}\nall,2000,0.125,yes,1,sojourn,false,2,5,10,15,20,50,7\n");
        assert!(read_summary_rows(bad_flag.as_bytes()).is_err());

        let negative = format!("{HEADER}\nall,2000,0.125,true,-1,sojourn,false,2,5,10,15,20,50,7\n");
        let err = match read_summary_rows(negative.as_bytes()) {
            Err(err) => err,
            Ok(_) => panic!("negative until must be rejected"),
        };
        assert!(err.to_string().contains("until"), "{err}");
    }

    #[test]
    fn accepts_unordered_percentiles() {
        let body = format!("{HEADER}\nall,2000,0.125,true,1,sojourn,false,2,5,40,15,20,50,7\n");
        let rows = must(read_summary_rows(body.as_bytes()));
        assert!(rows[0].row.percentile_order_violation().is_some());
    }
}
