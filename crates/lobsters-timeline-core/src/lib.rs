//! Summary-row model and the transform steps that prepare a latency timeline
//! for rendering.
//!
//! The pipeline is deliberately free of any drawing library:
//! - [`filter_table`] narrows a loaded table to one experimental configuration.
//! - [`anchor_at_origin`] injects the zero-time copies of the first bucket.
//! - [`build_series`] and [`legend_layout`] turn the prepared table into
//!   labelled geometry that a renderer only has to paint.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod chart;
mod config;

pub use chart::{
    build_series, legend_layout, memlimit_colors, plain_tick_label, step_pre, ChartSeries, Column,
    LegendSlot, Rgb, SeriesGeometry, SeriesKind,
};
pub use config::{AnchorConfig, FilterConfig, RenderConfig, TickLabel, TimelineConfig};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Sojourn,
    Processing,
}

impl Metric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sojourn => "sojourn",
            Self::Processing => "processing",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sojourn" => Some(Self::Sojourn),
            "processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

impl Display for Metric {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pre-aggregated latency bucket of a benchmark run.
///
/// Latency values are in milliseconds; `until` is the end of the bucket in
/// seconds after the measurement started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryRow {
    pub op: String,
    pub scale: u32,
    pub memlimit: f64,
    pub partial: bool,
    pub until: f64,
    pub metric: Metric,
    pub durable: bool,
    pub p25: f64,
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
    pub mean: f64,
}

impl SummaryRow {
    /// Checks that a row can be stored and plotted at all.
    ///
    /// Percentile ordering is not checked here; see
    /// [`SummaryRow::percentile_order_violation`].
    ///
    /// # Errors
    /// Returns [`TimelineError::Validation`] for an empty `op`, a negative
    /// or non-finite `until`, or a non-finite latency value.
    pub fn validate(&self) -> Result<(), TimelineError> {
        if self.op.trim().is_empty() {
            return Err(TimelineError::Validation(
                "op MUST be provided for every row".to_string(),
            ));
        }

        if !self.until.is_finite() || self.until < 0.0 {
            return Err(TimelineError::Validation(format!(
                "until MUST be a finite value >= 0 (got {})",
                self.until
            )));
        }

        if !self.memlimit.is_finite() {
            return Err(TimelineError::Validation(
                "memlimit MUST be finite".to_string(),
            ));
        }

        for (name, value) in self.latencies() {
            if !value.is_finite() {
                return Err(TimelineError::Validation(format!(
                    "{name} MUST be finite (got {value})"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn latencies(&self) -> [(&'static str, f64); 7] {
        [
            ("p25", self.p25),
            ("median", self.median),
            ("p90", self.p90),
            ("p95", self.p95),
            ("p99", self.p99),
            ("max", self.max),
            ("mean", self.mean),
        ]
    }

    /// Describes the first pair of adjacent percentiles that are out of order,
    /// if any. `mean` is not part of the sequence.
    #[must_use]
    pub fn percentile_order_violation(&self) -> Option<String> {
        let latencies = self.latencies();
        latencies[..6].windows(2).find_map(|pair| {
            let (lower_name, lower) = pair[0];
            let (upper_name, upper) = pair[1];
            (lower > upper).then(|| format!("{lower_name}={lower} > {upper_name}={upper}"))
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TableIndex {
    Row,
    Partial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IndexKey {
    Row(usize),
    Partial(bool),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryTable {
    index: TableIndex,
    rows: Vec<SummaryRow>,
}

impl SummaryTable {
    #[must_use]
    pub fn new(rows: Vec<SummaryRow>) -> Self {
        Self {
            index: TableIndex::Row,
            rows,
        }
    }

    #[must_use]
    pub fn index(&self) -> TableIndex {
        self.index
    }

    #[must_use]
    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<SummaryRow> {
        self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn index_keys(&self) -> Vec<IndexKey> {
        self.rows
            .iter()
            .enumerate()
            .map(|(position, row)| match self.index {
                TableIndex::Row => IndexKey::Row(position),
                TableIndex::Partial => IndexKey::Partial(row.partial),
            })
            .collect()
    }
}

/// Keeps the rows matching every predicate of `filter`, in input order, and
/// re-keys the result by the partial-execution flag.
#[must_use]
pub fn filter_table(table: &SummaryTable, filter: &FilterConfig) -> SummaryTable {
    SummaryTable {
        index: TableIndex::Partial,
        rows: table
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect(),
    }
}

/// Prepends a copy of every row at `anchor.source_until`, relabelled to
/// `anchor.anchored_until`.
///
/// The step rendering draws each bucket to the left of its `until` value, so
/// without the copies nothing is drawn before the first bucket. When no row
/// sits at the source time the table is returned unchanged.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn anchor_at_origin(table: &SummaryTable, anchor: &AnchorConfig) -> SummaryTable {
    let mut rows: Vec<SummaryRow> = table
        .rows
        .iter()
        .filter(|row| row.until == anchor.source_until)
        .map(|row| SummaryRow {
            until: anchor.anchored_until,
            ..row.clone()
        })
        .collect();
    rows.extend(table.rows.iter().cloned());

    SummaryTable {
        index: table.index,
        rows,
    }
}

/// Runs the full transform: filter to the configured experiment, then anchor
/// the first bucket at the origin.
#[must_use]
pub fn prepare_timeline(rows: Vec<SummaryRow>, config: &TimelineConfig) -> SummaryTable {
    let filtered = filter_table(&SummaryTable::new(rows), &config.filter);
    anchor_at_origin(&filtered, &config.anchor)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderViolation {
    pub position: usize,
    pub until: f64,
    pub detail: String,
}

#[must_use]
pub fn percentile_order_violations(rows: &[SummaryRow]) -> Vec<OrderViolation> {
    rows.iter()
        .enumerate()
        .filter_map(|(position, row)| {
            row.percentile_order_violation()
                .map(|detail| OrderViolation {
                    position,
                    until: row.until,
                    detail,
                })
        })
        .collect()
}
