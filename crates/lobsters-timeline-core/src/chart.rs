use serde::{Deserialize, Serialize};

use crate::config::RenderConfig;
use crate::{SummaryRow, SummaryTable, TimelineError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    P25,
    Median,
    P90,
    P95,
    P99,
    Max,
    Mean,
}

impl Column {
    #[must_use]
    pub fn value(self, row: &SummaryRow) -> f64 {
        match self {
            Self::P25 => row.p25,
            Self::Median => row.median,
            Self::P90 => row.p90,
            Self::P95 => row.p95,
            Self::P99 => row.p99,
            Self::Max => row.max,
            Self::Mean => row.mean,
        }
    }
}

/// Stable tag attached to every drawn series; the legend is ordered by these
/// tags rather than by drawing order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    P25Median,
    MedianP90,
    P90P95,
    P95P99,
    P99Max,
    Mean,
}

impl SeriesKind {
    pub const ALL: [Self; 6] = [
        Self::P25Median,
        Self::MedianP90,
        Self::P90P95,
        Self::P95P99,
        Self::P99Max,
        Self::Mean,
    ];

    pub const BANDS: [Self; 5] = [
        Self::P25Median,
        Self::MedianP90,
        Self::P90P95,
        Self::P95P99,
        Self::P99Max,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::P25Median => "p25_median",
            Self::MedianP90 => "median_p90",
            Self::P90P95 => "p90_p95",
            Self::P95P99 => "p95_p99",
            Self::P99Max => "p99_max",
            Self::Mean => "mean",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::P25Median => "25%-50%",
            Self::MedianP90 => "50%-90%",
            Self::P90P95 => "90%-95%",
            Self::P95P99 => "95%-99%",
            Self::P99Max => "99%-Max",
            Self::Mean => "Mean",
        }
    }

    /// Lower and upper column of a band; `None` for the mean trace.
    #[must_use]
    pub fn bounds(self) -> Option<(Column, Column)> {
        match self {
            Self::P25Median => Some((Column::P25, Column::Median)),
            Self::MedianP90 => Some((Column::Median, Column::P90)),
            Self::P90P95 => Some((Column::P90, Column::P95)),
            Self::P95P99 => Some((Column::P95, Column::P99)),
            Self::P99Max => Some((Column::P99, Column::Max)),
            Self::Mean => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLACK: Self = Self(0, 0, 0);

    /// Parses `#rrggbb`.
    ///
    /// # Errors
    /// Returns [`TimelineError::Configuration`] for anything else.
    pub fn parse_hex(raw: &str) -> Result<Self, TimelineError> {
        let invalid = || TimelineError::Configuration(format!("invalid color {raw:?}, expected #rrggbb"));
        let digits = raw.strip_prefix('#').ok_or_else(invalid)?;
        if digits.len() != 6 || !digits.is_ascii() {
            return Err(invalid());
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16).map_err(|_| invalid())
        };
        Ok(Self(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

const ORANGE_RED: [&[&str]; 5] = [
    &["#fee8c8", "#fdbb84", "#e34a33"],
    &["#fef0d9", "#fdcc8a", "#fc8d59", "#d7301f"],
    &["#fef0d9", "#fdcc8a", "#fc8d59", "#e34a33", "#b30000"],
    &["#fef0d9", "#fdd49e", "#fdbb84", "#fc8d59", "#e34a33", "#b30000"],
    &[
        "#fef0d9", "#fdd49e", "#fdbb84", "#fc8d59", "#ef6548", "#d7301f", "#990000",
    ],
];

/// Sequential palette for `levels` memory-limit levels, lightest first, or
/// darkest first when `reversed`.
///
/// # Errors
/// Returns [`TimelineError::Configuration`] when `levels` is outside `3..=7`.
pub fn memlimit_colors(levels: usize, reversed: bool) -> Result<Vec<&'static str>, TimelineError> {
    let colors = levels
        .checked_sub(3)
        .and_then(|offset| ORANGE_RED.get(offset))
        .ok_or_else(|| {
            TimelineError::Configuration(format!(
                "no palette for {levels} memory-limit levels (supported: 3..=7)"
            ))
        })?;

    let mut colors = colors.to_vec();
    if reversed {
        colors.reverse();
    }
    Ok(colors)
}

/// Step interpolation where each value holds over the interval that ends at
/// its x coordinate: between `x[i-1]` and `x[i]` the path sits at `y[i]`.
#[must_use]
pub fn step_pre(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut path = Vec::with_capacity(points.len() * 2);
    if let Some(first) = points.first() {
        path.push(*first);
    }
    for pair in points.windows(2) {
        let (previous_x, _) = pair[0];
        let (x, y) = pair[1];
        path.push((previous_x, y));
        path.push((x, y));
    }
    path
}

/// Formats a tick value as a plain number, never in scientific notation.
#[must_use]
pub fn plain_tick_label(value: f64) -> String {
    format!("{value}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesGeometry {
    Band {
        polygon: Vec<(f64, f64)>,
    },
    Line {
        path: Vec<(f64, f64)>,
        markers: Vec<(f64, f64)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub kind: SeriesKind,
    pub color: Rgb,
    pub geometry: SeriesGeometry,
}

impl ChartSeries {
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.kind.label()
    }
}

/// Builds the five percentile bands and the mean trace for `table`, clipped
/// to the configured axis ranges.
///
/// # Errors
/// Returns [`TimelineError::Configuration`] when the palette has too few
/// entries or an entry is not a hex color.
pub fn build_series(
    table: &SummaryTable,
    render: &RenderConfig,
) -> Result<Vec<ChartSeries>, TimelineError> {
    let clip = |(x, y): (f64, f64)| {
        (
            x.clamp(render.x_range.0, render.x_range.1),
            y.clamp(render.y_range.0, render.y_range.1),
        )
    };
    let column_points = |column: Column| -> Vec<(f64, f64)> {
        table
            .rows()
            .iter()
            .map(|row| (row.until, column.value(row)))
            .collect()
    };

    let mut series = Vec::with_capacity(SeriesKind::ALL.len());
    for (position, kind) in SeriesKind::BANDS.into_iter().enumerate() {
        let Some((lower, upper)) = kind.bounds() else {
            continue;
        };
        let color = render.palette.get(position).ok_or_else(|| {
            TimelineError::Configuration(format!("palette has no color for {}", kind.as_str()))
        })?;

        let mut polygon = step_pre(&column_points(upper));
        let mut lower_path = step_pre(&column_points(lower));
        lower_path.reverse();
        polygon.extend(lower_path);

        series.push(ChartSeries {
            kind,
            color: Rgb::parse_hex(color)?,
            geometry: SeriesGeometry::Band {
                polygon: polygon.into_iter().map(clip).collect(),
            },
        });
    }

    let mean = column_points(Column::Mean);
    let in_view = |&(x, y): &(f64, f64)| {
        (render.x_range.0..=render.x_range.1).contains(&x)
            && (render.y_range.0..=render.y_range.1).contains(&y)
    };
    series.push(ChartSeries {
        kind: SeriesKind::Mean,
        color: Rgb::BLACK,
        geometry: SeriesGeometry::Line {
            path: step_pre(&mean).into_iter().map(clip).collect(),
            markers: mean.into_iter().filter(in_view).collect(),
        },
    });

    Ok(series)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct LegendSlot {
    pub row: usize,
    pub column: usize,
    pub kind: SeriesKind,
}

/// Orders the drawn series by their rank in `order` and fills a grid of
/// `columns` columns row by row.
///
/// # Errors
/// Returns [`TimelineError::Configuration`] when `columns` is zero or a
/// drawn series has no rank in `order`.
pub fn legend_layout(
    drawn: &[SeriesKind],
    order: &[SeriesKind],
    columns: usize,
) -> Result<Vec<LegendSlot>, TimelineError> {
    if columns == 0 {
        return Err(TimelineError::Configuration(
            "legend_columns MUST be >= 1".to_string(),
        ));
    }

    let mut ranked = Vec::with_capacity(drawn.len());
    for kind in drawn {
        let rank = order.iter().position(|candidate| candidate == kind).ok_or_else(|| {
            TimelineError::Configuration(format!(
                "legend_order has no entry for {}",
                kind.as_str()
            ))
        })?;
        ranked.push((rank, *kind));
    }
    ranked.sort_unstable();

    Ok(ranked
        .into_iter()
        .enumerate()
        .map(|(slot, (_, kind))| LegendSlot {
            row: slot / columns,
            column: slot % columns,
            kind,
        })
        .collect())
}
