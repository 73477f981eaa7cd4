use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::chart::{memlimit_colors, plain_tick_label, Rgb, SeriesKind};
use crate::{Metric, SummaryRow, TimelineError};

/// Selects the single experiment that ends up on the chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterConfig {
    pub op: String,
    pub scale: u32,
    pub memlimit: f64,
    pub partial: bool,
    pub until_max: f64,
    pub metric: Metric,
    pub durable: bool,
}

impl FilterConfig {
    #[must_use]
    pub fn lobsters() -> Self {
        Self {
            op: "all".to_string(),
            scale: 2000,
            memlimit: 0.125,
            partial: true,
            until_max: 128.0,
            metric: Metric::Sojourn,
            durable: false,
        }
    }

    // memlimit values are written as exact binary fractions.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn matches(&self, row: &SummaryRow) -> bool {
        row.op == self.op
            && row.scale == self.scale
            && row.memlimit == self.memlimit
            && row.partial == self.partial
            && row.until <= self.until_max
            && row.metric == self.metric
            && row.durable == self.durable
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AnchorConfig {
    pub source_until: f64,
    pub anchored_until: f64,
}

impl AnchorConfig {
    #[must_use]
    pub fn lobsters() -> Self {
        Self {
            source_until: 1.0,
            anchored_until: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TickLabel {
    pub value: f64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderConfig {
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub x_ticks: Vec<f64>,
    pub y_ticks: Vec<TickLabel>,
    pub x_label: String,
    pub y_label: String,
    pub legend_order: Vec<SeriesKind>,
    pub legend_columns: usize,
    pub palette: Vec<String>,
    pub figure_inches: (f64, f64),
    pub svg_pixels_per_inch: f64,
}

impl RenderConfig {
    #[must_use]
    pub fn lobsters() -> Self {
        let palette = memlimit_colors(5, true)
            .map(|colors| colors.into_iter().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            x_range: (0.5, 128.0),
            y_range: (1.0, 50_000.0),
            x_ticks: vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            y_ticks: [(1.0, "1ms"), (10.0, "10ms"), (100.0, "100ms"), (1000.0, "1s")]
                .into_iter()
                .map(|(value, label)| TickLabel {
                    value,
                    label: label.to_string(),
                })
                .collect(),
            x_label: "Time after start [s]".to_string(),
            y_label: "Page latency".to_string(),
            legend_order: SeriesKind::ALL.to_vec(),
            legend_columns: 3,
            palette,
            figure_inches: (6.4, 4.8),
            svg_pixels_per_inch: 100.0,
        }
    }

    /// Validates axis ranges, ticks, legend ordering and palette entries.
    ///
    /// # Errors
    /// Returns [`TimelineError::Configuration`] naming the first field that
    /// cannot be rendered.
    pub fn validate(&self) -> Result<(), TimelineError> {
        for (name, (low, high), ticks) in [
            ("x_range", self.x_range, self.x_ticks.clone()),
            (
                "y_range",
                self.y_range,
                self.y_ticks.iter().map(|tick| tick.value).collect(),
            ),
        ] {
            if !(low.is_finite() && high.is_finite() && low > 0.0 && low < high) {
                return Err(TimelineError::Configuration(format!(
                    "{name} MUST be finite, positive and increasing for a log axis"
                )));
            }
            if let Some(tick) = ticks.iter().find(|tick| !(low..=high).contains(*tick)) {
                return Err(TimelineError::Configuration(format!(
                    "{name} tick {tick} lies outside [{low}, {high}]"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for kind in &self.legend_order {
            if !seen.insert(*kind) {
                return Err(TimelineError::Configuration(format!(
                    "legend_order lists {} more than once",
                    kind.as_str()
                )));
            }
        }
        if let Some(missing) = SeriesKind::ALL.iter().find(|kind| !seen.contains(*kind)) {
            return Err(TimelineError::Configuration(format!(
                "legend_order is missing {}",
                missing.as_str()
            )));
        }

        if self.legend_columns == 0 {
            return Err(TimelineError::Configuration(
                "legend_columns MUST be >= 1".to_string(),
            ));
        }

        if self.palette.len() < SeriesKind::BANDS.len() {
            return Err(TimelineError::Configuration(format!(
                "palette MUST list at least {} colors",
                SeriesKind::BANDS.len()
            )));
        }
        for color in &self.palette {
            Rgb::parse_hex(color)?;
        }

        let (width, height) = self.figure_inches;
        if !(width > 0.0 && height > 0.0 && self.svg_pixels_per_inch > 0.0) {
            return Err(TimelineError::Configuration(
                "figure_inches and svg_pixels_per_inch MUST be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Label for a y tick: the configured text when the value is a declared
    /// tick, otherwise the plain number.
    #[must_use]
    pub fn y_tick_label(&self, value: f64) -> String {
        self.y_ticks
            .iter()
            .find(|tick| (tick.value - value).abs() <= 1e-9 * value.abs().max(1.0))
            .map_or_else(|| plain_tick_label(value), |tick| tick.label.clone())
    }

    /// Canvas size in pixels for the SVG backend.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn svg_size(&self) -> (u32, u32) {
        let (width, height) = self.figure_inches;
        (
            (width * self.svg_pixels_per_inch).round() as u32,
            (height * self.svg_pixels_per_inch).round() as u32,
        )
    }
}

/// Every setting of one figure: data selection, anchoring and rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineConfig {
    pub dataset: String,
    pub only_good: bool,
    pub filter: FilterConfig,
    pub anchor: AnchorConfig,
    pub render: RenderConfig,
}

impl TimelineConfig {
    #[must_use]
    pub fn lobsters() -> Self {
        Self {
            dataset: "lobsters".to_string(),
            only_good: false,
            filter: FilterConfig::lobsters(),
            anchor: AnchorConfig::lobsters(),
            render: RenderConfig::lobsters(),
        }
    }

    /// # Errors
    /// Returns [`TimelineError::Configuration`] when the dataset name is
    /// empty, the filter horizon is not finite, or the render section is
    /// invalid.
    pub fn validate(&self) -> Result<(), TimelineError> {
        if self.dataset.trim().is_empty() {
            return Err(TimelineError::Configuration(
                "dataset MUST be provided".to_string(),
            ));
        }
        if !self.filter.until_max.is_finite() {
            return Err(TimelineError::Configuration(
                "filter.until_max MUST be finite".to_string(),
            ));
        }
        self.render.validate()
    }

    /// Decodes and validates a configuration document.
    ///
    /// # Errors
    /// Returns [`TimelineError::Configuration`] when JSON decoding fails or
    /// the decoded values cannot be rendered.
    pub fn from_json_str(raw: &str) -> Result<Self, TimelineError> {
        let config: Self = serde_json::from_str(raw).map_err(|err| {
            TimelineError::Configuration(format!("invalid timeline config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self::lobsters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use jsonschema::JSONSchema;
    use serde_json::Value;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn lobsters_config_is_valid() {
        assert_eq!(TimelineConfig::lobsters().validate(), Ok(()));
        assert_eq!(TimelineConfig::default(), TimelineConfig::lobsters());
    }

    #[test]
    fn config_json_round_trips() {
        let config = TimelineConfig::lobsters();
        let raw = must_ok(serde_json::to_string(&config));
        assert_eq!(must_ok(TimelineConfig::from_json_str(&raw)), config);
    }

    #[test]
    fn config_rejects_non_positive_log_range() {
        let mut config = TimelineConfig::lobsters();
        config.render.x_range = (0.0, 128.0);
        let raw = must_ok(serde_json::to_string(&config));
        let err = match TimelineConfig::from_json_str(&raw) {
            Err(err) => err,
            Ok(_) => panic!("zero lower bound must be rejected"),
        };
        assert!(err.to_string().contains("x_range"));
    }

    #[test]
    fn config_rejects_tick_outside_range() {
        let mut render = RenderConfig::lobsters();
        render.x_ticks.push(256.0);
        assert!(matches!(
            render.validate(),
            Err(TimelineError::Configuration(message)) if message.contains("tick 256")
        ));
    }

    #[test]
    fn config_rejects_duplicate_or_incomplete_legend_order() {
        let mut render = RenderConfig::lobsters();
        render.legend_order = vec![SeriesKind::Mean, SeriesKind::Mean];
        assert!(render.validate().is_err());

        render.legend_order = SeriesKind::BANDS.to_vec();
        let err = match render.validate() {
            Err(err) => err,
            Ok(()) => panic!("missing mean must be rejected"),
        };
        assert!(err.to_string().contains("missing mean"));
    }

    #[test]
    fn config_rejects_short_or_malformed_palette() {
        let mut render = RenderConfig::lobsters();
        render.palette.truncate(4);
        assert!(render.validate().is_err());

        let mut render = RenderConfig::lobsters();
        render.palette[2] = "orange".to_string();
        assert!(render.validate().is_err());
    }

    #[test]
    fn config_rejects_missing_fields() {
        let result = TimelineConfig::from_json_str(r#"{"dataset":"lobsters"}"#);
        assert!(matches!(result, Err(TimelineError::Configuration(_))));
    }

    #[test]
    fn y_ticks_use_configured_labels() {
        let render = RenderConfig::lobsters();
        assert_eq!(render.y_tick_label(1.0), "1ms");
        assert_eq!(render.y_tick_label(100.0), "100ms");
        assert_eq!(render.y_tick_label(1000.0), "1s");
        assert_eq!(render.y_tick_label(5000.0), "5000");
    }

    #[test]
    fn pixel_sizes_follow_figure_inches() {
        let mut render = RenderConfig::lobsters();
        assert_eq!(render.svg_size(), (640, 480));
        render.svg_pixels_per_inch = 150.0;
        assert_eq!(render.svg_size(), (960, 720));
    }

    #[test]
    fn lobsters_config_matches_contract_schema() {
        let schema_path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../contracts/timeline-config.schema.json");
        let body = must_ok(std::fs::read_to_string(&schema_path));
        let schema: Value = must_ok(serde_json::from_str(&body));
        let compiled = must_ok(JSONSchema::compile(&schema));

        let value = must_ok(serde_json::to_value(TimelineConfig::lobsters()));
        if let Some(errors) = compiled
            .validate(&value)
            .err()
            .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        {
            panic!("schema validation failed:\n{}", errors.join("\n"));
        };

        let mut zero_floor = value.clone();
        zero_floor["render"]["y_range"][0] = Value::from(0.0);
        assert!(!compiled.is_valid(&zero_floor));
    }
}
