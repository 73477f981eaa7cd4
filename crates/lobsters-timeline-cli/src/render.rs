use std::ops::Range;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use lobsters_timeline_core::{
    build_series, legend_layout, plain_tick_label, ChartSeries, RenderConfig, Rgb,
    SeriesGeometry, SeriesKind, SummaryTable,
};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use svg2pdf::usvg::{self, fontdb};
use svg2pdf::{ConversionOptions, PageOptions};

const FONT_FAMILY: &str = "sans-serif";

// Pixel sizes at the canvas resolution.
const MARGIN: u32 = 12;
const X_LABEL_AREA: u32 = 42;
const Y_LABEL_AREA: u32 = 64;
const LABEL_FONT_SIZE: f64 = 14.0;
const LEGEND_FONT_SIZE: f64 = 12.0;
const MEAN_STROKE: u32 = 2;
const MARKER_SIZE: i32 = 4;
const LEGEND_CELL_WIDTH: i32 = 110;
const LEGEND_CELL_HEIGHT: i32 = 20;
const LEGEND_PADDING: i32 = 6;
const LEGEND_SWATCH_WIDTH: i32 = 24;
const LEGEND_SWATCH_HEIGHT: i32 = 10;

/// Paints `table` with the configured axes and legend and writes it to `path`
/// as a single-page PDF sized to the configured figure.
///
/// # Errors
/// Returns an error when the series cannot be built from `render`, drawing
/// or PDF conversion fails, or the file cannot be written.
pub fn render_chart(table: &SummaryTable, render: &RenderConfig, path: &Path) -> Result<()> {
    let svg = render_svg(table, render)?;
    let pdf = svg_to_pdf(&svg, render)?;
    std::fs::write(path, &pdf).with_context(|| format!("failed to write {}", path.display()))?;

    tracing::info!(path = %path.display(), bytes = pdf.len(), "wrote timeline chart");
    Ok(())
}

/// Draws the chart into an SVG document held in memory.
///
/// # Errors
/// Returns an error when the series cannot be built or the backend fails.
pub fn render_svg(table: &SummaryTable, render: &RenderConfig) -> Result<String> {
    let series = build_series(table, render)?;
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, render.svg_size()).into_drawing_area();
        draw_chart(&root, &series, render)?;
        root.present().map_err(render_error)?;
    }
    tracing::debug!(series = series.len(), bytes = svg.len(), "drew timeline svg");
    Ok(svg)
}

/// Converts a drawn SVG into PDF bytes. One canvas pixel maps to
/// `1 / svg_pixels_per_inch` inch on the page.
///
/// # Errors
/// Returns an error when the SVG cannot be parsed or converted.
pub fn svg_to_pdf(svg: &str, render: &RenderConfig) -> Result<Vec<u8>> {
    let mut options = usvg::Options::default();
    load_fonts(options.fontdb_mut());
    let tree = usvg::Tree::from_str(svg, &options)
        .map_err(|err| anyhow!("failed to parse drawn svg: {err}"))?;

    #[allow(clippy::cast_possible_truncation)]
    let dpi = render.svg_pixels_per_inch as f32;
    let page = PageOptions {
        dpi,
        ..PageOptions::default()
    };
    svg2pdf::to_pdf(&tree, ConversionOptions::default(), page)
        .map_err(|err| anyhow!("pdf conversion failed: {err:?}"))
}

// Labels are drawn as sans-serif; hosts without the default sans face fall
// back to the first installed family.
fn load_fonts(fontdb: &mut fontdb::Database) {
    fontdb.load_system_fonts();
    let sans = fontdb::Query {
        families: &[fontdb::Family::SansSerif],
        ..fontdb::Query::default()
    };
    if fontdb.query(&sans).is_some() {
        return;
    }

    let fallback = fontdb
        .faces()
        .find_map(|face| face.families.first().map(|(name, _)| name.clone()));
    match fallback {
        Some(name) => {
            tracing::debug!(family = %name, "sans-serif fallback font");
            fontdb.set_sans_serif_family(name);
        }
        None => tracing::warn!("no system fonts found; chart text will be missing from the pdf"),
    }
}

fn draw_chart<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    series: &[ChartSeries],
    render: &RenderConfig,
) -> Result<()> {
    root.fill(&WHITE).map_err(render_error)?;

    let x_axis = (render.x_range.0..render.x_range.1)
        .log_scale()
        .with_key_points(render.x_ticks.clone());
    let y_axis = (render.y_range.0..render.y_range.1)
        .log_scale()
        .with_key_points(render.y_ticks.iter().map(|tick| tick.value).collect());

    let mut chart = ChartBuilder::on(root)
        .margin(MARGIN)
        .x_label_area_size(X_LABEL_AREA)
        .y_label_area_size(Y_LABEL_AREA)
        .build_cartesian_2d(x_axis, y_axis)
        .map_err(render_error)?;

    let label_font = (FONT_FAMILY, LABEL_FONT_SIZE).into_font();
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc(render.x_label.as_str())
        .y_desc(render.y_label.as_str())
        .x_label_formatter(&|value: &f64| plain_tick_label(*value))
        .y_label_formatter(&|value: &f64| render.y_tick_label(*value))
        .label_style(label_font.clone())
        .axis_desc_style(label_font)
        .draw()
        .map_err(render_error)?;

    for item in series {
        let color = rgb(item.color);
        match &item.geometry {
            SeriesGeometry::Band { polygon } => {
                if polygon.len() < 3 {
                    continue;
                }
                chart
                    .draw_series(std::iter::once(Polygon::new(polygon.clone(), color.filled())))
                    .map_err(render_error)?;
            }
            SeriesGeometry::Line { path, markers } => {
                chart
                    .draw_series(LineSeries::new(
                        path.iter().copied(),
                        color.stroke_width(MEAN_STROKE),
                    ))
                    .map_err(render_error)?;
                chart
                    .draw_series(markers.iter().map(|&point| {
                        EmptyElement::at(point)
                            + Polygon::new(marker_outline(MARKER_SIZE), WHITE.filled())
                            + PathElement::new(marker_outline(MARKER_SIZE), color.stroke_width(1))
                    }))
                    .map_err(render_error)?;
            }
        }
    }

    let plot = chart.plotting_area().get_pixel_range();
    draw_legend(root, series, render, &plot)
}

/// Draws the legend box centred along the top edge of the plotting area.
fn draw_legend<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    series: &[ChartSeries],
    render: &RenderConfig,
    plot: &(Range<i32>, Range<i32>),
) -> Result<()> {
    let drawn: Vec<SeriesKind> = series.iter().map(|item| item.kind).collect();
    let slots = legend_layout(&drawn, &render.legend_order, render.legend_columns)?;
    let Some(rows) = slots.iter().map(|slot| slot.row + 1).max() else {
        return Ok(());
    };
    let columns = slots.iter().map(|slot| slot.column + 1).max().unwrap_or(1);

    let width = LEGEND_CELL_WIDTH * to_i32(columns) + 2 * LEGEND_PADDING;
    let height = LEGEND_CELL_HEIGHT * to_i32(rows) + 2 * LEGEND_PADDING;
    let left = (plot.0.start + plot.0.end - width) / 2;
    let top = plot.1.start + LEGEND_PADDING;

    let frame = [(left, top), (left + width, top + height)];
    root.draw(&Rectangle::new(frame, WHITE.filled()))
        .map_err(render_error)?;
    root.draw(&Rectangle::new(frame, BLACK.mix(0.3).stroke_width(1)))
        .map_err(render_error)?;

    let text_style = TextStyle::from((FONT_FAMILY, LEGEND_FONT_SIZE).into_font())
        .pos(Pos::new(HPos::Left, VPos::Center));
    let swatch_half_height = LEGEND_SWATCH_HEIGHT / 2;

    for slot in &slots {
        let Some(item) = series.iter().find(|item| item.kind == slot.kind) else {
            continue;
        };
        let color = rgb(item.color);
        let x = left + LEGEND_PADDING + LEGEND_CELL_WIDTH * to_i32(slot.column);
        let middle = top
            + LEGEND_PADDING
            + LEGEND_CELL_HEIGHT * to_i32(slot.row)
            + LEGEND_CELL_HEIGHT / 2;

        match item.geometry {
            SeriesGeometry::Band { .. } => {
                root.draw(&Rectangle::new(
                    [
                        (x, middle - swatch_half_height),
                        (x + LEGEND_SWATCH_WIDTH, middle + swatch_half_height),
                    ],
                    color.filled(),
                ))
                .map_err(render_error)?;
            }
            SeriesGeometry::Line { .. } => {
                root.draw(&PathElement::new(
                    vec![(x, middle), (x + LEGEND_SWATCH_WIDTH, middle)],
                    color.stroke_width(MEAN_STROKE),
                ))
                .map_err(render_error)?;
                root.draw(
                    &(EmptyElement::at((x + LEGEND_SWATCH_WIDTH / 2, middle))
                        + Polygon::new(marker_outline(MARKER_SIZE), WHITE.filled())
                        + PathElement::new(marker_outline(MARKER_SIZE), color.stroke_width(1))),
                )
                .map_err(render_error)?;
            }
        }

        root.draw(&Text::new(
            item.label(),
            (x + LEGEND_SWATCH_WIDTH + LEGEND_PADDING, middle),
            text_style.clone(),
        ))
        .map_err(render_error)?;
    }

    Ok(())
}

/// Closed outline of a left-pointing triangle centred on the origin.
fn marker_outline(size: i32) -> Vec<(i32, i32)> {
    vec![(-size, 0), (size, -size), (size, size), (-size, 0)]
}

fn rgb(color: Rgb) -> RGBColor {
    RGBColor(color.0, color.1, color.2)
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn render_error<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow!("chart rendering failed: {err}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use lobsters_timeline_core::{prepare_timeline, Metric, SummaryRow, TimelineConfig};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn sojourn_row(until: f64, scale: f64) -> SummaryRow {
        SummaryRow {
            op: "all".to_string(),
            scale: 2000,
            memlimit: 0.125,
            partial: true,
            until,
            metric: Metric::Sojourn,
            durable: false,
            p25: 2.0 * scale,
            median: 5.0 * scale,
            p90: 10.0 * scale,
            p95: 15.0 * scale,
            p99: 20.0 * scale,
            max: 50.0 * scale,
            mean: 7.0 * scale,
        }
    }

    fn lobsters_table(config: &TimelineConfig) -> SummaryTable {
        let rows = (0..8)
            .map(|step| sojourn_row(f64::from(1u32 << step), f64::from(step + 1)))
            .collect();
        prepare_timeline(rows, config)
    }

    /// Trimmed bodies of every `<text>` element, in document order.
    fn text_bodies(svg: &str) -> Vec<String> {
        svg.split("<text")
            .skip(1)
            .filter_map(|chunk| {
                let body = &chunk[chunk.find('>')? + 1..];
                Some(body[..body.find("</text>")?].trim().to_string())
            })
            .collect()
    }

    #[test]
    fn drawn_svg_has_relabelled_ticks_and_ordered_legend() {
        let config = TimelineConfig::lobsters();
        let svg = must(render_svg(&lobsters_table(&config), &config.render));
        assert!(svg.matches("<polygon").count() >= 5, "expected five bands");

        let texts = text_bodies(&svg);
        for label in ["10ms", "100ms", "1s", "4", "64", "Time after start [s]", "Page latency"] {
            assert!(
                texts.iter().any(|text| text == label),
                "missing text {label} in {texts:?}"
            );
        }

        let legend: Vec<usize> = ["25%-50%", "50%-90%", "90%-95%", "95%-99%", "99%-Max", "Mean"]
            .iter()
            .map(|label| match texts.iter().position(|text| text == label) {
                Some(position) => position,
                None => panic!("legend is missing {label} in {texts:?}"),
            })
            .collect();
        assert!(legend.windows(2).all(|pair| pair[0] < pair[1]), "legend order {legend:?}");
    }

    #[test]
    fn pdf_page_is_produced_for_empty_selection() {
        let mut config = TimelineConfig::lobsters();
        config.filter.scale = 9999;
        let table = lobsters_table(&config);
        assert!(table.is_empty());

        let svg = must(render_svg(&table, &config.render));
        let pdf = must(svg_to_pdf(&svg, &config.render));
        assert!(pdf.starts_with(b"%PDF-"));
    }

    #[test]
    fn text_bodies_trim_backend_line_breaks() {
        let svg = "<svg>\n<text x=\"1\" y=\"2\">\n10ms\n</text>\n<text>\nMean\n</text>\n</svg>";
        assert_eq!(text_bodies(svg), vec!["10ms".to_string(), "Mean".to_string()]);
    }

    #[test]
    fn marker_outline_points_left_and_closes() {
        let outline = marker_outline(4);
        assert_eq!(outline.first(), outline.last());
        assert_eq!(outline[0], (-4, 0));
        assert!(outline[1..3].iter().all(|&(x, _)| x == 4));
    }

    #[test]
    fn palette_colors_map_channel_for_channel() {
        let color = rgb(Rgb(0xb3, 0x00, 0x00));
        assert_eq!((color.0, color.1, color.2), (0xb3, 0x00, 0x00));
    }
}
