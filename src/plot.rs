//! Chart model and rendering.
//!
//! Generated plotting code never draws directly. It records series on a
//! [`PlotSurface`]; the surface keeps a [`Figure`] which is drawn with
//! `plotters` to SVG (for the file the code saves and the vector form sent
//! to the client) and to a bitmap (PNG, for the raster form and for vision
//! analysis).
//!
//! Supported series mirror the chart kinds: line, area, bar, scatter, pie
//! and hexbin. A figure containing a pie is drawn as a pie chart; any other
//! mix shares one cartesian plane.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::register_font;

/// Font used for every caption, label and legend, in both backends.
static SANS_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");
static FONTS_REGISTERED: OnceLock<bool> = OnceLock::new();

/// Register the embedded font under `sans-serif` once per process.
fn ensure_fonts() -> Result<()> {
    let registered = *FONTS_REGISTERED
        .get_or_init(|| register_font("sans-serif", FontStyle::Normal, SANS_FONT).is_ok());
    if !registered {
        bail!("embedded chart font could not be loaded");
    }
    Ok(())
}

const PALETTE: [RGBColor; 10] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
    RGBColor(188, 189, 34),
    RGBColor(23, 190, 207),
];

const HEX_LIGHT: (u8, u8, u8) = (222, 235, 247);
const HEX_DARK: (u8, u8, u8) = (8, 48, 107);

/// X coordinates of a line or area series.
#[derive(Debug, Clone, PartialEq)]
pub enum XValues {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

impl XValues {
    pub fn len(&self) -> usize {
        match self {
            XValues::Numeric(v) => v.len(),
            XValues::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeriesKind {
    Line { x: XValues, y: Vec<f64> },
    Area { x: XValues, y: Vec<f64> },
    Bar { categories: Vec<String>, values: Vec<f64> },
    Scatter { x: Vec<f64>, y: Vec<f64>, size: f64 },
    Pie { labels: Vec<String>, values: Vec<f64> },
    Hexbin { x: Vec<f64>, y: Vec<f64>, gridsize: usize },
}

impl SeriesKind {
    fn name(&self) -> &'static str {
        match self {
            SeriesKind::Line { .. } => "plot",
            SeriesKind::Area { .. } => "area",
            SeriesKind::Bar { .. } => "bar",
            SeriesKind::Scatter { .. } => "scatter",
            SeriesKind::Pie { .. } => "pie",
            SeriesKind::Hexbin { .. } => "hexbin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub kind: SeriesKind,
    pub label: Option<String>,
    pub color: Option<(u8, u8, u8)>,
    /// Hover text per point, drawn as SVG tooltips.
    pub hover: Vec<String>,
}

impl Series {
    pub fn new(kind: SeriesKind) -> Self {
        Self {
            kind,
            label: None,
            color: None,
            hover: Vec::new(),
        }
    }

    /// Reject empty, ragged or non-finite data with a message the code
    /// generator can act on.
    pub fn validate(&self) -> Result<()> {
        let name = self.kind.name();
        let (xs, ys) = match &self.kind {
            SeriesKind::Line { x, y } | SeriesKind::Area { x, y } => (x.len(), y.as_slice()),
            SeriesKind::Bar { categories, values } => (categories.len(), values.as_slice()),
            SeriesKind::Scatter { x, y, .. } | SeriesKind::Hexbin { x, y, .. } => {
                check_finite(name, "x", x)?;
                (x.len(), y.as_slice())
            }
            SeriesKind::Pie { labels, values } => {
                if values.iter().any(|v| *v < 0.0) {
                    bail!("plt.pie: values must not be negative");
                }
                if values.iter().sum::<f64>() <= 0.0 {
                    bail!("plt.pie: values must sum to more than zero");
                }
                (labels.len(), values.as_slice())
            }
        };
        if ys.is_empty() {
            bail!("plt.{}: no data points", name);
        }
        if xs != ys.len() {
            bail!(
                "plt.{}: length mismatch ({} x values, {} y values)",
                name,
                xs,
                ys.len()
            );
        }
        check_finite(name, "y", ys)?;
        if let SeriesKind::Line { x: XValues::Numeric(x), .. }
        | SeriesKind::Area { x: XValues::Numeric(x), .. } = &self.kind
        {
            check_finite(name, "x", x)?;
        }
        Ok(())
    }

    fn data_len(&self) -> usize {
        match &self.kind {
            SeriesKind::Line { y, .. }
            | SeriesKind::Area { y, .. }
            | SeriesKind::Scatter { y, .. }
            | SeriesKind::Hexbin { y, .. } => y.len(),
            SeriesKind::Bar { values, .. } | SeriesKind::Pie { values, .. } => values.len(),
        }
    }
}

fn check_finite(name: &str, axis: &str, values: &[f64]) -> Result<()> {
    if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
        bail!(
            "plt.{}: {} value {} is not a finite number; drop missing values first",
            name,
            axis,
            pos + 1
        );
    }
    Ok(())
}

/// Everything needed to draw one chart.
#[derive(Debug, Clone, PartialEq)]
pub struct Figure {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub width: u32,
    pub height: u32,
    pub series: Vec<Series>,
}

impl Default for Figure {
    fn default() -> Self {
        Self {
            title: String::new(),
            x_label: String::new(),
            y_label: String::new(),
            width: 800,
            height: 520,
            series: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SurfaceState {
    figure: Figure,
    output: Option<PathBuf>,
    saved: Option<PathBuf>,
}

/// Shared handle generated code draws on.
///
/// Clones share state. `savefig` only accepts the output path the surface
/// was created with.
#[derive(Debug, Clone, Default)]
pub struct PlotSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl PlotSurface {
    /// A surface that may save only to `output`.
    pub fn with_output(output: PathBuf) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                output: Some(output),
                ..SurfaceState::default()
            })),
        }
    }

    /// A surface that records but can never write a file.
    pub fn detached() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SurfaceState) -> Result<T>) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("plot surface lock poisoned"))?;
        f(&mut state)
    }

    pub fn update(&self, f: impl FnOnce(&mut Figure)) -> Result<()> {
        self.with_state(|s| {
            f(&mut s.figure);
            Ok(())
        })
    }

    pub fn add_series(&self, series: Series) -> Result<()> {
        series.validate()?;
        self.with_state(|s| {
            s.figure.series.push(series);
            Ok(())
        })
    }

    /// Attach hover labels to the most recently added series.
    pub fn hover(&self, labels: Vec<String>) -> Result<()> {
        self.with_state(|s| {
            let series = s
                .figure
                .series
                .last_mut()
                .ok_or_else(|| anyhow!("interact.hover: draw a series before adding hover labels"))?;
            if labels.len() != series.data_len() {
                bail!(
                    "interact.hover: {} labels for {} points",
                    labels.len(),
                    series.data_len()
                );
            }
            series.hover = labels;
            Ok(())
        })
    }

    /// Render the figure to SVG and write it to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let figure = self.with_state(|s| match &s.output {
            Some(allowed) if allowed == path => Ok(s.figure.clone()),
            Some(allowed) => bail!(
                "plt.savefig: output must be save_file_name ({}), got {}",
                allowed.display(),
                path.display()
            ),
            None => bail!("plt.savefig: saving is not available here"),
        })?;
        let svg = render_svg(&figure)?;
        std::fs::write(path, svg)
            .with_context(|| format!("plt.savefig: failed to write {}", path.display()))?;
        self.with_state(|s| {
            s.saved = Some(path.to_path_buf());
            Ok(())
        })
    }

    pub fn figure(&self) -> Result<Figure> {
        self.with_state(|s| Ok(s.figure.clone()))
    }

    pub fn saved_path(&self) -> Option<PathBuf> {
        self.with_state(|s| Ok(s.saved.clone())).ok().flatten()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════════════════

fn draw_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("drawing failed: {}", e)
}

/// A tooltip anchored at a pixel position.
struct HoverPoint {
    x: i32,
    y: i32,
    text: String,
}

/// Draw `figure` as an SVG document.
pub fn render_svg(figure: &Figure) -> Result<String> {
    ensure_fonts()?;
    let mut svg = String::new();
    let hovers = {
        let root = SVGBackend::with_string(&mut svg, (figure.width, figure.height))
            .into_drawing_area();
        let hovers = draw_figure(&root, figure)?;
        root.present().map_err(draw_err)?;
        hovers
    };
    Ok(inject_tooltips(svg, &hovers))
}

/// Draw `figure` as a PNG image.
pub fn render_png(figure: &Figure) -> Result<Vec<u8>> {
    ensure_fonts()?;
    let (w, h) = (figure.width, figure.height);
    let mut pixels = vec![0u8; (w as usize) * (h as usize) * 3];
    {
        let root = BitMapBackend::with_buffer(&mut pixels, (w, h)).into_drawing_area();
        draw_figure(&root, figure)?;
        root.present().map_err(draw_err)?;
    }
    let image = image::RgbImage::from_raw(w, h, pixels)
        .ok_or_else(|| anyhow!("bitmap buffer does not match {}x{}", w, h))?;
    let mut png = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(png)
}

fn inject_tooltips(svg: String, hovers: &[HoverPoint]) -> String {
    if hovers.is_empty() {
        return svg;
    }
    let mut overlay = String::from("<g class=\"tooltips\">");
    for h in hovers {
        overlay.push_str(&format!(
            "<circle cx=\"{}\" cy=\"{}\" r=\"7\" fill=\"transparent\"><title>{}</title></circle>",
            h.x,
            h.y,
            escape_xml(&h.text)
        ));
    }
    overlay.push_str("</g>");
    match svg.rfind("</svg>") {
        Some(pos) => {
            let mut out = svg;
            out.insert_str(pos, &overlay);
            out
        }
        None => svg,
    }
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn series_color(series: &Series, index: usize) -> RGBColor {
    series
        .color
        .map(|(r, g, b)| RGBColor(r, g, b))
        .unwrap_or(PALETTE[index % PALETTE.len()])
}

fn draw_figure<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    figure: &Figure,
) -> Result<Vec<HoverPoint>> {
    root.fill(&WHITE).map_err(draw_err)?;
    if figure.series.is_empty() {
        bail!("figure has no data; add a series (plt.plot, plt.bar, ...) before saving");
    }
    let pie = figure.series.iter().find_map(|s| match &s.kind {
        SeriesKind::Pie { labels, values } => Some((labels, values)),
        _ => None,
    });
    match pie {
        Some((labels, values)) => {
            draw_pie(root, figure, labels, values)?;
            Ok(Vec::new())
        }
        None => draw_cartesian(root, figure),
    }
}

/// Categories in order of first appearance across categorical series.
fn collect_categories(figure: &Figure) -> Vec<String> {
    let mut categories: Vec<String> = Vec::new();
    let mut push = |c: &String| {
        if !categories.contains(c) {
            categories.push(c.clone());
        }
    };
    for s in &figure.series {
        match &s.kind {
            SeriesKind::Bar { categories: cs, .. } => cs.iter().for_each(&mut push),
            SeriesKind::Line { x: XValues::Categorical(cs), .. }
            | SeriesKind::Area { x: XValues::Categorical(cs), .. } => cs.iter().for_each(&mut push),
            _ => {}
        }
    }
    categories
}

fn x_positions(x: &XValues, categories: &[String]) -> Vec<f64> {
    match x {
        XValues::Numeric(v) => v.clone(),
        XValues::Categorical(cs) => cs
            .iter()
            .map(|c| categories.iter().position(|k| k == c).unwrap_or(0) as f64)
            .collect(),
    }
}

fn padded(min: f64, max: f64) -> (f64, f64) {
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    if (max - min).abs() < f64::EPSILON {
        return (min - 1.0, max + 1.0);
    }
    let pad = (max - min) * 0.05;
    (min - pad, max + pad)
}

fn bounds<'a>(values: impl Iterator<Item = &'a f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(*v), hi.max(*v))
    })
}

fn draw_cartesian<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    figure: &Figure,
) -> Result<Vec<HoverPoint>> {
    let categories = collect_categories(figure);
    let categorical = !categories.is_empty();

    let mut xs: Vec<f64> = Vec::new();
    let mut ys: Vec<f64> = Vec::new();
    for s in &figure.series {
        match &s.kind {
            SeriesKind::Line { x, y } => {
                xs.extend(x_positions(x, &categories));
                ys.extend(y);
            }
            SeriesKind::Area { x, y } => {
                xs.extend(x_positions(x, &categories));
                ys.extend(y);
                ys.push(0.0);
            }
            SeriesKind::Bar { values, .. } => {
                ys.extend(values);
                ys.push(0.0);
            }
            SeriesKind::Scatter { x, y, .. } | SeriesKind::Hexbin { x, y, .. } => {
                xs.extend(x);
                ys.extend(y);
            }
            SeriesKind::Pie { .. } => {}
        }
    }

    let (x0, x1) = if categorical {
        let (lo, hi) = bounds(xs.iter());
        let lo = lo.min(0.0);
        let hi = hi.max(categories.len() as f64 - 1.0);
        (lo - 0.5, hi + 0.5)
    } else {
        let (lo, hi) = bounds(xs.iter());
        padded(lo, hi)
    };
    let (y0, y1) = {
        let (lo, hi) = bounds(ys.iter());
        padded(lo, hi)
    };

    let mut builder = ChartBuilder::on(root);
    builder
        .margin(16)
        .x_label_area_size(48)
        .y_label_area_size(64);
    if !figure.title.is_empty() {
        builder.caption(&figure.title, ("sans-serif", 22));
    }
    let mut chart = builder
        .build_cartesian_2d(x0..x1, y0..y1)
        .map_err(draw_err)?;

    let category_label = |v: &f64| -> String {
        let i = v.round();
        if (v - i).abs() < 1e-6 && i >= 0.0 && (i as usize) < categories.len() {
            categories[i as usize].clone()
        } else {
            String::new()
        }
    };
    {
        let mut mesh = chart.configure_mesh();
        mesh.x_desc(figure.x_label.as_str())
            .y_desc(figure.y_label.as_str());
        if categorical {
            mesh.x_labels(categories.len() + 1)
                .x_label_formatter(&category_label)
                .disable_x_mesh();
        }
        mesh.draw().map_err(draw_err)?;
    }

    let bar_total = figure
        .series
        .iter()
        .filter(|s| matches!(s.kind, SeriesKind::Bar { .. }))
        .count()
        .max(1);
    let bar_width = 0.8 / bar_total as f64;
    let mut bar_index = 0usize;
    let mut labelled = false;
    let mut hovers = Vec::new();

    for (i, series) in figure.series.iter().enumerate() {
        let color = series_color(series, i);
        let mut anchors: Vec<(f64, f64)> = Vec::new();
        match &series.kind {
            SeriesKind::Line { x, y } => {
                let points: Vec<(f64, f64)> =
                    x_positions(x, &categories).into_iter().zip(y.iter().copied()).collect();
                let anno = chart
                    .draw_series(LineSeries::new(points.clone(), color.stroke_width(2)))
                    .map_err(draw_err)?;
                if let Some(label) = &series.label {
                    anno.label(label.as_str()).legend(move |(x, y)| {
                        PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                    });
                    labelled = true;
                }
                anchors = points;
            }
            SeriesKind::Area { x, y } => {
                let points: Vec<(f64, f64)> =
                    x_positions(x, &categories).into_iter().zip(y.iter().copied()).collect();
                let anno = chart
                    .draw_series(
                        AreaSeries::new(points.clone(), 0.0, color.mix(0.3).filled())
                            .border_style(color.stroke_width(2)),
                    )
                    .map_err(draw_err)?;
                if let Some(label) = &series.label {
                    anno.label(label.as_str()).legend(move |(x, y)| {
                        Rectangle::new([(x, y - 5), (x + 20, y + 5)], color.mix(0.3).filled())
                    });
                    labelled = true;
                }
                anchors = points;
            }
            SeriesKind::Bar {
                categories: cs,
                values,
            } => {
                let offset = -0.4 + bar_width * bar_index as f64;
                bar_index += 1;
                let bars: Vec<(f64, f64)> = cs
                    .iter()
                    .zip(values.iter().copied())
                    .map(|(c, v)| {
                        let center = categories.iter().position(|k| k == c).unwrap_or(0) as f64;
                        (center + offset, v)
                    })
                    .collect();
                let anno = chart
                    .draw_series(bars.iter().map(|&(left, v)| {
                        Rectangle::new([(left, 0.0), (left + bar_width, v)], color.filled())
                    }))
                    .map_err(draw_err)?;
                if let Some(label) = &series.label {
                    anno.label(label.as_str()).legend(move |(x, y)| {
                        Rectangle::new([(x, y - 5), (x + 10, y + 5)], color.filled())
                    });
                    labelled = true;
                }
                anchors = bars
                    .iter()
                    .map(|&(left, v)| (left + bar_width / 2.0, v))
                    .collect();
            }
            SeriesKind::Scatter { x, y, size } => {
                let points: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
                let radius = size.max(1.0) as i32;
                let anno = chart
                    .draw_series(
                        points
                            .iter()
                            .map(|&p| Circle::new(p, radius, color.mix(0.7).filled())),
                    )
                    .map_err(draw_err)?;
                if let Some(label) = &series.label {
                    anno.label(label.as_str())
                        .legend(move |(x, y)| Circle::new((x + 10, y), 4, color.filled()));
                    labelled = true;
                }
                anchors = points;
            }
            SeriesKind::Hexbin { x, y, gridsize } => {
                let cells = hexbin_cells(x, y, *gridsize, (x0, x1), (y0, y1));
                let max = cells.iter().map(|c| c.count).max().unwrap_or(1).max(1);
                chart
                    .draw_series(cells.iter().map(|cell| {
                        let shade = hex_shade(cell.count as f64 / max as f64);
                        Polygon::new(cell.vertices.clone(), shade.filled())
                    }))
                    .map_err(draw_err)?;
                anchors = cells.iter().map(|c| c.center).collect();
            }
            SeriesKind::Pie { .. } => {}
        }

        if !series.hover.is_empty() && series.hover.len() == anchors.len() {
            for (anchor, text) in anchors.iter().zip(series.hover.iter()) {
                let (px, py) = chart.backend_coord(anchor);
                hovers.push(HoverPoint {
                    x: px,
                    y: py,
                    text: text.clone(),
                });
            }
        }
    }

    if labelled {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.85).filled())
            .border_style(BLACK.stroke_width(1))
            .draw()
            .map_err(draw_err)?;
    }

    Ok(hovers)
}

struct HexCell {
    center: (f64, f64),
    vertices: Vec<(f64, f64)>,
    count: usize,
}

/// Bin points onto two offset rectangular lattices whose union is a
/// hexagonal grid, `gridsize` hexagons across.
fn hexbin_cells(
    x: &[f64],
    y: &[f64],
    gridsize: usize,
    x_range: (f64, f64),
    y_range: (f64, f64),
) -> Vec<HexCell> {
    let nx = gridsize.max(1) as f64;
    let ny = (nx / 3f64.sqrt()).round().max(1.0);
    let sx = (x_range.1 - x_range.0) / nx;
    let sy = (y_range.1 - y_range.0) / ny;

    let mut counts: BTreeMap<(u8, i64, i64), usize> = BTreeMap::new();
    for (&px, &py) in x.iter().zip(y.iter()) {
        let u = (px - x_range.0) / sx;
        let v = (py - y_range.0) / sy;
        let (ix1, iy1) = (u.round(), v.round());
        let (ix2, iy2) = (u.floor(), v.floor());
        let d1 = (u - ix1).powi(2) + 3.0 * (v - iy1).powi(2);
        let d2 = (u - ix2 - 0.5).powi(2) + 3.0 * (v - iy2 - 0.5).powi(2);
        let key = if d1 < d2 {
            (0, ix1 as i64, iy1 as i64)
        } else {
            (1, ix2 as i64, iy2 as i64)
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    let shape = [
        (0.5, -0.5),
        (0.5, 0.5),
        (0.0, 1.0),
        (-0.5, 0.5),
        (-0.5, -0.5),
        (0.0, -1.0),
    ];
    counts
        .into_iter()
        .map(|((lattice, ix, iy), count)| {
            let shift = if lattice == 0 { 0.0 } else { 0.5 };
            let cx = x_range.0 + (ix as f64 + shift) * sx;
            let cy = y_range.0 + (iy as f64 + shift) * sy;
            let vertices = shape
                .iter()
                .map(|(dx, dy)| (cx + dx * sx, cy + dy * sy / 3.0))
                .collect();
            HexCell {
                center: (cx, cy),
                vertices,
                count,
            }
        })
        .collect()
}

fn hex_shade(t: f64) -> RGBColor {
    let t = t.clamp(0.0, 1.0);
    let mix = |a: u8, b: u8| (a as f64 + (b as f64 - a as f64) * t).round() as u8;
    RGBColor(
        mix(HEX_LIGHT.0, HEX_DARK.0),
        mix(HEX_LIGHT.1, HEX_DARK.1),
        mix(HEX_LIGHT.2, HEX_DARK.2),
    )
}

fn draw_pie<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    figure: &Figure,
    labels: &[String],
    values: &[f64],
) -> Result<()> {
    let (w, h) = (figure.width as f64, figure.height as f64);
    let top = if figure.title.is_empty() { 0.0 } else { 36.0 };
    if !figure.title.is_empty() {
        root.draw(&Text::new(
            figure.title.clone(),
            ((w / 2.0 - figure.title.len() as f64 * 5.0) as i32, 10),
            ("sans-serif", 22).into_font(),
        ))
        .map_err(draw_err)?;
    }

    let center = (w / 2.0, top + (h - top) / 2.0);
    let radius = ((h - top).min(w) * 0.33).max(10.0);
    let total: f64 = values.iter().sum();
    let mut start = -std::f64::consts::FRAC_PI_2;

    for (i, (label, value)) in labels.iter().zip(values.iter()).enumerate() {
        let sweep = value / total * std::f64::consts::TAU;
        let end = start + sweep;
        let color = PALETTE[i % PALETTE.len()];

        let steps = ((sweep.to_degrees() / 2.0).ceil() as usize).max(1);
        let mut points = vec![(center.0 as i32, center.1 as i32)];
        for s in 0..=steps {
            let a = start + sweep * s as f64 / steps as f64;
            points.push((
                (center.0 + radius * a.cos()).round() as i32,
                (center.1 + radius * a.sin()).round() as i32,
            ));
        }
        root.draw(&Polygon::new(points, color.filled()))
            .map_err(draw_err)?;

        let mid = start + sweep / 2.0;
        let text = format!("{} ({:.1}%)", label, value / total * 100.0);
        let lx = center.0 + radius * 1.15 * mid.cos();
        let ly = center.1 + radius * 1.15 * mid.sin();
        let lx = if mid.cos() < 0.0 {
            lx - text.len() as f64 * 7.0
        } else {
            lx
        };
        root.draw(&Text::new(
            text,
            (lx as i32, ly as i32),
            ("sans-serif", 14).into_font(),
        ))
        .map_err(draw_err)?;

        start = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scatter_figure() -> Figure {
        Figure {
            title: "Engine size vs city mpg".into(),
            x_label: "engine_size".into(),
            y_label: "city_mpg".into(),
            series: vec![Series::new(SeriesKind::Scatter {
                x: vec![1.6, 3.0, 2.0, 5.0],
                y: vec![31.0, 19.0, 26.0, 14.0],
                size: 4.0,
            })],
            ..Figure::default()
        }
    }

    #[test]
    fn svg_contains_document_and_title() {
        let svg = render_svg(&scatter_figure()).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("</svg>"));
        assert!(svg.contains("Engine size vs city mpg"));
    }

    #[test]
    fn png_decodes_to_figure_size() {
        let png = render_png(&scatter_figure()).unwrap();
        assert!(!png.is_empty());
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!(img.width(), 800);
        assert_eq!(img.height(), 520);
    }

    #[test]
    fn every_series_kind_renders() {
        let kinds = vec![
            SeriesKind::Line {
                x: XValues::Categorical(vec!["2019".into(), "2020".into(), "2021".into()]),
                y: vec![1.0, 3.0, 2.0],
            },
            SeriesKind::Area {
                x: XValues::Numeric(vec![0.0, 1.0, 2.0]),
                y: vec![2.0, 4.0, 1.0],
            },
            SeriesKind::Bar {
                categories: vec!["sedan".into(), "suv".into()],
                values: vec![3.0, 1.0],
            },
            SeriesKind::Pie {
                labels: vec!["sedan".into(), "suv".into()],
                values: vec![3.0, 1.0],
            },
            SeriesKind::Hexbin {
                x: vec![1.0, 1.1, 2.0, 3.5, 3.6],
                y: vec![5.0, 5.2, 4.0, 1.0, 1.1],
                gridsize: 10,
            },
        ];
        for kind in kinds {
            let figure = Figure {
                series: vec![Series::new(kind.clone())],
                ..Figure::default()
            };
            let svg = render_svg(&figure).unwrap();
            assert!(svg.contains("<svg"), "no svg for {:?}", kind);
            assert!(!render_png(&figure).unwrap().is_empty());
        }
    }

    #[test]
    fn bitmap_draws_caption_text() {
        let figure = Figure {
            title: "Vehicles by type".into(),
            series: vec![Series::new(SeriesKind::Pie {
                labels: vec!["sedan".into(), "suv".into(), "truck".into()],
                values: vec![5.0, 4.0, 2.0],
            })],
            ..Figure::default()
        };
        let png = render_png(&figure).unwrap();
        let img = image::load_from_memory(&png).unwrap().to_rgb8();
        // the title band holds nothing but the caption glyphs
        let inked = (0..40)
            .flat_map(|y| (0..img.width()).map(move |x| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y).0.iter().all(|&c| c < 100))
            .count();
        assert!(inked > 0);
    }

    #[test]
    fn empty_figure_is_an_error() {
        assert!(render_svg(&Figure::default()).is_err());
    }

    #[test]
    fn validation_catches_bad_series() {
        let ragged = Series::new(SeriesKind::Scatter {
            x: vec![1.0, 2.0],
            y: vec![1.0],
            size: 3.0,
        });
        assert!(ragged.validate().unwrap_err().to_string().contains("length mismatch"));

        let nan = Series::new(SeriesKind::Bar {
            categories: vec!["a".into()],
            values: vec![f64::NAN],
        });
        assert!(nan.validate().is_err());

        let negative_pie = Series::new(SeriesKind::Pie {
            labels: vec!["a".into(), "b".into()],
            values: vec![1.0, -1.0],
        });
        assert!(negative_pie.validate().is_err());
    }

    #[test]
    fn hover_labels_become_svg_titles() {
        let surface = PlotSurface::detached();
        surface
            .add_series(Series::new(SeriesKind::Scatter {
                x: vec![1.0, 2.0],
                y: vec![3.0, 4.0],
                size: 3.0,
            }))
            .unwrap();
        assert!(surface.hover(vec!["only one".into()]).is_err());
        surface
            .hover(vec!["a <b>".into(), "c & d".into()])
            .unwrap();
        let svg = render_svg(&surface.figure().unwrap()).unwrap();
        assert!(svg.contains("<title>a &lt;b&gt;</title>"));
        assert!(svg.contains("<title>c &amp; d</title>"));
    }

    #[test]
    fn save_is_limited_to_the_bound_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let allowed = dir.path().join("bar_chart.svg");
        let surface = PlotSurface::with_output(allowed.clone());
        surface
            .add_series(Series::new(SeriesKind::Bar {
                categories: vec!["a".into()],
                values: vec![1.0],
            }))
            .unwrap();

        assert!(surface.save(&dir.path().join("elsewhere.svg")).is_err());
        surface.save(&allowed).unwrap();
        assert_eq!(surface.saved_path(), Some(allowed.clone()));
        assert!(std::fs::read_to_string(&allowed).unwrap().contains("<svg"));

        assert!(PlotSurface::detached().save(&allowed).is_err());
    }
}
