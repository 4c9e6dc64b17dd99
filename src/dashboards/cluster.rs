//! k-means clustering view over a CSV data file

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{Dashboard, DashboardQuery, Dataset, KMeans, KMeansFit};
use crate::data::{BlobCache, BlobRef};
use crate::portal::escape_html;
use crate::{Error, Result};

const PLOT_WIDTH: f64 = 640.0;
const PLOT_HEIGHT: f64 = 480.0;
const PLOT_MARGIN: f64 = 56.0;

const PALETTE: [&str; 10] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f",
    "#bcbd22", "#17becf",
];

/// Presentation and defaults of a cluster dashboard
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// URL segment
    pub slug: String,
    /// Menu title
    pub title: String,
    /// Page heading
    pub heading: String,
    /// Column plotted on the x axis by default
    pub default_x: String,
    /// Column plotted on the y axis by default
    pub default_y: String,
    /// Cluster count by default
    pub default_clusters: usize,
}

impl ClusterOptions {
    /// The iris example
    #[must_use]
    pub fn iris() -> Self {
        Self {
            slug: "iris-example".to_string(),
            title: "Iris Example".to_string(),
            heading: "Iris k-means clustering".to_string(),
            default_x: "sepal length (cm)".to_string(),
            default_y: "sepal width (cm)".to_string(),
            default_clusters: 3,
        }
    }
}

/// Controls resolved against the loaded columns
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClusterParams {
    x: String,
    y: String,
    clusters: usize,
}

/// Clustering of two numeric columns, data loaded through the blob cache
/// on every request
pub struct ClusterDashboard {
    options: ClusterOptions,
    cache: Arc<BlobCache>,
    blob: BlobRef,
}

impl std::fmt::Debug for ClusterDashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDashboard")
            .field("slug", &self.options.slug)
            .field("blob", &self.blob)
            .finish_non_exhaustive()
    }
}

impl ClusterDashboard {
    /// Create a dashboard over `blob`
    #[must_use]
    pub fn new(options: ClusterOptions, cache: Arc<BlobCache>, blob: BlobRef) -> Self {
        Self {
            options,
            cache,
            blob,
        }
    }

    async fn load(&self) -> Result<Dataset> {
        let data = self.cache.get(&self.blob, true).await?;
        let dataset = Dataset::from_csv(&data)?;
        debug!(blob = %self.blob, rows = dataset.len(), "Loaded dataset");
        Ok(dataset)
    }

    fn params(&self, dataset: &Dataset, query: &DashboardQuery) -> Result<ClusterParams> {
        let columns = dataset.columns();
        if columns.len() < 2 {
            return Err(Error::Data(format!(
                "{} has fewer than two numeric columns",
                self.blob
            )));
        }

        let known = |name: &str| columns.iter().any(|c| c == name);
        let pick = |key: &str, default: &str, fallback: &str| -> String {
            query
                .get(key)
                .map(String::as_str)
                .filter(|c| known(c))
                .or_else(|| Some(default).filter(|c| known(c)))
                .unwrap_or(fallback)
                .to_string()
        };

        let x = pick("x", &self.options.default_x, &columns[0]);
        let mut y = pick("y", &self.options.default_y, &columns[1]);
        if y == x {
            if let Some(other) = columns.iter().find(|c| **c != x) {
                y.clone_from(other);
            }
        }

        let clusters = query
            .get("clusters")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map_or(self.options.default_clusters, |n| {
                usize::try_from(n.max(1)).unwrap_or(1)
            })
            .max(1);

        Ok(ClusterParams { x, y, clusters })
    }

    async fn compute(
        &self,
        query: &DashboardQuery,
    ) -> Result<(Dataset, ClusterParams, Vec<[f64; 2]>, KMeansFit)> {
        let dataset = self.load().await?;
        let params = self.params(&dataset, query)?;
        let points = dataset
            .points(&params.x, &params.y)
            .ok_or_else(|| Error::Data("selected columns disappeared".to_string()))?;
        let fit = KMeans::new(params.clusters).fit(&points);
        Ok((dataset, params, points, fit))
    }
}

#[async_trait]
impl Dashboard for ClusterDashboard {
    fn slug(&self) -> &str {
        &self.options.slug
    }

    fn title(&self) -> &str {
        &self.options.title
    }

    async fn render(&self, query: &DashboardQuery) -> Result<String> {
        let (dataset, params, points, fit) = self.compute(query).await?;

        let mut html = String::new();
        let _ = write!(
            html,
            "<h1>{}</h1>\n<hr>\n<div class=\"row\">\n<form class=\"card\" method=\"get\">\n",
            escape_html(&self.options.heading)
        );
        let _ = write!(
            html,
            "<label for=\"x-variable\">X variable</label>\n{}\n\
             <label for=\"y-variable\">Y variable</label>\n{}\n",
            column_select("x-variable", "x", dataset.columns(), &params.x, &params.y),
            column_select("y-variable", "y", dataset.columns(), &params.y, &params.x),
        );
        let _ = write!(
            html,
            "<label for=\"cluster-count\">Cluster count</label>\n\
             <input id=\"cluster-count\" name=\"clusters\" type=\"number\" min=\"1\" value=\"{}\">\n\
             <button type=\"submit\">Update</button>\n</form>\n",
            params.clusters
        );
        let _ = write!(
            html,
            "<div class=\"graph\" id=\"cluster-graph\">\n{}</div>\n</div>\n",
            scatter_svg(&params, &points, &fit)
        );
        let _ = write!(
            html,
            "<p><a href=\"data?x={}&amp;y={}&amp;clusters={}\">Figure data (JSON)</a></p>\n",
            url_encode(&params.x),
            url_encode(&params.y),
            params.clusters
        );

        Ok(html)
    }

    async fn figure(&self, query: &DashboardQuery) -> Result<Value> {
        let (_, params, points, fit) = self.compute(query).await?;
        Ok(figure_json(&params, &points, &fit))
    }
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `<select>` over the columns; the column chosen on the other axis is disabled
fn column_select(id: &str, name: &str, columns: &[String], selected: &str, other: &str) -> String {
    let mut html = format!("<select id=\"{id}\" name=\"{name}\">");
    for column in columns {
        let escaped = escape_html(column);
        let _ = write!(
            html,
            "<option value=\"{escaped}\"{}{}>{escaped}</option>",
            if column == selected { " selected" } else { "" },
            if column == other { " disabled" } else { "" },
        );
    }
    html.push_str("</select>");
    html
}

/// Scatter traces per cluster plus the centres, in plotly figure layout
fn figure_json(params: &ClusterParams, points: &[[f64; 2]], fit: &KMeansFit) -> Value {
    let mut data: Vec<Value> = (0..fit.centers.len())
        .map(|cluster| {
            let (xs, ys): (Vec<f64>, Vec<f64>) = points
                .iter()
                .zip(&fit.labels)
                .filter(|(_, label)| **label == cluster)
                .map(|(p, _)| (p[0], p[1]))
                .unzip();
            json!({
                "x": xs,
                "y": ys,
                "mode": "markers",
                "marker": {"size": 8},
                "name": format!("Cluster {cluster}"),
            })
        })
        .collect();

    data.push(json!({
        "x": fit.centers.iter().map(|c| c[0]).collect::<Vec<_>>(),
        "y": fit.centers.iter().map(|c| c[1]).collect::<Vec<_>>(),
        "mode": "markers",
        "marker": {"color": "#000", "size": 12, "symbol": "diamond"},
        "name": "Cluster centers",
    }));

    json!({
        "data": data,
        "layout": {
            "xaxis": {"title": params.x},
            "yaxis": {"title": params.y},
        },
    })
}

/// Axis range with padding; a flat range is widened around its value
fn axis_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    let pad = if max > min { (max - min) * 0.05 } else { 0.5 };
    (min - pad, max + pad)
}

fn scatter_svg(params: &ClusterParams, points: &[[f64; 2]], fit: &KMeansFit) -> String {
    let (x_min, x_max) = axis_range(points.iter().map(|p| p[0]));
    let (y_min, y_max) = axis_range(points.iter().map(|p| p[1]));
    let plot_w = PLOT_WIDTH - 2.0 * PLOT_MARGIN;
    let plot_h = PLOT_HEIGHT - 2.0 * PLOT_MARGIN;
    let sx = |x: f64| PLOT_MARGIN + (x - x_min) / (x_max - x_min) * plot_w;
    let sy = |y: f64| PLOT_HEIGHT - PLOT_MARGIN - (y - y_min) / (y_max - y_min) * plot_h;

    let mut svg = format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 {PLOT_WIDTH} {PLOT_HEIGHT}\" \
         width=\"{PLOT_WIDTH}\" height=\"{PLOT_HEIGHT}\" role=\"img\">\n"
    );
    let _ = writeln!(
        svg,
        "<rect x=\"{PLOT_MARGIN}\" y=\"{PLOT_MARGIN}\" width=\"{plot_w}\" height=\"{plot_h}\" \
         fill=\"none\" stroke=\"#ccc\"/>"
    );

    for (point, label) in points.iter().zip(&fit.labels) {
        let _ = writeln!(
            svg,
            "<circle cx=\"{:.1}\" cy=\"{:.1}\" r=\"4\" fill=\"{}\"/>",
            sx(point[0]),
            sy(point[1]),
            PALETTE[label % PALETTE.len()]
        );
    }

    for center in &fit.centers {
        let (cx, cy) = (sx(center[0]), sy(center[1]));
        let _ = writeln!(
            svg,
            "<polygon points=\"{:.1},{:.1} {:.1},{:.1} {:.1},{:.1} {:.1},{:.1}\" fill=\"#000\"/>",
            cx,
            cy - 7.0,
            cx + 7.0,
            cy,
            cx,
            cy + 7.0,
            cx - 7.0,
            cy
        );
    }

    let _ = writeln!(
        svg,
        "<text x=\"{:.1}\" y=\"{:.1}\" text-anchor=\"middle\">{}</text>",
        PLOT_WIDTH / 2.0,
        PLOT_HEIGHT - 16.0,
        escape_html(&params.x)
    );
    let _ = writeln!(
        svg,
        "<text x=\"16\" y=\"{:.1}\" text-anchor=\"middle\" transform=\"rotate(-90 16 {:.1})\">{}</text>",
        PLOT_HEIGHT / 2.0,
        PLOT_HEIGHT / 2.0,
        escape_html(&params.y)
    );
    let _ = writeln!(
        svg,
        "<text x=\"{PLOT_MARGIN}\" y=\"{:.1}\" font-size=\"11\">{x_min:.2}</text>\
         <text x=\"{:.1}\" y=\"{:.1}\" font-size=\"11\" text-anchor=\"end\">{x_max:.2}</text>",
        PLOT_HEIGHT - PLOT_MARGIN + 14.0,
        PLOT_WIDTH - PLOT_MARGIN,
        PLOT_HEIGHT - PLOT_MARGIN + 14.0,
    );
    let _ = writeln!(
        svg,
        "<text x=\"{:.1}\" y=\"{:.1}\" font-size=\"11\" text-anchor=\"end\">{y_min:.2}</text>\
         <text x=\"{:.1}\" y=\"{PLOT_MARGIN}\" font-size=\"11\" text-anchor=\"end\">{y_max:.2}</text>",
        PLOT_MARGIN - 4.0,
        PLOT_HEIGHT - PLOT_MARGIN,
        PLOT_MARGIN - 4.0,
    );

    for cluster in 0..fit.centers.len() {
        #[allow(clippy::cast_precision_loss)]
        let y = PLOT_MARGIN + 14.0 * cluster as f64;
        let _ = writeln!(
            svg,
            "<text x=\"{:.1}\" y=\"{y:.1}\" font-size=\"11\" fill=\"{}\">Cluster {cluster}</text>",
            PLOT_WIDTH - PLOT_MARGIN + 4.0,
            PALETTE[cluster % PALETTE.len()]
        );
    }

    svg.push_str("</svg>\n");
    svg
}
