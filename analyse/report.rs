//! Report artifacts: the aggregate importance table and the per-metric CSV
//! files consumed by the external renderer.

use crate::attribution::Attribution;
use crate::importance::rank_features;
use csv::WriterBuilder;
use ndarray::ArrayView1;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Aggregate importance table written at the end of a run.
pub const IMPORTANCE_FILE: &str = "relative_importance.csv";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write CSV output: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error while writing a report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metric '{metric}' has {found} importance values but the table has {expected} parameters.")]
    LengthMismatch {
        metric: String,
        expected: usize,
        found: usize,
    },
    #[error("Metric '{0}' was already added to the importance table.")]
    DuplicateMetric(String),
    #[error("Report columns for '{0}' have inconsistent lengths.")]
    RaggedColumns(String),
}

/// Importances of every parameter for every successfully analysed metric.
///
/// Rows are parameters in input order; columns are metrics in the order they
/// were appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceTable {
    parameters: Vec<String>,
    metrics: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl ImportanceTable {
    pub fn new(parameters: Vec<String>) -> Self {
        Self {
            parameters,
            metrics: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Adds one metric's importance column.
    pub fn append(&mut self, metric: &str, importances: Vec<f64>) -> Result<(), ReportError> {
        if importances.len() != self.parameters.len() {
            return Err(ReportError::LengthMismatch {
                metric: metric.to_string(),
                expected: self.parameters.len(),
                found: importances.len(),
            });
        }
        if self.metrics.iter().any(|m| m == metric) {
            return Err(ReportError::DuplicateMetric(metric.to_string()));
        }
        self.metrics.push(metric.to_string());
        self.columns.push(importances);
        Ok(())
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn metrics(&self) -> &[String] {
        &self.metrics
    }

    pub fn get(&self, metric: &str) -> Option<&[f64]> {
        self.metrics
            .iter()
            .position(|m| m == metric)
            .map(|i| self.columns[i].as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Writes `parameter,<metric...>` with one row per parameter.
    pub fn write_csv(&self, path: &Path) -> Result<(), ReportError> {
        prepare_output_path(path)?;
        let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;

        let header = std::iter::once("parameter").chain(self.metrics.iter().map(String::as_str));
        wtr.write_record(header)?;
        for (row, parameter) in self.parameters.iter().enumerate() {
            let record = std::iter::once(parameter.clone())
                .chain(self.columns.iter().map(|column| column[row].to_string()));
            wtr.write_record(record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// File stems for per-metric artifacts, one per metric and pairwise
/// distinct.
///
/// Characters that are unsafe in file names are replaced by `_`. Stems are
/// compared case-insensitively; a metric whose stem is already taken by an
/// earlier one gets its column index appended (`peak_day` then `peak_day_1`).
pub fn metric_stems(metrics: &[String]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(metrics.len());
    metrics
        .iter()
        .enumerate()
        .map(|(index, metric)| {
            let base = sanitize(metric);
            let mut stem = base.clone();
            while !taken.insert(stem.to_lowercase()) {
                stem.push_str(&format!("_{index}"));
            }
            if stem != base {
                log::warn!("Artifacts of '{metric}' are named '{stem}' to avoid a file-name clash");
            }
            stem
        })
        .collect()
}

fn sanitize(metric: &str) -> String {
    metric
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Path of a per-metric artifact, e.g. `out/<stem>.summary.csv`.
pub fn artifact_path(out_dir: &Path, stem: &str, suffix: &str) -> PathBuf {
    out_dir.join(format!("{stem}.{suffix}"))
}

/// Writes `id,predicted,actual` for the held-out rows.
pub fn write_predictions(
    path: &Path,
    ids: &[String],
    predicted: ArrayView1<f64>,
    actual: Option<ArrayView1<f64>>,
) -> Result<(), ReportError> {
    if predicted.len() != ids.len() || actual.is_some_and(|a| a.len() != ids.len()) {
        return Err(ReportError::RaggedColumns(path.display().to_string()));
    }
    prepare_output_path(path)?;
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;

    match actual {
        Some(actual) => {
            wtr.write_record(["id", "predicted", "actual"])?;
            for ((id, p), a) in ids.iter().zip(predicted.iter()).zip(actual.iter()) {
                wtr.write_record([id.clone(), p.to_string(), a.to_string()])?;
            }
        }
        None => {
            wtr.write_record(["id", "predicted"])?;
            for (id, p) in ids.iter().zip(predicted.iter()) {
                wtr.write_record([id.clone(), p.to_string()])?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `id,baseline,<parameter...>`, one row per explained sample.
pub fn write_attributions(
    path: &Path,
    ids: &[String],
    parameters: &[String],
    attribution: &Attribution,
) -> Result<(), ReportError> {
    if attribution.values.dim() != (ids.len(), parameters.len()) {
        return Err(ReportError::RaggedColumns(path.display().to_string()));
    }
    prepare_output_path(path)?;
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;

    let header = ["id", "baseline"]
        .into_iter()
        .chain(parameters.iter().map(String::as_str));
    wtr.write_record(header)?;

    let baseline = attribution.baseline.to_string();
    for (id, row) in ids.iter().zip(attribution.values.rows()) {
        let record = [id.clone(), baseline.clone()]
            .into_iter()
            .chain(row.iter().map(f64::to_string));
        wtr.write_record(record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes `parameter,importance,mean_abs_attribution,rank`, most important
/// parameter first.
pub fn write_summary(
    path: &Path,
    parameters: &[String],
    importances: &[f64],
    mean_abs_attribution: ArrayView1<f64>,
) -> Result<(), ReportError> {
    if importances.len() != parameters.len() || mean_abs_attribution.len() != parameters.len() {
        return Err(ReportError::RaggedColumns(path.display().to_string()));
    }
    prepare_output_path(path)?;
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;

    wtr.write_record(["parameter", "importance", "mean_abs_attribution", "rank"])?;
    for feature in rank_features(parameters, importances) {
        let column = parameters
            .iter()
            .position(|p| *p == feature.name)
            .ok_or_else(|| ReportError::RaggedColumns(feature.name.clone()))?;
        wtr.write_record([
            feature.name,
            feature.importance.to_string(),
            mean_abs_attribution[column].to_string(),
            feature.rank.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Pearson correlation; `None` for fewer than two pairs or a constant side.
pub fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Option<f64> {
    let n = a.len();
    if n < 2 || b.len() != n {
        return None;
    }
    let (mean_a, mean_b) = (a.mean()?, b.mean()?);
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denominator = (var_a * var_b).sqrt();
    (denominator > 0.0).then(|| cov / denominator)
}

pub fn mean_squared_error(predicted: ArrayView1<f64>, actual: ArrayView1<f64>) -> Option<f64> {
    if predicted.is_empty() || predicted.len() != actual.len() {
        return None;
    }
    Some((&predicted - &actual).mapv(|d| d * d).sum() / predicted.len() as f64)
}

fn prepare_output_path(path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn importance_table_collects_columns() {
        let mut table = ImportanceTable::new(names(&["r0", "delay"]));
        assert!(table.is_empty());
        table.append("deaths", vec![0.75, 0.25]).unwrap();
        table.append("peak", vec![0.1, 0.9]).unwrap();

        assert_eq!(table.metrics(), &["deaths".to_string(), "peak".to_string()]);
        assert_eq!(table.get("peak"), Some(&[0.1, 0.9][..]));
        assert_eq!(table.get("missing"), None);

        assert!(matches!(
            table.append("size", vec![1.0]),
            Err(ReportError::LengthMismatch { expected: 2, found: 1, .. })
        ));
        assert!(matches!(
            table.append("deaths", vec![0.5, 0.5]),
            Err(ReportError::DuplicateMetric(_))
        ));
    }

    #[test]
    fn importance_table_is_written_with_parameters_as_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(IMPORTANCE_FILE);
        let mut table = ImportanceTable::new(names(&["r0", "delay"]));
        table.append("deaths", vec![0.75, 0.25]).unwrap();
        table.append("peak", vec![0.0, 1.0]).unwrap();
        table.write_csv(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "parameter,deaths,peak\nr0,0.75,0\ndelay,0.25,1\n");
    }

    #[test]
    fn attributions_file_has_baseline_and_parameter_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deaths.attributions.csv");
        let attribution = Attribution {
            baseline: 2.5,
            values: array![[0.5, -1.0], [0.25, 0.0]],
        };
        write_attributions(&path, &names(&["a", "b"]), &names(&["r0", "delay"]), &attribution)
            .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "id,baseline,r0,delay\na,2.5,0.5,-1\nb,2.5,0.25,0\n");
    }

    #[test]
    fn summary_is_sorted_by_rank() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("deaths.summary.csv");
        write_summary(
            &path,
            &names(&["r0", "delay", "tracing"]),
            &[0.2, 0.5, 0.3],
            array![1.0, 2.0, 3.0].view(),
        )
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "parameter,importance,mean_abs_attribution,rank");
        assert_eq!(lines[1], "delay,0.5,2,1");
        assert_eq!(lines[2], "tracing,0.3,3,2");
        assert_eq!(lines[3], "r0,0.2,1,3");
    }

    #[test]
    fn predictions_without_actuals_have_two_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        write_predictions(&path, &names(&["x"]), array![1.5].view(), None).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "id,predicted\nx,1.5\n");

        assert!(matches!(
            write_predictions(&path, &names(&["x", "y"]), array![1.5].view(), None),
            Err(ReportError::RaggedColumns(_))
        ));
    }

    #[test]
    fn metric_stems_are_sanitized_and_distinct() {
        let stems = metric_stems(&names(&[
            "peak infections/day",
            "total_cases",
            "peak day",
            "peak_day",
            "Peak_Day",
        ]));
        assert_eq!(
            stems,
            names(&[
                "peak_infections_day",
                "total_cases",
                "peak_day",
                "peak_day_3",
                "Peak_Day_4",
            ])
        );
        assert_eq!(
            artifact_path(Path::new("results"), &stems[0], "model"),
            Path::new("results").join("peak_infections_day.model")
        );
    }

    #[test]
    fn appended_index_never_reuses_a_stem() {
        let stems = metric_stems(&names(&["a_1", "a b", "a_b", "a"]));
        assert_eq!(stems, names(&["a_1", "a_b", "a_b_2", "a"]));
        let stems = metric_stems(&names(&["x", "x_1", "x"]));
        assert_eq!(stems, names(&["x", "x_1", "x_2"]));
    }

    #[test]
    fn correlation_and_error() {
        let a = array![1.0, 2.0, 3.0, 4.0];
        let b = array![2.0, 4.0, 6.0, 8.0];
        assert_abs_diff_eq!(pearson(a.view(), b.view()).unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            pearson(a.view(), b.mapv(|v| -v).view()).unwrap(),
            -1.0,
            epsilon = 1e-12
        );
        assert!(pearson(a.view(), array![1.0, 1.0, 1.0, 1.0].view()).is_none());
        assert!(pearson(array![1.0].view(), array![2.0].view()).is_none());

        assert_abs_diff_eq!(mean_squared_error(a.view(), b.view()).unwrap(), 7.5, epsilon = 1e-12);
        let empty = ndarray::Array1::<f64>::zeros(0);
        assert!(mean_squared_error(empty.view(), empty.view()).is_none());
    }
}
