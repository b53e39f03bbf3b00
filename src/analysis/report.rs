use super::{MiResult, TreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// One named value in an evaluation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: String,
    pub value: String,
}

impl MetricRow {
    fn new(metric: &str, value: impl Into<String>) -> Self {
        Self {
            metric: metric.to_string(),
            value: value.into(),
        }
    }
}

/// Combined TRE and MI evaluation of one registration result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub created_at: DateTime<Utc>,
    pub transform_name: Option<String>,
    pub tre: Option<TreResult>,
    pub mutual_information: Option<MiResult>,
}

impl EvaluationReport {
    pub fn new(transform_name: Option<String>) -> Self {
        Self {
            created_at: Utc::now(),
            transform_name,
            tre: None,
            mutual_information: None,
        }
    }

    pub fn with_tre(mut self, tre: TreResult) -> Self {
        self.tre = Some(tre);
        self
    }

    pub fn with_mutual_information(mut self, mi: MiResult) -> Self {
        self.mutual_information = Some(mi);
        self
    }

    /// Rows for display, TRE statistics first.
    pub fn rows(&self) -> Vec<MetricRow> {
        let mut rows = Vec::new();
        if let Some(ref tre) = self.tre {
            rows.push(MetricRow::new("TRE - Mean (mm)", format!("{:.3}", tre.mean)));
            rows.push(MetricRow::new("TRE - Max (mm)", format!("{:.3}", tre.max)));
            rows.push(MetricRow::new("TRE - Min (mm)", format!("{:.3}", tre.min)));
            rows.push(MetricRow::new("TRE - Std Dev (mm)", format!("{:.3}", tre.std)));
            rows.push(MetricRow::new("TRE - Point Count", tre.count.to_string()));
        }
        if let Some(ref mi) = self.mutual_information {
            rows.push(MetricRow::new(&format!("{} MI", mi.method), format!("{:.6}", mi.value)));
            rows.push(MetricRow::new(&format!("{} MI (negative)", mi.method), format!("{:.6}", mi.negative())));
            rows.push(MetricRow::new("MI - Used Mask", if mi.used_mask { "Yes" } else { "No" }));
            rows.push(MetricRow::new("MI - Method", mi.method.clone()));
        }
        rows
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let width = rows.iter().map(|r| r.metric.len()).max().unwrap_or(0);
        if let Some(ref name) = self.transform_name {
            writeln!(f, "Transform: {}", name)?;
        }
        for row in rows {
            writeln!(f, "{:<width$}  {}", row.metric, row.value, width = width)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::compute_tre;
    use crate::spatial::Point3;

    fn report() -> EvaluationReport {
        let tre = compute_tre(
            &[Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 0.0, 0.0)],
            &[Point3::new(0.0, 0.0, 0.0), Point3::new(9.0, 0.0, 0.0)],
            None,
        )
        .unwrap();
        EvaluationReport::new(Some("registration_transform".to_string()))
            .with_tre(tre)
            .with_mutual_information(MiResult {
                value: 0.5,
                used_mask: true,
                method: "Mattes".to_string(),
            })
    }

    #[test]
    fn test_rows() {
        let rows = report().rows();
        assert_eq!(rows.len(), 9);
        assert_eq!(rows[0], MetricRow::new("TRE - Mean (mm)", "0.500"));
        assert_eq!(rows[5], MetricRow::new("Mattes MI", "0.500000"));
        assert_eq!(rows[6], MetricRow::new("Mattes MI (negative)", "-0.500000"));
        assert_eq!(rows[7].value, "Yes");
    }

    #[test]
    fn test_json_contains_sections() {
        let json = report().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["tre"]["count"], 2);
        assert_eq!(value["mutual_information"]["method"], "Mattes");
        assert!(value["created_at"].is_string());
    }

    #[test]
    fn test_display_lists_rows() {
        let text = report().to_string();
        assert!(text.starts_with("Transform: registration_transform"));
        assert!(text.contains("MI - Used Mask"));
    }
}
