use crate::error::RegistrationError;
use crate::spatial::{Point3, Transform};
use serde::{Deserialize, Serialize};

/// Target registration error over corresponding point pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreResult {
    /// Distance per pair, in input order (mm).
    pub distances: Vec<f64>,
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    /// Population standard deviation.
    pub std: f64,
    pub count: usize,
}

/// Distance between `fixed[i]` and `transform(moving[i])` for every pair.
///
/// Points are matched by position in the sequences. Both sequences must be
/// non-empty and of equal length; nothing is computed otherwise.
pub fn compute_tre(
    fixed: &[Point3],
    moving: &[Point3],
    transform: Option<&Transform>,
) -> Result<TreResult, RegistrationError> {
    if fixed.is_empty() || moving.is_empty() {
        return Err(RegistrationError::validation("point lists must not be empty"));
    }
    if fixed.len() != moving.len() {
        return Err(RegistrationError::validation(format!(
            "point count mismatch: {} fixed vs {} moving",
            fixed.len(),
            moving.len()
        )));
    }

    let distances: Vec<f64> = fixed
        .iter()
        .zip(moving)
        .map(|(&f, &m)| {
            let mapped = transform.map_or(m, |t| t.apply(m));
            f.distance(mapped)
        })
        .collect();

    let count = distances.len();
    let mean = distances.iter().sum::<f64>() / count as f64;
    let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / count as f64;
    let max = distances.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = distances.iter().copied().fold(f64::INFINITY, f64::min);

    tracing::debug!(count, mean, max, "TRE computed");

    Ok(TreResult {
        distances,
        mean,
        max,
        min,
        std: variance.sqrt(),
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pair() {
        let result = compute_tre(&[Point3::new(0.0, 0.0, 0.0)], &[Point3::new(3.0, 4.0, 0.0)], None).unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.mean, 5.0);
        assert_eq!(result.std, 0.0);
    }

    #[test]
    fn test_population_std() {
        let fixed = [Point3::origin(); 4];
        let moving = [
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
            Point3::new(3.0, 0.0, 0.0),
        ];
        let result = compute_tre(&fixed, &moving, None).unwrap();
        assert_eq!(result.mean, 2.0);
        assert_eq!(result.std, 1.0);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(matches!(compute_tre(&[], &[], None), Err(RegistrationError::Validation(_))));
    }
}
