//! Histogram-based mutual information between two volumes.
//!
//! The fixed volume defines the sample grid. The transform maps moving-space
//! points into fixed space, the same direction TRE applies it to moving
//! fiducials, so each fixed voxel center is pulled back through its inverse
//! and the moving volume is sampled there by trilinear interpolation. Samples
//! that fall outside the moving volume are dropped.
//!
//! MI = Σ p(a,b) · ln( p(a,b) / (p(a) · p(b)) ), which equals H(A) + H(B) − H(A,B).

use crate::data::Volume;
use crate::spatial::{Point3, Transform};
use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

const CHUNK: usize = 4096;

/// A synchronous, possibly slow, intensity similarity measure.
pub trait IntensityMetric: Send + Sync {
    /// Similarity of `moving` mapped into `fixed` space. `transform` maps
    /// moving-space points to fixed space; `None` means identity.
    fn evaluate(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: Option<&Transform>,
        mask: Option<&Volume>,
    ) -> Result<f64>;

    /// Short method tag reported alongside the value.
    fn method(&self) -> &str;
}

/// Joint-histogram MI in the style of the Mattes metric.
#[derive(Debug, Clone)]
pub struct HistogramMutualInformation {
    pub bins: usize,
    /// Fraction of fixed voxels sampled, in (0, 1].
    pub sampling_percentage: f64,
    pub seed: u64,
}

impl Default for HistogramMutualInformation {
    fn default() -> Self {
        Self {
            bins: 32,
            sampling_percentage: 1.0,
            seed: 121212,
        }
    }
}

impl HistogramMutualInformation {
    pub fn new(bins: usize, sampling_percentage: f64, seed: u64) -> Self {
        Self {
            bins,
            sampling_percentage,
            seed,
        }
    }

    pub fn from_config(config: &crate::config::EvaluationConfig) -> Self {
        Self::new(config.histogram_bins, config.sampling_percentage, config.random_seed)
    }

    /// Linear voxel indices of the fixed volume that take part in the estimate.
    fn sample_indices(&self, fixed: &Volume, mask: Option<&Volume>) -> Result<Vec<usize>> {
        let dims = fixed.dims();
        let mut indices: Vec<usize> = match mask {
            None => (0..fixed.len()).collect(),
            Some(mask) => {
                let to_mask = mask
                    .world_to_index()
                    .ok_or_else(|| anyhow!("mask geometry is degenerate"))?;
                (0..fixed.len())
                    .filter(|&n| {
                        let (i, j, k) = unravel(n, dims);
                        let p = to_mask.apply(fixed.voxel_center(i, j, k));
                        mask.sample(round(p)).is_some_and(|v| v > 0.0)
                    })
                    .collect()
            }
        };

        if self.sampling_percentage < 1.0 {
            let mut rng = StdRng::seed_from_u64(self.seed);
            indices.retain(|_| rng.gen::<f64>() < self.sampling_percentage);
        }
        Ok(indices)
    }
}

impl IntensityMetric for HistogramMutualInformation {
    fn evaluate(
        &self,
        fixed: &Volume,
        moving: &Volume,
        transform: Option<&Transform>,
        mask: Option<&Volume>,
    ) -> Result<f64> {
        if self.bins < 2 {
            bail!("at least two histogram bins are required");
        }
        if !(self.sampling_percentage > 0.0 && self.sampling_percentage <= 1.0) {
            bail!("sampling percentage must be in (0, 1]");
        }
        if fixed.is_empty() || moving.is_empty() {
            bail!("volumes must not be empty");
        }

        let to_moving_index = moving
            .world_to_index()
            .ok_or_else(|| anyhow!("moving volume geometry is degenerate"))?;
        let fixed_to_moving_index = match transform {
            Some(t) => {
                let pull_back = t
                    .inverse()
                    .ok_or_else(|| anyhow!("transform is not invertible"))?;
                to_moving_index.compose(&pull_back).compose(&fixed.index_to_world())
            }
            None => to_moving_index.compose(&fixed.index_to_world()),
        };

        let indices = self.sample_indices(fixed, mask)?;
        let dims = fixed.dims();

        let pairs: Vec<(f32, f32)> = indices
            .par_iter()
            .filter_map(|&n| {
                let (i, j, k) = unravel(n, dims);
                let p = fixed_to_moving_index.apply(Point3::new(i as f64, j as f64, k as f64));
                moving.sample(p).map(|m| (fixed.value(i, j, k), m))
            })
            .collect();

        if pairs.is_empty() {
            bail!("no overlapping samples between fixed and moving volumes");
        }

        let fixed_range = value_range(pairs.iter().map(|p| p.0));
        let moving_range = value_range(pairs.iter().map(|p| p.1));
        let bins = self.bins;

        let joint = pairs
            .par_chunks(CHUNK)
            .fold(
                || vec![0u64; bins * bins],
                |mut hist, chunk| {
                    for &(f, m) in chunk {
                        let a = bin_of(f, fixed_range, bins);
                        let b = bin_of(m, moving_range, bins);
                        hist[a * bins + b] += 1;
                    }
                    hist
                },
            )
            .reduce(
                || vec![0u64; bins * bins],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        Ok(mutual_information(&joint, bins))
    }

    fn method(&self) -> &str {
        "Mattes"
    }
}

/// MI of a `bins x bins` joint count histogram (row = fixed bin).
pub fn mutual_information(joint: &[u64], bins: usize) -> f64 {
    let total: u64 = joint.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;

    let mut p_fixed = vec![0.0; bins];
    let mut p_moving = vec![0.0; bins];
    for a in 0..bins {
        for b in 0..bins {
            let p = joint[a * bins + b] as f64 / total;
            p_fixed[a] += p;
            p_moving[b] += p;
        }
    }

    let mut mi = 0.0;
    for a in 0..bins {
        for b in 0..bins {
            let p = joint[a * bins + b] as f64 / total;
            if p > 0.0 {
                mi += p * (p / (p_fixed[a] * p_moving[b])).ln();
            }
        }
    }
    mi.max(0.0)
}

fn unravel(n: usize, dims: [usize; 3]) -> (usize, usize, usize) {
    let i = n % dims[0];
    let j = (n / dims[0]) % dims[1];
    let k = n / (dims[0] * dims[1]);
    (i, j, k)
}

fn round(p: Point3) -> Point3 {
    Point3::new(p.x.round(), p.y.round(), p.z.round())
}

fn value_range(values: impl Iterator<Item = f32>) -> (f32, f32) {
    values.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

fn bin_of(value: f32, (lo, hi): (f32, f32), bins: usize) -> usize {
    if hi <= lo {
        return 0;
    }
    let t = ((value - lo) / (hi - lo)) as f64;
    ((t * bins as f64) as usize).min(bins - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient() -> Volume {
        Volume::from_fn([16, 12, 8], [1.0; 3], [0.0; 3], |i, j, k| (i * 3 + (j * 7 % 5) + k) as f32)
    }

    fn noise(seed: u64) -> Volume {
        let mut rng = StdRng::seed_from_u64(seed);
        Volume::from_fn([16, 12, 8], [1.0; 3], [0.0; 3], |_, _, _| rng.gen::<f32>())
    }

    #[test]
    fn test_identical_volumes_score_higher_than_noise() {
        let metric = HistogramMutualInformation::default();
        let fixed = gradient();
        let same = metric.evaluate(&fixed, &fixed, None, None).unwrap();
        let unrelated = metric.evaluate(&fixed, &noise(7), None, None).unwrap();
        assert!(same > 0.5, "self MI {same}");
        assert!(same > unrelated * 2.0, "self {same} vs noise {unrelated}");
    }

    fn pattern(shift: i64) -> Volume {
        Volume::from_fn([16, 12, 8], [1.0; 3], [0.0; 3], |i, j, k| {
            let i = i as i64 - shift;
            let (j, k) = (j as i64, k as i64);
            (i * i * 7 + j * 3 + k * k * 5).rem_euclid(11) as f32
        })
    }

    #[test]
    fn test_translation_recovers_alignment() {
        // moving(i) = fixed(i - 2): a moving point at x maps to fixed x - 2
        let metric = HistogramMutualInformation::default();
        let fixed = pattern(0);
        let moving = pattern(2);
        let to_fixed = Transform::translation([-2.0, 0.0, 0.0]);
        let misaligned = metric.evaluate(&fixed, &moving, None, None).unwrap();
        let aligned = metric.evaluate(&fixed, &moving, Some(&to_fixed), None).unwrap();
        let reversed = metric
            .evaluate(&fixed, &moving, Some(&Transform::translation([2.0, 0.0, 0.0])), None)
            .unwrap();
        assert!(aligned > misaligned, "aligned {aligned} vs misaligned {misaligned}");
        assert!(aligned > reversed, "aligned {aligned} vs reversed {reversed}");
    }

    #[test]
    fn test_transform_zeroing_tre_maximises_mi() {
        let fixed = pattern(0);
        let moving = pattern(2);
        let fixed_points: Vec<Point3> = [(3.0, 4.0, 2.0), (10.0, 1.0, 5.0), (6.0, 9.0, 0.0)]
            .iter()
            .map(|&(x, y, z)| Point3::new(x, y, z))
            .collect();
        let moving_points: Vec<Point3> = fixed_points.iter().map(|p| Point3::new(p.x + 2.0, p.y, p.z)).collect();

        let candidates = [
            Transform::identity(),
            Transform::translation([-2.0, 0.0, 0.0]),
            Transform::translation([2.0, 0.0, 0.0]),
        ];
        let best_tre = candidates
            .iter()
            .min_by(|a, b| {
                let ta = crate::analysis::compute_tre(&fixed_points, &moving_points, Some(a)).unwrap().mean;
                let tb = crate::analysis::compute_tre(&fixed_points, &moving_points, Some(b)).unwrap().mean;
                ta.total_cmp(&tb)
            })
            .unwrap();
        let metric = HistogramMutualInformation::default();
        let best_mi = candidates
            .iter()
            .max_by(|a, b| {
                let ma = metric.evaluate(&fixed, &moving, Some(a), None).unwrap();
                let mb = metric.evaluate(&fixed, &moving, Some(b), None).unwrap();
                ma.total_cmp(&mb)
            })
            .unwrap();
        assert_eq!(best_tre, best_mi);
        assert_eq!(best_mi.offset(), [-2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_singular_transform_is_an_error() {
        let metric = HistogramMutualInformation::default();
        let fixed = pattern(0);
        let flat = Transform::from_linear_offset(
            [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]],
            [0.0; 3],
            crate::spatial::TransformType::Affine,
        );
        let err = metric.evaluate(&fixed, &fixed, Some(&flat), None).unwrap_err();
        assert!(err.to_string().contains("not invertible"));
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let metric = HistogramMutualInformation::new(16, 0.3, 42);
        let fixed = gradient();
        let moving = noise(3);
        let a = metric.evaluate(&fixed, &moving, None, None).unwrap();
        let b = metric.evaluate(&fixed, &moving, None, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_mask_has_no_samples() {
        let metric = HistogramMutualInformation::default();
        let fixed = gradient();
        let mask = Volume::from_fn([16, 12, 8], [1.0; 3], [0.0; 3], |_, _, _| 0.0);
        let err = metric.evaluate(&fixed, &fixed, None, Some(&mask)).unwrap_err();
        assert!(err.to_string().contains("no overlapping samples"));
    }

    #[test]
    fn test_no_overlap_is_an_error() {
        let metric = HistogramMutualInformation::default();
        let fixed = gradient();
        let far = Transform::translation([1000.0, 0.0, 0.0]);
        assert!(metric.evaluate(&fixed, &fixed, Some(&far), None).is_err());
    }

    #[test]
    fn test_mutual_information_of_independent_histogram_is_zero() {
        // p(a,b) = p(a)p(b)
        let joint = vec![1, 1, 1, 1];
        assert!(mutual_information(&joint, 2).abs() < 1e-12);
        // perfectly dependent: ln 2
        let joint = vec![5, 0, 0, 5];
        assert!((mutual_information(&joint, 2) - 2f64.ln()).abs() < 1e-12);
    }
}
