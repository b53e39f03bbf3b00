//! Transform files: ITK text format (`.tfm`, `.txt`), JSON, and with the
//! `hdf5` feature the ITK HDF5 format (`.h5`).
//!
//! Reading understands the linear ITK transform kinds a registration engine
//! typically emits, including composite files whose entries are applied from
//! last to first. Writing always produces a single `AffineTransform`.

use crate::spatial::{Transform, TransformType};
use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::Path;

const ITK_HEADER: &str = "#Insight Transform File V1.0";

/// Read a transform file, dispatching on the extension.
pub fn read_transform_file<P: AsRef<Path>>(path: P) -> Result<Option<Transform>> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "h5" | "hdf5" => read_itk_hdf5(path),
        "mat" => bail!("MATLAB transform files ({}) are not supported", path.display()),
        "json" => {
            let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let transform: Transform =
                serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(transform))
        }
        _ => {
            let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            parse_itk_text(&content).with_context(|| format!("parsing ITK transform file {}", path.display()))
        }
    }
}

/// Whether [`read_transform_file`] can decode files with this extension in this build.
pub fn is_readable_transform_file(path: &Path) -> bool {
    match extension(path).as_str() {
        "h5" | "hdf5" => cfg!(feature = "hdf5"),
        "mat" => false,
        _ => true,
    }
}

/// Write a transform file; `.json` is written with serde, anything else as ITK text.
pub fn write_transform_file<P: AsRef<Path>>(transform: &Transform, path: P) -> Result<()> {
    let path = path.as_ref();
    let content = if extension(path) == "json" {
        serde_json::to_string_pretty(transform)?
    } else {
        to_itk_text(transform)
    };
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Serialize as an ITK `AffineTransform_double_3_3` with a zero center.
pub fn to_itk_text(transform: &Transform) -> String {
    let linear = transform.linear();
    let offset = transform.offset();
    let mut params: Vec<String> = linear.iter().flatten().map(|v| v.to_string()).collect();
    params.extend(offset.iter().map(|v| v.to_string()));
    format!(
        "{}\n#Transform 0\nTransform: AffineTransform_double_3_3\nParameters: {}\nFixedParameters: 0 0 0\n",
        ITK_HEADER,
        params.join(" ")
    )
}

#[derive(Debug, Default)]
struct Block {
    kind: String,
    parameters: Vec<f64>,
    fixed: Vec<f64>,
}

/// Parse ITK text; `Ok(None)` when the file holds no transform entries.
pub fn parse_itk_text(content: &str) -> Result<Option<Transform>> {
    let mut blocks: Vec<Block> = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("Unexpected line '{}'", line))?;
        let value = value.trim();
        match key.trim() {
            "Transform" => blocks.push(Block {
                kind: value.to_string(),
                ..Block::default()
            }),
            "Parameters" => current(&mut blocks)?.parameters = parse_numbers(value)?,
            "FixedParameters" => current(&mut blocks)?.fixed = parse_numbers(value)?,
            other => bail!("Unknown key '{}'", other),
        }
    }

    combine(&blocks)
}

/// Reduce transform entries to one transform; composite headers carry no parameters.
fn combine(blocks: &[Block]) -> Result<Option<Transform>> {
    let transforms: Vec<Transform> = blocks
        .iter()
        .filter(|b| !b.kind.starts_with("CompositeTransform"))
        .map(block_to_transform)
        .collect::<Result<_>>()?;

    // Composite entries are applied back to front: T = T0 ∘ T1 ∘ ... ∘ Tn
    Ok(transforms.into_iter().reduce(|outer, inner| outer.compose(&inner)))
}

#[cfg(not(feature = "hdf5"))]
fn read_itk_hdf5(path: &Path) -> Result<Option<Transform>> {
    bail!(
        "Reading HDF5 transform files ({}) requires building with the `hdf5` feature",
        path.display()
    )
}

/// ITK HDF5 layout: `/TransformGroup/<n>/{TransformType, TransformParameters, TransformFixedParameters}`.
#[cfg(feature = "hdf5")]
fn read_itk_hdf5(path: &Path) -> Result<Option<Transform>> {
    let file = hdf5::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let group = file
        .group("TransformGroup")
        .with_context(|| format!("{} has no TransformGroup", path.display()))?;
    let mut entries = group.member_names()?;
    entries.sort_by_key(|name| name.parse::<usize>().unwrap_or(usize::MAX));

    let mut blocks = Vec::with_capacity(entries.len());
    for name in entries {
        let entry = group.group(&name)?;
        blocks.push(Block {
            kind: read_hdf5_string(&entry.dataset("TransformType")?)?,
            parameters: read_hdf5_values(&entry, "TransformParameters")?,
            fixed: read_hdf5_values(&entry, "TransformFixedParameters")?,
        });
    }
    combine(&blocks).with_context(|| format!("parsing ITK HDF5 transform file {}", path.display()))
}

#[cfg(feature = "hdf5")]
fn read_hdf5_values(entry: &hdf5::Group, name: &str) -> Result<Vec<f64>> {
    if !entry.link_exists(name) {
        return Ok(Vec::new());
    }
    Ok(entry.dataset(name)?.read_raw::<f64>()?)
}

#[cfg(feature = "hdf5")]
fn read_hdf5_string(dataset: &hdf5::Dataset) -> Result<String> {
    use hdf5::types::{VarLenAscii, VarLenUnicode};
    if let Ok(values) = dataset.read_raw::<VarLenAscii>() {
        if let Some(value) = values.first() {
            return Ok(value.as_str().to_string());
        }
    }
    let values = dataset.read_raw::<VarLenUnicode>()?;
    values
        .first()
        .map(|value| value.as_str().to_string())
        .ok_or_else(|| anyhow!("empty TransformType"))
}

fn current(blocks: &mut [Block]) -> Result<&mut Block> {
    blocks
        .last_mut()
        .ok_or_else(|| anyhow!("Parameters found before any 'Transform:' line"))
}

fn parse_numbers(value: &str) -> Result<Vec<f64>> {
    value
        .split_whitespace()
        .map(|s| s.parse::<f64>().with_context(|| format!("Invalid number '{}'", s)))
        .collect()
}

fn block_to_transform(block: &Block) -> Result<Transform> {
    let base = block.kind.split('_').next().unwrap_or_default();
    if !block.kind.ends_with("_3_3") && !block.kind.ends_with("_3") {
        bail!("Only 3D transforms are supported, got '{}'", block.kind);
    }
    let p = &block.parameters;
    let center = fixed_center(&block.fixed);
    let expect = |n: usize| -> Result<()> {
        if p.len() != n {
            bail!("{} expects {} parameters, got {}", base, n, p.len());
        }
        Ok(())
    };

    let transform = match base {
        "AffineTransform" | "MatrixOffsetTransformBase" | "ScalableAffineTransform" => {
            expect(12)?;
            let linear = [[p[0], p[1], p[2]], [p[3], p[4], p[5]], [p[6], p[7], p[8]]];
            Transform::from_centered(linear, [p[9], p[10], p[11]], center, TransformType::Affine)
        }
        "Euler3DTransform" => {
            expect(6)?;
            let compute_zyx = block.fixed.get(3).copied().unwrap_or(0.0) != 0.0;
            if compute_zyx {
                euler_zyx([p[0], p[1], p[2]], [p[3], p[4], p[5]], center)
            } else {
                Transform::from_euler_zxy([p[0], p[1], p[2]], [p[3], p[4], p[5]], center)
            }
        }
        "VersorRigid3DTransform" => {
            expect(6)?;
            let linear = versor_matrix([p[0], p[1], p[2]])?;
            Transform::from_centered(linear, [p[3], p[4], p[5]], center, TransformType::Rigid)
        }
        "TranslationTransform" => {
            expect(3)?;
            Transform::translation([p[0], p[1], p[2]])
        }
        "IdentityTransform" => Transform::identity(),
        other => bail!("Unsupported transform kind '{}'", other),
    };

    if !transform.is_finite() {
        bail!("{} contains non-finite values", base);
    }
    Ok(transform)
}

fn fixed_center(fixed: &[f64]) -> [f64; 3] {
    if fixed.len() >= 3 {
        [fixed[0], fixed[1], fixed[2]]
    } else {
        [0.0; 3]
    }
}

fn euler_zyx(angles: [f64; 3], translation: [f64; 3], center: [f64; 3]) -> Transform {
    let (sx, cx) = angles[0].sin_cos();
    let (sy, cy) = angles[1].sin_cos();
    let (sz, cz) = angles[2].sin_cos();
    // Rz * Ry * Rx
    let linear = [
        [cz * cy, cz * sy * sx - sz * cx, cz * sy * cx + sz * sx],
        [sz * cy, sz * sy * sx + cz * cx, sz * sy * cx - cz * sx],
        [-sy, cy * sx, cy * cx],
    ];
    Transform::from_centered(linear, translation, center, TransformType::Rigid)
}

fn versor_matrix(v: [f64; 3]) -> Result<[[f64; 3]; 3]> {
    let norm2 = v[0] * v[0] + v[1] * v[1] + v[2] * v[2];
    if norm2 > 1.0 + 1e-9 {
        bail!("Versor right part has norm > 1");
    }
    let w = (1.0 - norm2).max(0.0).sqrt();
    let (x, y, z) = (v[0], v[1], v[2]);
    Ok([
        [1.0 - 2.0 * (y * y + z * z), 2.0 * (x * y - z * w), 2.0 * (x * z + y * w)],
        [2.0 * (x * y + z * w), 1.0 - 2.0 * (x * x + z * z), 2.0 * (y * z - x * w)],
        [2.0 * (x * z - y * w), 2.0 * (y * z + x * w), 1.0 - 2.0 * (x * x + y * y)],
    ])
}
