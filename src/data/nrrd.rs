//! Minimal NRRD reader/writer for 3D scalar volumes.
//!
//! Supports attached headers with `raw` and `gzip` encodings and the common
//! integer and floating point sample types. Volumes are always written as
//! little-endian `float`.

use super::Volume;
use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array3;
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl SampleType {
    fn parse(name: &str) -> Result<Self> {
        let t = match name.trim() {
            "signed char" | "int8" | "int8_t" | "char" => Self::I8,
            "uchar" | "unsigned char" | "uint8" | "uint8_t" => Self::U8,
            "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => Self::I16,
            "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => Self::U16,
            "int" | "signed int" | "int32" | "int32_t" => Self::I32,
            "uint" | "unsigned int" | "uint32" | "uint32_t" => Self::U32,
            "float" => Self::F32,
            "double" => Self::F64,
            other => bail!("Unsupported NRRD type: {}", other),
        };
        Ok(t)
    }

    fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    fn decode(self, bytes: &[u8], little_endian: bool) -> f32 {
        macro_rules! read {
            ($ty:ty, $n:expr) => {{
                let mut buf = [0u8; $n];
                buf.copy_from_slice(bytes);
                if little_endian {
                    <$ty>::from_le_bytes(buf)
                } else {
                    <$ty>::from_be_bytes(buf)
                }
            }};
        }
        match self {
            Self::I8 => bytes[0] as i8 as f32,
            Self::U8 => bytes[0] as f32,
            Self::I16 => read!(i16, 2) as f32,
            Self::U16 => read!(u16, 2) as f32,
            Self::I32 => read!(i32, 4) as f32,
            Self::U32 => read!(u32, 4) as f32,
            Self::F32 => read!(f32, 4),
            Self::F64 => read!(f64, 8) as f32,
        }
    }
}

/// Read a 3D NRRD volume.
pub fn read_nrrd<P: AsRef<Path>>(path: P) -> Result<Volume> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_nrrd(&bytes).with_context(|| format!("parsing NRRD file {}", path.display()))
}

fn parse_nrrd(bytes: &[u8]) -> Result<Volume> {
    if !bytes.starts_with(b"NRRD") {
        bail!("Missing NRRD magic");
    }

    // Header ends at the first empty line.
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut offset = 0usize;
    let mut first = true;
    loop {
        let rest = &bytes[offset..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| anyhow!("Unterminated NRRD header"))?;
        let line = std::str::from_utf8(&rest[..end])
            .context("NRRD header is not UTF-8")?
            .trim_end_matches('\r');
        offset += end + 1;

        if first {
            first = false;
            continue;
        }
        if line.is_empty() {
            break;
        }
        // Comments and `key:=value` metadata carry nothing we need.
        if line.starts_with('#') || line.contains(":=") {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let field = |name: &str| fields.get(name).map(String::as_str);

    if field("data file").or(field("datafile")).is_some() {
        bail!("Detached NRRD data files are not supported");
    }

    let dimension: usize = field("dimension")
        .ok_or_else(|| anyhow!("Missing 'dimension' field"))?
        .parse()
        .context("Invalid 'dimension' field")?;
    if dimension != 3 {
        bail!("Only 3D volumes are supported, got dimension {}", dimension);
    }

    let sizes: Vec<usize> = field("sizes")
        .ok_or_else(|| anyhow!("Missing 'sizes' field"))?
        .split_whitespace()
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .context("Invalid 'sizes' field")?;
    if sizes.len() != 3 {
        bail!("Expected 3 sizes, got {}", sizes.len());
    }

    let sample_type = SampleType::parse(field("type").ok_or_else(|| anyhow!("Missing 'type' field"))?)?;
    let little_endian = !matches!(field("endian"), Some("big"));

    let (spacing, direction) = match field("space directions") {
        Some(value) => parse_space_directions(value)?,
        None => {
            let spacing = match field("spacings") {
                Some(value) => parse_triplet(&value.split_whitespace().collect::<Vec<_>>().join(","))?,
                None => [1.0; 3],
            };
            (spacing, [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
        }
    };
    let origin = match field("space origin") {
        Some(value) => parse_triplet(value)?,
        None => [0.0; 3],
    };

    let payload = &bytes[offset..];
    let raw = match field("encoding").unwrap_or("raw") {
        "raw" => payload.to_vec(),
        "gzip" | "gz" => {
            let mut decoded = Vec::new();
            GzDecoder::new(payload)
                .read_to_end(&mut decoded)
                .context("Decompressing gzip payload")?;
            decoded
        }
        other => bail!("Unsupported NRRD encoding: {}", other),
    };

    let expected = sizes
        .iter()
        .try_fold(sample_type.size(), |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| anyhow!("NRRD sizes {:?} overflow the addressable payload", sizes))?;
    if raw.len() < expected {
        bail!("Payload too short: expected {} bytes, got {}", expected, raw.len());
    }
    // Skip any leading bytes before the voxel block.
    let raw = &raw[raw.len() - expected..];

    let values: Vec<f32> = raw
        .chunks_exact(sample_type.size())
        .map(|chunk| sample_type.decode(chunk, little_endian))
        .collect();
    let data = Array3::from_shape_vec((sizes[2], sizes[1], sizes[0]), values)
        .context("Voxel count does not match sizes")?;

    Ok(Volume::new(data, spacing, origin).with_direction(direction))
}

fn parse_triplet(value: &str) -> Result<[f64; 3]> {
    let inner = value.trim().trim_start_matches('(').trim_end_matches(')');
    let parts: Vec<f64> = inner
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Invalid vector '{}'", value))?;
    if parts.len() != 3 {
        bail!("Expected 3 components in '{}'", value);
    }
    Ok([parts[0], parts[1], parts[2]])
}

fn parse_space_directions(value: &str) -> Result<([f64; 3], [[f64; 3]; 3])> {
    let vectors: Vec<&str> = value.split_whitespace().collect();
    if vectors.len() != 3 {
        bail!("Expected 3 space direction vectors, got {}", vectors.len());
    }
    let mut spacing = [0.0; 3];
    let mut direction = [[0.0; 3]; 3];
    for (axis, vector) in vectors.iter().enumerate() {
        let v = parse_triplet(vector)?;
        let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        if norm == 0.0 {
            bail!("Zero-length space direction for axis {}", axis);
        }
        spacing[axis] = norm;
        for row in 0..3 {
            direction[row][axis] = v[row] / norm;
        }
    }
    Ok((spacing, direction))
}

/// Write a volume as a little-endian float NRRD, optionally gzip-compressed.
pub fn write_nrrd<P: AsRef<Path>>(volume: &Volume, path: P, gzip: bool) -> Result<()> {
    let path = path.as_ref();
    let [nx, ny, nz] = volume.dims();
    let spacing = volume.spacing();
    let direction = volume.direction();
    let origin = volume.origin();

    let axis = |c: usize| {
        format!(
            "({},{},{})",
            direction[0][c] * spacing[c],
            direction[1][c] * spacing[c],
            direction[2][c] * spacing[c]
        )
    };

    let mut header = String::new();
    header.push_str("NRRD0004\n");
    header.push_str("# Complete NRRD file format specification at:\n");
    header.push_str("# http://teem.sourceforge.net/nrrd/format.html\n");
    header.push_str("type: float\n");
    header.push_str("dimension: 3\n");
    header.push_str("space: left-posterior-superior\n");
    header.push_str(&format!("sizes: {} {} {}\n", nx, ny, nz));
    header.push_str(&format!("space directions: {} {} {}\n", axis(0), axis(1), axis(2)));
    header.push_str("kinds: domain domain domain\n");
    header.push_str("endian: little\n");
    header.push_str(&format!("encoding: {}\n", if gzip { "gzip" } else { "raw" }));
    header.push_str(&format!("space origin: ({},{},{})\n\n", origin[0], origin[1], origin[2]));

    let mut payload = Vec::with_capacity(volume.len() * 4);
    for value in volume.data().iter() {
        payload.extend_from_slice(&value.to_le_bytes());
    }

    let mut file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    file.write_all(header.as_bytes())?;
    if gzip {
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&payload)?;
        encoder.finish()?;
    } else {
        file.write_all(&payload)?;
    }
    Ok(())
}
