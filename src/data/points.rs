use crate::spatial::Point3;
use anyhow::{anyhow, bail, Context};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Load an ordered fiducial list.
///
/// Accepts a JSON array of `[x, y, z]` triples or `{"x", "y", "z"}` objects,
/// or a 3D Slicer markups file (`markups[0].controlPoints[].position`).
pub fn load_points<P: AsRef<Path>>(path: P) -> crate::Result<Vec<Point3>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_points(&content).with_context(|| format!("parsing points from {}", path.display()))
}

pub fn parse_points(content: &str) -> crate::Result<Vec<Point3>> {
    let root: Value = serde_json::from_str(content)?;
    let entries = match &root {
        Value::Array(items) => items,
        Value::Object(map) => map
            .get("markups")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("controlPoints"))
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("Expected a point array or a markups document"))?,
        _ => bail!("Expected a point array or a markups document"),
    };

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let entry = entry.get("position").unwrap_or(entry);
            parse_point(entry).with_context(|| format!("point {}", index))
        })
        .collect()
}

fn parse_point(value: &Value) -> crate::Result<Point3> {
    let coords: Vec<Option<f64>> = match value {
        Value::Array(items) if items.len() == 3 => items.iter().map(Value::as_f64).collect(),
        Value::Object(map) => ["x", "y", "z"]
            .iter()
            .map(|k| map.get(*k).and_then(Value::as_f64))
            .collect(),
        _ => bail!("Expected three coordinates"),
    };
    match coords.as_slice() {
        [Some(x), Some(y), Some(z)] => Ok(Point3::new(*x, *y, *z)),
        _ => Err(anyhow!("Coordinates must be numbers")),
    }
}
