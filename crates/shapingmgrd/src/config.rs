//! Shaping document loading and shape normalization.
//!
//! The configuration document maps interface names to a shaping spec. For
//! legacy round-trip fidelity the spec may be written as an ordered
//! sequence of single-key mappings:
//!
//! ```yaml
//! eth1:
//!   - type: htb
//!   - default: 13
//!   - classes:
//!       - options: rate 1024kbit
//! ```
//!
//! or as a plain mapping with the same fields. Either shape is normalized
//! here into an ordered association list before it reaches the hierarchy
//! builder; the sequence form rejects duplicate keys.

use serde_yaml::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

use shaping_common::{ShapingError, ShapingResult};

/// An ordered list of (field, value) pairs for one declarative node.
pub type Fields = Vec<(String, Value)>;

/// Loads a shaping document and returns the per-interface specs in
/// document order.
pub fn load_document(path: &Path) -> ShapingResult<Vec<(String, Value)>> {
    let file = File::open(path).map_err(|e| {
        ShapingError::internal(format!("Failed to open shaping document {}: {}", path.display(), e))
    })?;

    let reader = BufReader::new(file);
    let doc: Value = serde_yaml::from_reader(reader).map_err(|e| {
        ShapingError::parse(path.display().to_string(), format!("not valid YAML: {}", e))
    })?;

    let interfaces = document_interfaces(&doc, &path.display().to_string())?;
    info!(
        "Loaded shaping document {}: {} interface(s)",
        path.display(),
        interfaces.len()
    );
    Ok(interfaces)
}

/// Splits a parsed document into its per-interface specs.
pub fn document_interfaces(doc: &Value, path: &str) -> ShapingResult<Vec<(String, Value)>> {
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| ShapingError::parse(path, "document root must be a mapping of interfaces"))?;

    let mut interfaces = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = key.as_str().ok_or_else(|| {
            ShapingError::parse(path, format!("interface name must be a string, got {:?}", key))
        })?;
        interfaces.push((name.to_string(), value.clone()));
    }
    Ok(interfaces)
}

/// Normalizes a declarative node into an ordered association list.
///
/// Accepts either a plain mapping or the legacy ordered sequence of
/// single-key mappings. Duplicate field names are rejected in both shapes.
pub fn normalize_fields(value: &Value, path: &str) -> ShapingResult<Fields> {
    let mut fields = Fields::new();

    match value {
        Value::Mapping(mapping) => {
            for (key, val) in mapping {
                push_field(&mut fields, key, val, path)?;
            }
        }
        Value::Sequence(items) => {
            for (index, item) in items.iter().enumerate() {
                let mapping = item.as_mapping().ok_or_else(|| {
                    ShapingError::parse(
                        format!("{}[{}]", path, index),
                        "expected a single-key mapping",
                    )
                })?;
                if mapping.len() != 1 {
                    return Err(ShapingError::parse(
                        format!("{}[{}]", path, index),
                        format!("expected exactly one key, got {}", mapping.len()),
                    ));
                }
                for (key, val) in mapping {
                    push_field(&mut fields, key, val, path)?;
                }
            }
        }
        other => {
            return Err(ShapingError::parse(
                path,
                format!("expected a mapping or a sequence of single-key mappings, got {}", value_kind(other)),
            ));
        }
    }

    Ok(fields)
}

fn push_field(fields: &mut Fields, key: &Value, val: &Value, path: &str) -> ShapingResult<()> {
    let name = key.as_str().ok_or_else(|| {
        ShapingError::parse(path, format!("field name must be a string, got {:?}", key))
    })?;
    if fields.iter().any(|(existing, _)| existing == name) {
        return Err(ShapingError::parse(
            path,
            format!("duplicate field '{}'", name),
        ));
    }
    fields.push((name.to_string(), val.clone()));
    Ok(())
}

/// Reads a scalar field as a string. YAML scalars that parse as numbers
/// (e.g. `default: 13`) are stringified rather than rejected.
pub fn scalar_str(value: &Value, path: &str) -> ShapingResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ShapingError::parse(
            path,
            format!("expected a scalar, got {}", value_kind(other)),
        )),
    }
}

/// Reads a scalar field as an unsigned integer.
pub fn scalar_u32(value: &Value, path: &str) -> ShapingResult<u32> {
    scalar_str(value, path)?
        .parse()
        .map_err(|_| ShapingError::parse(path, format!("expected an unsigned integer, got {:?}", value)))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
