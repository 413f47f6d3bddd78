//! Payload codecs: typed variable/function values and the describe
//! type-tag normalization.

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

/// Wire types a device variable or function return can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariableType {
    Bool,
    Int32,
    Uint32,
    Double,
    /// The default when the device omits a type
    #[default]
    String,
    Buffer,
}

impl VariableType {
    /// Parse a type name from a describe response; unknown names and
    /// `null` fall back to `String`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "bool" => VariableType::Bool,
            "int32" | "int" => VariableType::Int32,
            "uint32" => VariableType::Uint32,
            "double" => VariableType::Double,
            "buffer" => VariableType::Buffer,
            _ => VariableType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::Bool => "bool",
            VariableType::Int32 => "int32",
            VariableType::Uint32 => "uint32",
            VariableType::Double => "double",
            VariableType::String => "string",
            VariableType::Buffer => "buffer",
        }
    }
}

/// A decoded device value.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceValue {
    Bool(bool),
    Int(i32),
    Uint(u32),
    Double(f64),
    Str(String),
    Buffer(Vec<u8>),
}

/// Decode a payload into a typed result. Integers and doubles are
/// big-endian on the wire.
pub fn from_binary(bytes: &[u8], ty: VariableType) -> Result<DeviceValue> {
    match ty {
        VariableType::Bool => Ok(DeviceValue::Bool(bytes.first().is_some_and(|b| *b != 0))),
        VariableType::Int32 => {
            let raw = fixed::<4>(bytes, "int32")?;
            Ok(DeviceValue::Int(i32::from_be_bytes(raw)))
        }
        VariableType::Uint32 => {
            let raw = fixed::<4>(bytes, "uint32")?;
            Ok(DeviceValue::Uint(u32::from_be_bytes(raw)))
        }
        VariableType::Double => {
            let raw = fixed::<8>(bytes, "double")?;
            Ok(DeviceValue::Double(f64::from_be_bytes(raw)))
        }
        VariableType::String => Ok(DeviceValue::Str(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        VariableType::Buffer => Ok(DeviceValue::Buffer(bytes.to_vec())),
    }
}

/// Encode a typed value to payload bytes (the inverse of [`from_binary`]).
pub fn to_binary(value: &DeviceValue) -> Vec<u8> {
    match value {
        DeviceValue::Bool(b) => vec![*b as u8],
        DeviceValue::Int(i) => i.to_be_bytes().to_vec(),
        DeviceValue::Uint(u) => u.to_be_bytes().to_vec(),
        DeviceValue::Double(d) => d.to_be_bytes().to_vec(),
        DeviceValue::Str(s) => s.as_bytes().to_vec(),
        DeviceValue::Buffer(b) => b.clone(),
    }
}

fn fixed<const N: usize>(bytes: &[u8], ty: &str) -> Result<[u8; N]> {
    if bytes.len() < N {
        return Err(CoreError::Framing(format!(
            "Payload too short for {ty}: {} bytes (need {N})",
            bytes.len()
        )));
    }
    let mut raw = [0u8; N];
    raw.copy_from_slice(&bytes[..N]);
    Ok(raw)
}

/// Normalize integer type tags in a describe variable map.
///
/// Devices report variable types as small integers; the tag set is fixed
/// by the device firmware: 1 bool, 2 int32, 4 string, 5 null, 9 double.
/// String-valued entries pass through unchanged.
pub fn translate_int_types(variables: &Map<String, Value>) -> Map<String, Value> {
    variables
        .iter()
        .map(|(name, tag)| {
            let translated = match tag {
                Value::Number(n) => match n.as_u64() {
                    Some(1) => Value::String("bool".to_string()),
                    Some(2) => Value::String("int32".to_string()),
                    Some(4) => Value::String("string".to_string()),
                    Some(5) => Value::Null,
                    Some(9) => Value::String("double".to_string()),
                    _ => tag.clone(),
                },
                other => other.clone(),
            };
            (name.clone(), translated)
        })
        .collect()
}

/// One function argument slot from the introspected signature:
/// optional name plus a type name.
pub type ArgSpec = Vec<(Option<String>, String)>;

/// Encode function-call arguments per the introspected signature.
///
/// Arguments are validated against their slot type, then joined with
/// commas into the URI-query form the device parses.
pub fn build_arguments(args: &[String], arg_spec: &ArgSpec) -> Result<Vec<u8>> {
    if args.len() > arg_spec.len() {
        return Err(CoreError::MessageParams(format!(
            "Too many arguments: {} given, {} accepted",
            args.len(),
            arg_spec.len()
        )));
    }

    let mut encoded: Vec<&str> = Vec::with_capacity(args.len());
    for (arg, (slot_name, slot_type)) in args.iter().zip(arg_spec.iter()) {
        match slot_type.to_ascii_lowercase().as_str() {
            "int" | "int32" | "uint32" => {
                arg.parse::<i64>().map_err(|_| {
                    CoreError::MessageParams(format!(
                        "Argument {} is not an integer: {arg:?}",
                        slot_name.as_deref().unwrap_or("?")
                    ))
                })?;
            }
            // String-typed slots accept anything
            _ => {}
        }
        encoded.push(arg);
    }

    Ok(encoded.join(",").into_bytes())
}
