//! Conversion between native parameter values and their wire representation.
//!
//! Conversions are driven by the interface declaration, not by the value:
//! each [`VTypeExt`] knows how to turn a native `serde_json::Value` into its
//! wire form and back. The two forms differ only for descriptor-typed
//! fields, which natively carry the raw descriptor number and on the wire an
//! index into the message's descriptor array, and for optional struct
//! fields, which are omitted from canonical wire output.

use std::fmt;
use std::os::fd::RawFd;

use serde_json::{Map, Number, Value};

use crate::fdarray::FileDescriptorArray;
use crate::idl::{Interface, VStruct, VStructOrEnum, VType, VTypeExt};

/// A failure to convert a value from or to its wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionError {
    location: Vec<Location>,
    message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Location {
    Field(String),
    Index(usize),
}

impl ConversionError {
    fn new<S: Into<String>>(message: S) -> Self {
        ConversionError {
            location: Vec::new(),
            message: message.into(),
        }
    }

    fn expected(what: &str, got: &Value) -> Self {
        ConversionError::new(format!("expected {}, but got {}", what, value_kind(got)))
    }

    fn in_field(mut self, name: &str) -> Self {
        self.location.insert(0, Location::Field(name.to_string()));
        self
    }

    fn at_index(mut self, index: usize) -> Self {
        self.location.insert(0, Location::Index(index));
        self
    }

    /// The outermost field the error occurred in, as reported in
    /// `org.varlink.service.InvalidParameter` replies.
    pub fn parameter(&self) -> String {
        match self.location.first() {
            Some(Location::Field(name)) => name.clone(),
            _ => "parameters".to_string(),
        }
    }
}

impl fmt::Display for ConversionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, loc) in self.location.iter().enumerate() {
            match loc {
                Location::Field(name) if i == 0 => write!(f, "{}", name)?,
                Location::Field(name) => write!(f, ".{}", name)?,
                Location::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        if self.location.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, ": {}", self.message)
        }
    }
}

impl std::error::Error for ConversionError {}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Raw descriptors referenced by an outgoing value, in index order.
#[derive(Debug, Default)]
pub struct OutDescriptors {
    fds: Vec<RawFd>,
}

impl OutDescriptors {
    pub fn new() -> Self {
        OutDescriptors::default()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn as_raw(&self) -> &[RawFd] {
        &self.fds
    }

    fn push(&mut self, fd: RawFd) -> usize {
        self.fds.push(fd);
        self.fds.len() - 1
    }
}

type ConvResult = std::result::Result<Value, ConversionError>;

impl VTypeExt {
    /// Convert a native value to its wire form, collecting referenced
    /// descriptors into `out`.
    pub fn to_wire(&self, value: &Value, interface: &Interface, out: &mut OutDescriptors) -> ConvResult {
        match self {
            VTypeExt::Plain(plain) => plain_to_wire(plain, value, interface, out),
            VTypeExt::Array(elt) => {
                let Value::Array(items) = value else {
                    return Err(ConversionError::expected("array", value));
                };
                let mut result = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    result.push(elt.to_wire(item, interface, out).map_err(|e| e.at_index(i))?);
                }
                Ok(Value::Array(result))
            }
            VTypeExt::Dict(elt) => {
                let Value::Object(entries) = value else {
                    return Err(ConversionError::expected("map", value));
                };
                let mut result = Map::new();
                for (key, item) in entries {
                    let converted = elt
                        .to_wire(item, interface, out)
                        .map_err(|e| e.in_field(key))?;
                    result.insert(key.clone(), converted);
                }
                Ok(Value::Object(result))
            }
            VTypeExt::StringSet => string_set(value),
            VTypeExt::Option(elt) => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    elt.to_wire(value, interface, out)
                }
            }
        }
    }

    /// Convert a wire value to its native form, resolving descriptor
    /// indices against `fds`.
    pub fn from_wire(
        &self,
        value: &Value,
        interface: &Interface,
        fds: Option<&FileDescriptorArray>,
    ) -> ConvResult {
        match self {
            VTypeExt::Plain(plain) => plain_from_wire(plain, value, interface, fds),
            VTypeExt::Array(elt) => {
                let Value::Array(items) = value else {
                    return Err(ConversionError::expected("array", value));
                };
                let mut result = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    result.push(
                        elt.from_wire(item, interface, fds)
                            .map_err(|e| e.at_index(i))?,
                    );
                }
                Ok(Value::Array(result))
            }
            VTypeExt::Dict(elt) => {
                let Value::Object(entries) = value else {
                    return Err(ConversionError::expected("map", value));
                };
                let mut result = Map::new();
                for (key, item) in entries {
                    let converted = elt
                        .from_wire(item, interface, fds)
                        .map_err(|e| e.in_field(key))?;
                    result.insert(key.clone(), converted);
                }
                Ok(Value::Object(result))
            }
            VTypeExt::StringSet => string_set(value),
            VTypeExt::Option(elt) => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    elt.from_wire(value, interface, fds)
                }
            }
        }
    }
}

fn plain_to_wire(
    plain: &VType,
    value: &Value,
    interface: &Interface,
    out: &mut OutDescriptors,
) -> ConvResult {
    match plain {
        VType::Bool | VType::Int | VType::Float | VType::String => {
            simple_value(plain, value)
        }
        VType::Object => Ok(value.clone()),
        VType::Fd => {
            let raw = value
                .as_i64()
                .filter(|&fd| fd >= 0 && fd <= RawFd::MAX as i64)
                .ok_or_else(|| ConversionError::expected("a file descriptor", value))?;
            let index = out.push(raw as RawFd);
            Ok(Value::Number(Number::from(index)))
        }
        VType::Typename(name) => {
            let elt = resolve(interface, name)?;
            match elt {
                VStructOrEnum::VStruct(s) => s.to_wire(value, interface, out),
                VStructOrEnum::VEnum(e) => enum_value(&e.elts, value),
            }
        }
        VType::Struct(s) => s.to_wire(value, interface, out),
        VType::Enum(e) => enum_value(&e.elts, value),
    }
}

fn plain_from_wire(
    plain: &VType,
    value: &Value,
    interface: &Interface,
    fds: Option<&FileDescriptorArray>,
) -> ConvResult {
    match plain {
        VType::Bool | VType::Int | VType::Float | VType::String => {
            simple_value(plain, value)
        }
        VType::Object => Ok(value.clone()),
        VType::Fd => {
            let index = value
                .as_u64()
                .ok_or_else(|| ConversionError::expected("a descriptor index", value))?;
            let Some(fds) = fds else {
                return Err(ConversionError::new(
                    "cannot resolve a file descriptor without a descriptor array",
                ));
            };
            let raw = fds.raw(index as usize).ok_or_else(|| {
                ConversionError::new(format!(
                    "descriptor index {} out of bounds for an array of {}",
                    index,
                    fds.len()
                ))
            })?;
            Ok(Value::Number(Number::from(raw)))
        }
        VType::Typename(name) => {
            let elt = resolve(interface, name)?;
            match elt {
                VStructOrEnum::VStruct(s) => s.from_wire(value, interface, fds),
                VStructOrEnum::VEnum(e) => enum_value(&e.elts, value),
            }
        }
        VType::Struct(s) => s.from_wire(value, interface, fds),
        VType::Enum(e) => enum_value(&e.elts, value),
    }
}

fn simple_value(plain: &VType, value: &Value) -> ConvResult {
    match plain {
        VType::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            _ => Err(ConversionError::expected("bool", value)),
        },
        VType::Int => match value.as_i64() {
            Some(v) => Ok(Value::Number(Number::from(v))),
            None => Err(ConversionError::expected("int", value)),
        },
        VType::Float => match value {
            // ints convert to float, like the schema promises
            Value::Number(n) => match n.as_f64().and_then(Number::from_f64) {
                Some(v) => Ok(Value::Number(v)),
                None => Err(ConversionError::expected("float", value)),
            },
            _ => Err(ConversionError::expected("float", value)),
        },
        VType::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(ConversionError::expected("string", value)),
        },
        _ => unreachable!("simple_value is only called for primitives"),
    }
}

fn enum_value(symbols: &[String], value: &Value) -> ConvResult {
    let Value::String(symbol) = value else {
        return Err(ConversionError::expected("an enum symbol", value));
    };
    if symbols.iter().any(|s| s == symbol) {
        Ok(value.clone())
    } else {
        Err(ConversionError::new(format!(
            "enum value '{}' not one of ({})",
            symbol,
            symbols.join(", ")
        )))
    }
}

fn string_set(value: &Value) -> ConvResult {
    let Value::Object(entries) = value else {
        return Err(ConversionError::expected("a set of strings", value));
    };
    let mut result = Map::new();
    for (key, item) in entries {
        match item {
            Value::Object(inner) if inner.is_empty() => {
                result.insert(key.clone(), Value::Object(Map::new()));
            }
            other => {
                return Err(ConversionError::expected("an empty object", other).in_field(key))
            }
        }
    }
    Ok(Value::Object(result))
}

fn resolve<'a>(
    interface: &'a Interface,
    name: &str,
) -> std::result::Result<&'a VStructOrEnum, ConversionError> {
    interface
        .typedef(name)
        .map(|t| &t.elt)
        .ok_or_else(|| ConversionError::new(format!("undefined type '{}'", name)))
}

impl VStruct {
    /// Convert a native record. Optional fields that are absent or null are
    /// omitted from the wire form.
    pub fn to_wire(&self, value: &Value, interface: &Interface, out: &mut OutDescriptors) -> ConvResult {
        self.record(value, &mut |vtype, v| vtype.to_wire(v, interface, out))
    }

    /// Convert a wire record back to native form. Optional fields may be
    /// absent or null; unknown fields fail unless the struct is tolerant.
    pub fn from_wire(
        &self,
        value: &Value,
        interface: &Interface,
        fds: Option<&FileDescriptorArray>,
    ) -> ConvResult {
        self.record(value, &mut |vtype, v| vtype.from_wire(v, interface, fds))
    }

    fn record(
        &self,
        value: &Value,
        convert: &mut dyn FnMut(&VTypeExt, &Value) -> ConvResult,
    ) -> ConvResult {
        let Value::Object(entries) = value else {
            return Err(ConversionError::expected("a record", value));
        };
        let mut result = Map::new();
        for arg in &self.elts {
            let entry = entries.get(&arg.name);
            match (&arg.vtype, entry) {
                (VTypeExt::Option(_), None) | (VTypeExt::Option(_), Some(Value::Null)) => {}
                (_, None) => {
                    return Err(ConversionError::new(format!(
                        "missing required field '{}'",
                        arg.name
                    )));
                }
                (vtype, Some(v)) => {
                    let converted = convert(vtype, v).map_err(|e| e.in_field(&arg.name))?;
                    result.insert(arg.name.clone(), converted);
                }
            }
        }
        if !self.tolerant {
            for key in entries.keys() {
                if self.get(key).is_none() {
                    return Err(ConversionError::new(format!("unknown field '{}'", key)));
                }
            }
        }
        Ok(Value::Object(result))
    }
}
