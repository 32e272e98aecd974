//! Varlink interface declarations.
//!
//! An [`Interface`] is the schema side of the crate: a dotted name plus
//! ordered type, method and error declarations. It is built either
//! programmatically through [`Interface::builder`] or by parsing an
//! interface description with [`Interface::from_description`], and renders
//! deterministically back to the canonical description text.

use std::collections::HashSet;

use crate::error::*;

pub use self::format::Format;

mod format;
mod scan;

/// A plain varlink type.
#[derive(Debug, Clone, PartialEq)]
pub enum VType {
    Bool,
    Int,
    Float,
    String,
    /// Foreign data passed through without conversion.
    Object,
    /// A passed file descriptor. Renders as `fd`, an extension to standard
    /// varlink; on the wire the value is an index into the message's
    /// descriptor array.
    Fd,
    Typename(String),
    Struct(VStruct),
    Enum(VEnum),
}

/// A varlink type with its aggregate decorations.
#[derive(Debug, Clone, PartialEq)]
pub enum VTypeExt {
    Plain(VType),
    Array(Box<VTypeExt>),
    Dict(Box<VTypeExt>),
    /// Set of strings; the wire form is a map with empty-object values and
    /// the description form is `[string]()`.
    StringSet,
    Option(Box<VTypeExt>),
}

impl VTypeExt {
    pub fn array(elt: VTypeExt) -> VTypeExt {
        VTypeExt::Array(Box::new(elt))
    }

    pub fn dict(elt: VTypeExt) -> VTypeExt {
        VTypeExt::Dict(Box::new(elt))
    }

    pub fn option(elt: VTypeExt) -> VTypeExt {
        VTypeExt::Option(Box::new(elt))
    }

    pub fn typename<S: Into<String>>(name: S) -> VTypeExt {
        VTypeExt::Plain(VType::Typename(name.into()))
    }
}

/// A named, typed field of a struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub vtype: VTypeExt,
}

/// An ordered record of named fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VStruct {
    pub elts: Vec<Argument>,
    /// Tolerant structs accept unknown fields on input instead of failing
    /// conversion.
    pub tolerant: bool,
}

impl VStruct {
    pub fn new() -> VStruct {
        VStruct::default()
    }

    pub fn field<S: Into<String>>(mut self, name: S, vtype: VTypeExt) -> VStruct {
        self.elts.push(Argument {
            name: name.into(),
            vtype,
        });
        self
    }

    pub fn tolerant(mut self) -> VStruct {
        self.tolerant = true;
        self
    }

    pub fn get(&self, name: &str) -> Option<&VTypeExt> {
        self.elts
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.vtype)
    }
}

/// A finite set of named symbols.
#[derive(Debug, Clone, PartialEq)]
pub struct VEnum {
    pub elts: Vec<String>,
}

impl VEnum {
    pub fn of<I, S>(symbols: I) -> VEnum
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        VEnum {
            elts: symbols.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VStructOrEnum {
    VStruct(VStruct),
    VEnum(VEnum),
}

/// A named type declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Typedef {
    pub name: String,
    pub doc: String,
    pub elt: VStructOrEnum,
}

impl Typedef {
    pub fn new<S: Into<String>>(name: S, elt: VStructOrEnum) -> Typedef {
        Typedef {
            name: name.into(),
            doc: String::new(),
            elt,
        }
    }

    pub fn doc<S: Into<String>>(mut self, doc: S) -> Typedef {
        self.doc = doc.into();
        self
    }
}

/// A declared error with its parameter record.
#[derive(Debug, Clone, PartialEq)]
pub struct VError {
    pub name: String,
    pub doc: String,
    pub parm: VStruct,
}

impl VError {
    pub fn new<S: Into<String>>(name: S) -> VError {
        VError {
            name: name.into(),
            doc: String::new(),
            parm: VStruct::new(),
        }
    }

    pub fn doc<S: Into<String>>(mut self, doc: S) -> VError {
        self.doc = doc.into();
        self
    }

    pub fn param<S: Into<String>>(mut self, name: S, vtype: VTypeExt) -> VError {
        self.parm = self.parm.field(name, vtype);
        self
    }
}

/// A method declaration: input record, output record and call-mode flags.
///
/// The flags never appear in the rendered description; they constrain which
/// wire call modes the method supports.
#[derive(Debug, Clone, PartialEq)]
pub struct Method {
    pub name: String,
    pub doc: String,
    pub input: VStruct,
    pub output: VStruct,
    pub more: bool,
    pub oneway: bool,
    pub upgrade: bool,
}

impl Method {
    pub fn new<S: Into<String>>(name: S) -> Method {
        Method {
            name: name.into(),
            doc: String::new(),
            input: VStruct::new(),
            output: VStruct::new(),
            more: false,
            oneway: false,
            upgrade: false,
        }
    }

    pub fn doc<S: Into<String>>(mut self, doc: S) -> Method {
        self.doc = doc.into();
        self
    }

    pub fn input<S: Into<String>>(mut self, name: S, vtype: VTypeExt) -> Method {
        self.input = self.input.field(name, vtype);
        self
    }

    pub fn output<S: Into<String>>(mut self, name: S, vtype: VTypeExt) -> Method {
        self.output = self.output.field(name, vtype);
        self
    }

    /// The method may produce a streamed sequence of replies.
    pub fn more(mut self) -> Method {
        self.more = true;
        self
    }

    /// The method never produces a reply.
    pub fn oneway(mut self) -> Method {
        self.oneway = true;
        self
    }

    /// After the first reply the connection is handed to the caller raw.
    pub fn upgrade(mut self) -> Method {
        self.upgrade = true;
        self
    }
}

/// A complete, validated interface declaration.
#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    doc: String,
    typedefs: Vec<Typedef>,
    methods: Vec<Method>,
    errors: Vec<VError>,
    description: String,
}

impl Interface {
    pub fn builder<S: Into<String>>(name: S) -> InterfaceBuilder {
        InterfaceBuilder {
            name: name.into(),
            doc: String::new(),
            typedefs: Vec::new(),
            methods: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Parse an interface description text.
    pub fn from_description(description: &str) -> Result<Interface> {
        scan::parse(description)?.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// The canonical rendered interface description.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }

    pub fn typedef(&self, name: &str) -> Option<&Typedef> {
        self.typedefs.iter().find(|t| t.name == name)
    }

    pub fn typedefs(&self) -> impl Iterator<Item = &Typedef> {
        self.typedefs.iter()
    }

    pub fn error(&self, name: &str) -> Option<&VError> {
        self.errors.iter().find(|e| e.name == name)
    }

    pub fn errors(&self) -> impl Iterator<Item = &VError> {
        self.errors.iter()
    }
}

/// Accumulates declarations and validates them into an [`Interface`].
#[derive(Debug)]
pub struct InterfaceBuilder {
    name: String,
    doc: String,
    typedefs: Vec<Typedef>,
    methods: Vec<Method>,
    errors: Vec<VError>,
}

impl InterfaceBuilder {
    pub fn doc<S: Into<String>>(mut self, doc: S) -> InterfaceBuilder {
        self.doc = doc.into();
        self
    }

    pub fn typedef(mut self, typedef: Typedef) -> InterfaceBuilder {
        self.typedefs.push(typedef);
        self
    }

    pub fn method(mut self, method: Method) -> InterfaceBuilder {
        self.methods.push(method);
        self
    }

    pub fn error(mut self, error: VError) -> InterfaceBuilder {
        self.errors.push(error);
        self
    }

    pub fn build(self) -> Result<Interface> {
        if !is_valid_interface(&self.name) {
            return Err(context!(ErrorKind::Configuration(format!(
                "invalid varlink interface name '{}'",
                self.name
            ))));
        }
        let mut seen = HashSet::new();
        for name in self
            .typedefs
            .iter()
            .map(|t| &t.name)
            .chain(self.methods.iter().map(|m| &m.name))
            .chain(self.errors.iter().map(|e| &e.name))
        {
            if !is_valid_member(name) {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': invalid member name '{}'",
                    self.name, name
                ))));
            }
            if !seen.insert(name.clone()) {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': multiple definitions of '{}'",
                    self.name, name
                ))));
            }
        }
        let typenames: HashSet<&str> = self.typedefs.iter().map(|t| t.name.as_str()).collect();
        for t in &self.typedefs {
            match &t.elt {
                VStructOrEnum::VStruct(s) => check_struct(&self.name, s, &typenames)?,
                VStructOrEnum::VEnum(e) => check_enum(&self.name, e)?,
            }
        }
        for e in &self.errors {
            check_struct(&self.name, &e.parm, &typenames)?;
        }
        for m in &self.methods {
            check_struct(&self.name, &m.input, &typenames)?;
            check_struct(&self.name, &m.output, &typenames)?;
            let flags = [m.more, m.oneway, m.upgrade];
            if flags.iter().filter(|&&f| f).count() > 1 {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': method '{}' combines more, oneway or upgrade",
                    self.name, m.name
                ))));
            }
            if m.oneway && !m.output.elts.is_empty() {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': oneway method '{}' declares output fields",
                    self.name, m.name
                ))));
            }
        }
        let mut interface = Interface {
            name: self.name,
            doc: self.doc,
            typedefs: self.typedefs,
            methods: self.methods,
            errors: self.errors,
            description: String::new(),
        };
        interface.description = interface.get_multiline(0, 80);
        Ok(interface)
    }
}

fn check_enum(iface: &str, e: &VEnum) -> Result<()> {
    if e.elts.is_empty() {
        return Err(context!(ErrorKind::Configuration(format!(
            "interface '{}': enum without symbols",
            iface
        ))));
    }
    let mut seen = HashSet::new();
    for sym in &e.elts {
        if !is_valid_field(sym) || !seen.insert(sym.as_str()) {
            return Err(context!(ErrorKind::Configuration(format!(
                "interface '{}': invalid enum symbol '{}'",
                iface, sym
            ))));
        }
    }
    Ok(())
}

fn check_struct(iface: &str, s: &VStruct, typenames: &HashSet<&str>) -> Result<()> {
    let mut seen = HashSet::new();
    for arg in &s.elts {
        if !is_valid_field(&arg.name) || !seen.insert(arg.name.as_str()) {
            return Err(context!(ErrorKind::Configuration(format!(
                "interface '{}': invalid or duplicate field name '{}'",
                iface, arg.name
            ))));
        }
        check_type(iface, &arg.vtype, typenames)?;
    }
    Ok(())
}

fn check_type(iface: &str, vt: &VTypeExt, typenames: &HashSet<&str>) -> Result<()> {
    match vt {
        VTypeExt::Plain(VType::Typename(name)) => {
            if !typenames.contains(name.as_str()) {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': reference to undefined type '{}'",
                    iface, name
                ))));
            }
            Ok(())
        }
        VTypeExt::Plain(VType::Struct(s)) => check_struct(iface, s, typenames),
        VTypeExt::Plain(VType::Enum(e)) => check_enum(iface, e),
        VTypeExt::Plain(_) | VTypeExt::StringSet => Ok(()),
        VTypeExt::Array(elt) | VTypeExt::Dict(elt) => check_type(iface, elt, typenames),
        VTypeExt::Option(elt) => {
            if matches!(**elt, VTypeExt::Option(_)) {
                return Err(context!(ErrorKind::Configuration(format!(
                    "interface '{}': optional types cannot nest",
                    iface
                ))));
            }
            check_type(iface, elt, typenames)
        }
    }
}

/// Reverse-domain interface name: at least two dot separated segments of
/// letters, digits and interior hyphens, the first starting with a letter.
pub(crate) fn is_valid_interface(name: &str) -> bool {
    let mut segments = name.split('.');
    let Some(first) = segments.next() else {
        return false;
    };
    let mut rest = segments.peekable();
    if rest.peek().is_none() {
        return false;
    }
    segment_ok(first, true) && rest.all(|s| segment_ok(s, false))
}

fn segment_ok(segment: &str, alpha_start: bool) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || (!alpha_start && c.is_ascii_digit()) => {}
        _ => return false,
    }
    !segment.ends_with('-')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Member (method, type, error) name: `[A-Z][A-Za-z0-9]*`.
pub(crate) fn is_valid_member(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Field and enum symbol name: letter first, then letters, digits and
/// underscores.
pub(crate) fn is_valid_field(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
