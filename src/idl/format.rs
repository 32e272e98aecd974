//! Canonical rendering of interface declarations.
//!
//! The one-line/multi-line split follows an 80 column threshold with two
//! space continuation indent; the built-in `org.varlink.service` text is the
//! reference output.

use std::fmt;

use itertools::Itertools;

use super::{Argument, Interface, Method, Typedef, VEnum, VError, VStruct, VStructOrEnum, VType, VTypeExt};

pub trait Format {
    fn get_oneline(&self) -> String;
    fn get_multiline(&self, indent: usize, max: usize) -> String;
}

impl Format for VTypeExt {
    fn get_oneline(&self) -> String {
        match self {
            VTypeExt::Plain(VType::Bool) => "bool".into(),
            VTypeExt::Plain(VType::Int) => "int".into(),
            VTypeExt::Plain(VType::Float) => "float".into(),
            VTypeExt::Plain(VType::String) => "string".into(),
            VTypeExt::Plain(VType::Object) => "object".into(),
            VTypeExt::Plain(VType::Fd) => "fd".into(),
            VTypeExt::Plain(VType::Typename(v)) => v.clone(),
            VTypeExt::Plain(VType::Struct(v)) => v.get_oneline(),
            VTypeExt::Plain(VType::Enum(v)) => v.get_oneline(),
            VTypeExt::Array(v) => format!("[]{}", v.get_oneline()),
            VTypeExt::Dict(v) => format!("[string]{}", v.get_oneline()),
            VTypeExt::StringSet => "[string]()".into(),
            VTypeExt::Option(v) => format!("?{}", v.get_oneline()),
        }
    }

    fn get_multiline(&self, indent: usize, max: usize) -> String {
        match self {
            VTypeExt::Plain(VType::Struct(v)) => v.get_multiline(indent, max),
            VTypeExt::Plain(VType::Enum(v)) => v.get_multiline(indent, max),
            VTypeExt::Array(v) => format!("[]{}", v.get_multiline(indent, max)),
            VTypeExt::Dict(v) => format!("[string]{}", v.get_multiline(indent, max)),
            VTypeExt::Option(v) => format!("?{}", v.get_multiline(indent, max)),
            other => other.get_oneline(),
        }
    }
}

impl fmt::Display for VTypeExt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.get_oneline())
    }
}

impl Format for VStructOrEnum {
    fn get_oneline(&self) -> String {
        match self {
            VStructOrEnum::VStruct(v) => v.get_oneline(),
            VStructOrEnum::VEnum(v) => v.get_oneline(),
        }
    }

    fn get_multiline(&self, indent: usize, max: usize) -> String {
        match self {
            VStructOrEnum::VStruct(v) => v.get_multiline(indent, max),
            VStructOrEnum::VEnum(v) => v.get_multiline(indent, max),
        }
    }
}

impl Format for Argument {
    fn get_oneline(&self) -> String {
        format!("{}: {}", self.name, self.vtype)
    }

    fn get_multiline(&self, indent: usize, max: usize) -> String {
        format!("{}: {}", self.name, self.vtype.get_multiline(indent, max))
    }
}

impl Format for VStruct {
    fn get_oneline(&self) -> String {
        format!("({})", self.elts.iter().map(Argument::get_oneline).join(", "))
    }

    fn get_multiline(&self, indent: usize, max: usize) -> String {
        let mut f = String::from("(\n");
        let mut iter = self.elts.iter().peekable();
        while let Some(elt) = iter.next() {
            let line = elt.get_oneline();
            if line.len() + indent + 2 < max {
                f += &format!("{:indent$}{}", "", line, indent = indent + 2);
            } else {
                f += &format!(
                    "{:indent$}{}",
                    "",
                    elt.get_multiline(indent + 2, max),
                    indent = indent + 2
                );
            }
            if iter.peek().is_some() {
                f += ",\n";
            }
        }
        f += &format!("\n{:indent$})", "", indent = indent);
        f
    }
}

impl fmt::Display for VStruct {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.get_oneline())
    }
}

impl Format for VEnum {
    fn get_oneline(&self) -> String {
        format!("({})", self.elts.iter().join(", "))
    }

    fn get_multiline(&self, indent: usize, _max: usize) -> String {
        let mut f = String::from("(\n");
        f += &self
            .elts
            .iter()
            .map(|elt| format!("{:indent$}{}", "", elt, indent = indent + 2))
            .join(",\n");
        f += &format!("\n{:indent$})", "", indent = indent);
        f
    }
}

fn doc_lines(doc: &str, indent: usize) -> String {
    if doc.is_empty() {
        return String::new();
    }
    let mut f = String::new();
    for line in doc.split('\n') {
        if line.is_empty() {
            f += &format!("{:indent$}#\n", "", indent = indent);
        } else {
            f += &format!("{:indent$}# {}\n", "", line, indent = indent);
        }
    }
    f
}

fn format_typedef(t: &Typedef, indent: usize, max: usize) -> String {
    let mut f = doc_lines(&t.doc, indent);
    let head = format!("{:indent$}type {} ", "", t.name, indent = indent);
    let elt_line = t.elt.get_oneline();
    if head.len() + elt_line.len() <= max {
        f += &format!("{}{}\n", head, elt_line);
    } else {
        f += &format!("{}{}\n", head, t.elt.get_multiline(indent, max));
    }
    f
}

fn format_method(m: &Method, indent: usize, max: usize) -> String {
    let mut f = doc_lines(&m.doc, indent);
    let m_line = format!("method {}", m.name);
    let m_input = m.input.get_oneline();
    let m_output = m.output.get_oneline();
    let (input, output) = if (m_line.len() + m_input.len() + m_output.len() + 4 <= max)
        || (m_input.len() + m_output.len() == 4)
    {
        (m_input, m_output)
    } else if (m_line.len() + m_input.len() + 6 <= max) || (m_input.len() == 2) {
        (m_input, m.output.get_multiline(indent, max))
    } else if m_output.len() + 7 <= max {
        (m.input.get_multiline(indent, max), m_output)
    } else {
        (
            m.input.get_multiline(indent, max),
            m.output.get_multiline(indent, max),
        )
    };
    f += &format!(
        "{:indent$}method {}{} -> {}\n",
        "",
        m.name,
        input,
        output,
        indent = indent
    );
    f
}

fn format_error(e: &VError, indent: usize, max: usize) -> String {
    let mut f = doc_lines(&e.doc, indent);
    let head = format!("{:indent$}error {} ", "", e.name, indent = indent);
    let parm_line = e.parm.get_oneline();
    if head.len() + parm_line.len() <= max {
        f += &format!("{}{}\n", head, parm_line);
    } else {
        f += &format!("{}{}\n", head, e.parm.get_multiline(indent, max));
    }
    f
}

impl Format for Interface {
    fn get_oneline(&self) -> String {
        self.get_multiline(0, usize::MAX)
    }

    fn get_multiline(&self, indent: usize, max: usize) -> String {
        let mut f = doc_lines(self.doc(), indent);
        f += &format!("{:indent$}interface {}\n", "", self.name(), indent = indent);

        for t in self.typedefs() {
            f += "\n";
            f += &format_typedef(t, indent, max);
        }
        for m in self.methods() {
            f += "\n";
            f += &format_method(m, indent, max);
        }
        for e in self.errors() {
            f += "\n";
            f += &format_error(e, indent, max);
        }
        f
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}
