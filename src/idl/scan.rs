//! Hand written scanner for the varlink interface description format.
//!
//! Covers the surface the renderer in [`super::format`] produces: an
//! interface header followed by `type`, `method` and `error` declarations
//! with `#` doc comments attached to the declaration they precede.

use crate::error::*;

use super::{
    Argument, InterfaceBuilder, Method, Typedef, VEnum, VError, VStruct, VStructOrEnum, VType,
    VTypeExt,
};

pub(super) fn parse(src: &str) -> Result<InterfaceBuilder> {
    Parser { src, pos: 0 }.interface()
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail<T>(&self, msg: &str) -> Result<T> {
        let consumed = &self.src[..self.pos];
        let line = consumed.matches('\n').count() + 1;
        let column = consumed
            .rsplit_once('\n')
            .map(|(_, tail)| tail.len())
            .unwrap_or(consumed.len())
            + 1;
        Err(context!(ErrorKind::IdlParse(format!(
            "{} at line {}, column {}",
            msg, line, column
        ))))
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Consume doc comment lines (and surrounding blank lines) preceding a
    /// declaration, returning the comment text without the `#` markers.
    fn take_doc(&mut self) -> String {
        let mut lines: Vec<&str> = Vec::new();
        loop {
            self.skip_space();
            if self.peek() != Some('#') {
                break;
            }
            let line = self.rest().split('\n').next().unwrap_or(self.rest());
            self.pos += line.len();
            let line = line
                .strip_prefix("# ")
                .or_else(|| line.strip_prefix('#'))
                .unwrap_or("");
            lines.push(line.trim_end());
        }
        lines.join("\n")
    }

    fn word(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        if len == 0 {
            return self.fail("expected a name");
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn dotted_name(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '.'))
            .unwrap_or(rest.len());
        if len == 0 {
            return self.fail("expected an interface name");
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn interface(&mut self) -> Result<InterfaceBuilder> {
        let doc = self.take_doc();
        self.skip_space();
        if !self.eat("interface") {
            return self.fail("expected 'interface'");
        }
        self.skip_space();
        let name = self.dotted_name()?;
        let mut builder = super::Interface::builder(name).doc(doc);
        loop {
            let doc = self.take_doc();
            self.skip_space();
            if self.rest().is_empty() {
                break;
            }
            if self.eat("type") {
                self.skip_space();
                let name = self.word()?;
                self.skip_space();
                let elt = self.struct_or_enum()?;
                builder = builder.typedef(Typedef {
                    name: name.into(),
                    doc,
                    elt,
                });
            } else if self.eat("method") {
                self.skip_space();
                let name = self.word()?;
                self.skip_space();
                let input = self.struct_only()?;
                self.skip_space();
                if !self.eat("->") {
                    return self.fail("expected '->'");
                }
                self.skip_space();
                let output = self.struct_only()?;
                builder = builder.method(Method {
                    name: name.into(),
                    doc,
                    input,
                    output,
                    more: false,
                    oneway: false,
                    upgrade: false,
                });
            } else if self.eat("error") {
                self.skip_space();
                let name = self.word()?;
                self.skip_space();
                let parm = self.struct_only()?;
                builder = builder.error(VError {
                    name: name.into(),
                    doc,
                    parm,
                });
            } else {
                return self.fail("expected 'type', 'method' or 'error'");
            }
        }
        Ok(builder)
    }

    fn struct_only(&mut self) -> Result<VStruct> {
        match self.struct_or_enum()? {
            VStructOrEnum::VStruct(s) => Ok(s),
            VStructOrEnum::VEnum(_) => self.fail("expected a parameter record, found an enum"),
        }
    }

    fn struct_or_enum(&mut self) -> Result<VStructOrEnum> {
        if !self.eat("(") {
            return self.fail("expected '('");
        }
        self.skip_space();
        if self.eat(")") {
            return Ok(VStructOrEnum::VStruct(VStruct::new()));
        }
        let first = self.word()?.to_string();
        self.skip_space();
        if self.eat(":") {
            let mut elts = vec![Argument {
                name: first,
                vtype: self.vtype()?,
            }];
            loop {
                self.skip_space();
                if self.eat(",") {
                    self.skip_space();
                    let name = self.word()?.to_string();
                    self.skip_space();
                    if !self.eat(":") {
                        return self.fail("expected ':'");
                    }
                    elts.push(Argument {
                        name,
                        vtype: self.vtype()?,
                    });
                } else if self.eat(")") {
                    return Ok(VStructOrEnum::VStruct(VStruct {
                        elts,
                        tolerant: false,
                    }));
                } else {
                    return self.fail("expected ',' or ')'");
                }
            }
        }
        let mut elts = vec![first];
        loop {
            self.skip_space();
            if self.eat(",") {
                self.skip_space();
                elts.push(self.word()?.to_string());
            } else if self.eat(")") {
                return Ok(VStructOrEnum::VEnum(VEnum { elts }));
            } else {
                return self.fail("expected ',' or ')'");
            }
        }
    }

    fn vtype(&mut self) -> Result<VTypeExt> {
        self.skip_space();
        if self.eat("?") {
            return Ok(VTypeExt::option(self.vtype()?));
        }
        if self.eat("[]") {
            return Ok(VTypeExt::array(self.vtype()?));
        }
        if self.eat("[string]") {
            let elt = self.vtype()?;
            if matches!(&elt, VTypeExt::Plain(VType::Struct(s)) if s.elts.is_empty()) {
                return Ok(VTypeExt::StringSet);
            }
            return Ok(VTypeExt::dict(elt));
        }
        if self.rest().starts_with('[') {
            return self.fail("expected '[]' or '[string]'");
        }
        if self.rest().starts_with('(') {
            return Ok(match self.struct_or_enum()? {
                VStructOrEnum::VStruct(s) => VTypeExt::Plain(VType::Struct(s)),
                VStructOrEnum::VEnum(e) => VTypeExt::Plain(VType::Enum(e)),
            });
        }
        Ok(match self.word()? {
            "bool" => VTypeExt::Plain(VType::Bool),
            "int" => VTypeExt::Plain(VType::Int),
            "float" => VTypeExt::Plain(VType::Float),
            "string" => VTypeExt::Plain(VType::String),
            "object" => VTypeExt::Plain(VType::Object),
            "fd" => VTypeExt::Plain(VType::Fd),
            name => VTypeExt::typename(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Format, Interface};
    use crate::error::ErrorKind;

    #[test]
    fn parses_all_type_forms() {
        let iface = Interface::from_description(
            "\
interface com.example.kitchen

type Sink (
  depth: float,
  drain: ?bool,
  taps: []string,
  temperatures: [string]int,
  tags: [string](),
  handle: fd,
  extra: object,
  mode: (hot, cold)
)

method Install(sink: Sink, nested: (a: int, b: ?[]Sink)) -> ()

error Clogged (reason: string)
",
        )
        .expect("parses");
        assert_eq!(iface.name(), "com.example.kitchen");
        assert!(iface.typedef("Sink").is_some());
        assert!(iface.method("Install").is_some());
        assert!(iface.error("Clogged").is_some());
    }

    #[test]
    fn round_trips_its_own_rendering() {
        let text = "\
# A kitchen service.
interface com.example.kitchen

# Where the dishes pile up.
type Sink (depth: float, taps: []string, tags: [string]())

method Wash(sink: Sink, quick: ?bool) -> (
  remaining: int,
  drained: [string]int,
  handle: fd
)

# Nothing flows.
error Clogged (reason: string)
";
        let iface = Interface::from_description(text).expect("parses");
        assert_eq!(iface.description(), text);
        let again = Interface::from_description(iface.description()).expect("reparses");
        assert_eq!(again.description(), iface.description());
    }

    #[test]
    fn rejects_garbage() {
        for bad in [
            "",
            "interface",
            "interface com.example.demo\nmessage Foo() -> ()",
            "interface com.example.demo\nmethod Foo() -> (a: )",
            "interface com.example.demo\nmethod Foo() (a: int)",
        ] {
            let err = Interface::from_description(bad).expect_err("must fail");
            assert!(
                matches!(
                    err.kind(),
                    ErrorKind::IdlParse(_) | ErrorKind::Configuration(_)
                ),
                "unexpected error for {:?}: {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn multiline_method_round_trips() {
        let iface = Interface::from_description(
            "\
interface org.example.wide

method Query(filter: string) -> (
  alpha: string,
  beta: string,
  gamma: string,
  delta: string,
  epsilon: []string
)
",
        )
        .expect("parses");
        let rendered = iface.get_multiline(0, 80);
        assert_eq!(rendered, iface.description());
        assert!(rendered.contains("(\n  alpha: string,\n"));
    }
}
