//! The LVM2 textual config format.
//!
//! ```text
//! file    := item*
//! item    := IDENT '=' value | IDENT '{' item* '}'
//! value   := STRING | INT | '[' (value (',' value)*)? ']'
//! ```
//!
//! `#` starts a line comment, whitespace is insignificant, strings are
//! double-quoted with `\"` and `\\` escapes.

use nom::branch::alt;
use nom::bytes::complete::{is_not, take_while};
use nom::character::complete::{char, i64, line_ending, multispace0, not_line_ending, satisfy};
use nom::combinator::{map, opt, recognize, value as to};
use nom::multi::{many0, separated_list0};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
}

// identifiers are [A-Za-z_][A-Za-z0-9_]*
fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        satisfy(|c| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

/// Whether `s` can stand as a bare key in the textual format.
pub(crate) fn valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn comment(input: &str) -> IResult<&str, &str> {
    preceded(multispace0, delimited(char('#'), not_line_ending, line_ending))(input)
}

fn whitespace(input: &str) -> IResult<&str, ()> {
    let (input, _) = many0(comment)(input)?;
    let (input, _) = multispace0(input)?;
    Ok((input, ()))
}

fn quoted_string(input: &str) -> IResult<&str, String> {
    delimited(
        char('"'),
        map(
            opt(nom::bytes::complete::escaped_transform(
                is_not("\\\""),
                '\\',
                alt((to('\\', char('\\')), to('"', char('"')))),
            )),
            Option::unwrap_or_default,
        ),
        char('"'),
    )(input)
}

impl Value {
    pub fn parse(input: &str) -> IResult<&str, Self> {
        delimited(
            whitespace,
            alt((
                map(i64, Value::Int),
                map(
                    delimited(char('['), separated_list0(char(','), Value::parse), char(']')),
                    Value::Array,
                ),
                map(quoted_string, Value::Str),
            )),
            whitespace,
        )(input)
    }
}

fn item(input: &str) -> IResult<&str, (String, Value)> {
    delimited(
        whitespace,
        alt((
            map(
                tuple((ident, whitespace, char('='), whitespace, Value::parse)),
                |(name, _, _, _, v)| (name.to_owned(), v),
            ),
            map(
                tuple((ident, whitespace, char('{'), items, whitespace, char('}'))),
                |(name, _, _, fields, _, _)| (name.to_owned(), Value::Struct(fields)),
            ),
        )),
        whitespace,
    )(input)
}

fn items(input: &str) -> IResult<&str, Vec<(String, Value)>> {
    many0(item)(input)
}

/// Parse a whole metadata text into a top-level [`Value::Struct`].
pub fn parse_text(input: &str) -> Result<Value> {
    let (rest, fields) = items(input).map_err(|e| Error::Parse {
        path: "<toplevel>".to_owned(),
        error: e.to_string(),
    })?;
    let (rest, ()) = whitespace(rest).unwrap_or((rest, ()));
    if !rest.is_empty() {
        return Err(Error::Parse {
            path: "<toplevel>".to_owned(),
            error: format!("trailing garbage: {:?}", &rest[..rest.len().min(40)]),
        });
    }
    Ok(Value::Struct(fields))
}

fn expected(path: &str, what: &str, got: &Value) -> Error {
    let kind = match got {
        Value::Int(_) => "an int",
        Value::Str(_) => "a string",
        Value::Array(_) => "an array",
        Value::Struct(_) => "a struct",
    };
    Error::Parse {
        path: path.to_owned(),
        error: format!("expected {what}, found {kind}"),
    }
}

impl Value {
    pub fn expect_struct(&self, path: &str) -> Result<&[(String, Value)]> {
        match self {
            Value::Struct(fields) => Ok(fields),
            other => Err(expected(path, "a struct", other)),
        }
    }

    /// First binding of `key` in a struct, if any.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => {
                fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    fn expect_mapped(&self, path: &str, key: &str) -> Result<&Value> {
        self.expect_struct(path)?;
        self.lookup(key).ok_or_else(|| Error::Parse {
            path: format!("{path}/{key}"),
            error: "missing key".to_owned(),
        })
    }

    pub fn expect_mapped_string(&self, path: &str, key: &str) -> Result<&str> {
        match self.expect_mapped(path, key)? {
            Value::Str(s) => Ok(s),
            other => Err(expected(&format!("{path}/{key}"), "a string", other)),
        }
    }

    pub fn expect_mapped_int(&self, path: &str, key: &str) -> Result<i64> {
        match self.expect_mapped(path, key)? {
            Value::Int(n) => Ok(*n),
            other => Err(expected(&format!("{path}/{key}"), "an int", other)),
        }
    }

    pub fn expect_mapped_array(&self, path: &str, key: &str) -> Result<&[Value]> {
        match self.expect_mapped(path, key)? {
            Value::Array(xs) => Ok(xs),
            other => Err(expected(&format!("{path}/{key}"), "an array", other)),
        }
    }

    pub fn map_expected_mapped_array<T>(
        &self,
        path: &str,
        key: &str,
        mut f: impl FnMut(&Value) -> Result<T>,
    ) -> Result<Vec<T>> {
        self.expect_mapped_array(path, key)?.iter().map(|v| f(v)).collect()
    }
}

fn escape(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c => out.push(c),
        }
    }
}

impl Value {
    fn emit_value(&self, out: &mut String, depth: usize) {
        match self {
            Value::Int(n) => out.push_str(&n.to_string()),
            Value::Str(s) => {
                out.push('"');
                escape(s, out);
                out.push('"');
            }
            Value::Array(xs) => {
                out.push('[');
                for (i, x) in xs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    x.emit_value(out, depth);
                }
                out.push(']');
            }
            Value::Struct(fields) => {
                out.push_str("{\n");
                emit_fields(fields, out, depth + 1);
                for _ in 0..depth {
                    out.push('\t');
                }
                out.push('}');
            }
        }
    }
}

fn emit_fields(fields: &[(String, Value)], out: &mut String, depth: usize) {
    for (k, v) in fields {
        for _ in 0..depth {
            out.push('\t');
        }
        out.push_str(k);
        match v {
            Value::Struct(_) => out.push(' '),
            _ => out.push_str(" = "),
        }
        v.emit_value(out, depth);
        out.push('\n');
    }
}

/// Render a top-level item list back into the textual format.
pub fn emit_text(fields: &[(String, Value)]) -> String {
    let mut out = String::new();
    emit_fields(fields, &mut out, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(s: &str) -> Value {
        parse_text(s).unwrap()
    }

    #[test]
    fn scalars_and_arrays() {
        let v = parse_ok("a = 1\nb = \"two\"\nc = [1, \"x\", [2]]\n");
        assert_eq!(v.expect_mapped_int("t", "a").unwrap(), 1);
        assert_eq!(v.expect_mapped_string("t", "b").unwrap(), "two");
        assert_eq!(v.expect_mapped_array("t", "c").unwrap().len(), 3);
    }

    #[test]
    fn nested_structs_and_comments() {
        let v = parse_ok(
            "# a comment\nvg0 {\n\tseqno = 3 # trailing\n\tpvs {\n\t\tpv0 { x = 1 }\n\t}\n}\n",
        );
        let vg = v.lookup("vg0").unwrap();
        assert_eq!(vg.expect_mapped_int("vg0", "seqno").unwrap(), 3);
        assert!(vg.lookup("pvs").unwrap().lookup("pv0").is_some());
    }

    #[test]
    fn string_escapes() {
        let v = parse_ok(r#"s = "a\"b\\c""#);
        assert_eq!(v.expect_mapped_string("t", "s").unwrap(), "a\"b\\c");
        let v = parse_ok("e = \"\"\n");
        assert_eq!(v.expect_mapped_string("t", "e").unwrap(), "");
    }

    #[test]
    fn negative_ints() {
        let v = parse_ok("n = -42\n");
        assert_eq!(v.expect_mapped_int("t", "n").unwrap(), -42);
    }

    #[test]
    fn map_over_arrays() {
        let v = parse_ok("xs = [1, 2, 3]\n");
        let doubled = v
            .map_expected_mapped_array("t", "xs", |x| match x {
                Value::Int(n) => Ok(n * 2),
                other => Err(expected("t/xs", "an int", other)),
            })
            .unwrap();
        assert_eq!(doubled, vec![2, 4, 6]);
    }

    #[test]
    fn error_paths() {
        let v = parse_ok("a = 1\n");
        let e = v.expect_mapped_string("root", "a").unwrap_err();
        assert!(e.to_string().contains("root/a"), "{e}");
        let e = v.expect_mapped_int("root", "missing").unwrap_err();
        assert!(e.to_string().contains("root/missing"), "{e}");
    }

    #[test]
    fn emit_parse_roundtrip() {
        let fields = vec![
            ("name".to_owned(), Value::Str("vg\"0\\".to_owned())),
            ("count".to_owned(), Value::Int(-7)),
            (
                "inner".to_owned(),
                Value::Struct(vec![
                    ("xs".to_owned(), Value::Array(vec![Value::Int(1), Value::Str("y".to_owned())])),
                    ("empty".to_owned(), Value::Array(vec![])),
                ]),
            ),
        ];
        let text = emit_text(&fields);
        assert_eq!(parse_text(&text).unwrap(), Value::Struct(fields));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        assert!(parse_text("a = 1\n}").is_err());
    }

    #[test]
    fn non_conforming_keys_are_rejected() {
        assert!(parse_text("2bad = 1\n").is_err());
        assert!(parse_text("bad-key = 1\n").is_err());
        assert!(parse_text("bad.key = 1\n").is_err());
        let v = parse_ok("_ok9 = 1\n");
        assert_eq!(v.expect_mapped_int("t", "_ok9").unwrap(), 1);
        assert!(valid_ident("_ok9"));
        assert!(!valid_ident(""));
        assert!(!valid_ident("9no"));
    }
}
