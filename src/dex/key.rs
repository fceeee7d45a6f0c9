//! Value keys of dex id items and the descriptor grammar that validates them.

use std::fmt;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char, one_of};
use nom::combinator::{all_consuming, recognize};
use nom::multi::{many0, many0_count, separated_list1};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use serde::{Deserialize, Serialize};

use crate::error::{DexError, DexResult};

fn is_name_char(c: char) -> bool {
    !c.is_whitespace() && !";/[().<>:".contains(c)
}

fn simple_name(i: &str) -> IResult<&str, &str> {
    take_while1(is_name_char)(i)
}

fn member_name(i: &str) -> IResult<&str, &str> {
    alt((tag("<init>"), tag("<clinit>"), simple_name))(i)
}

fn class_descriptor(i: &str) -> IResult<&str, &str> {
    recognize(delimited(char('L'), separated_list1(char('/'), simple_name), char(';')))(i)
}

fn field_type(i: &str) -> IResult<&str, &str> {
    recognize(pair(many0_count(char('[')), alt((recognize(one_of("ZBSCIJFD")), class_descriptor))))(i)
}

fn return_type(i: &str) -> IResult<&str, &str> {
    alt((recognize(char('V')), field_type))(i)
}

fn proto(i: &str) -> IResult<&str, (Vec<&str>, &str)> {
    pair(delimited(char('('), many0(field_type), char(')')), return_type)(i)
}

fn invalid(what: &str, text: &str) -> DexError {
    err!(InvalidKey, "Malformed {} '{}'", what, text)
}

/// Checks a field or return type descriptor such as `I`, `[Ljava/lang/String;` or `V`.
pub fn validate_type_descriptor(descriptor: &str) -> DexResult<()> {
    let dims = descriptor.chars().take_while(|c| *c == '[').count();
    if dims > 255 {
        return Err(invalid("type descriptor", descriptor));
    }
    all_consuming(return_type)(descriptor)
        .map(|_| ())
        .map_err(|_| invalid("type descriptor", descriptor))
}

/// Checks a field or method simple name.
pub fn validate_member_name(name: &str) -> DexResult<()> {
    all_consuming(member_name)(name)
        .map(|_| ())
        .map_err(|_| invalid("member name", name))
}

/// Shorty character of one type descriptor.
pub fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('[') | Some('L') => 'L',
        Some(c) => c,
        None => 'V',
    }
}

/// Return type followed by parameter types, all as descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtoKey {
    pub return_type: String,
    pub parameters: Vec<String>,
}

impl ProtoKey {
    pub fn new(return_type: &str, parameters: &[&str]) -> DexResult<ProtoKey> {
        validate_type_descriptor(return_type)?;
        for p in parameters {
            validate_type_descriptor(p)?;
            if *p == "V" {
                return Err(invalid("parameter type", p));
            }
        }
        Ok(ProtoKey {
            return_type: return_type.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        })
    }

    pub fn shorty(&self) -> String {
        let mut s = String::with_capacity(self.parameters.len() + 1);
        s.push(shorty_char(&self.return_type));
        for p in &self.parameters {
            s.push(shorty_char(p));
        }
        s
    }
}

impl fmt::Display for ProtoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}){}", self.parameters.concat(), self.return_type)
    }
}

impl FromStr for ProtoKey {
    type Err = DexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, (params, ret)) = all_consuming(proto)(s).map_err(|_| invalid("prototype", s))?;
        ProtoKey::new(ret, &params)
    }
}

/// `Lclass;->name:Ltype;`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldKey {
    pub class: String,
    pub name: String,
    pub field_type: String,
}

impl FieldKey {
    pub fn new(class: &str, name: &str, field_type: &str) -> DexResult<FieldKey> {
        validate_type_descriptor(class)?;
        validate_member_name(name)?;
        validate_type_descriptor(field_type)?;
        if field_type == "V" {
            return Err(invalid("field type", field_type));
        }
        Ok(FieldKey { class: class.to_string(), name: name.to_string(), field_type: field_type.to_string() })
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}:{}", self.class, self.name, self.field_type)
    }
}

impl FromStr for FieldKey {
    type Err = DexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: IResult<&str, (&str, &str, &str)> =
            all_consuming(tuple((field_type, preceded(tag("->"), member_name), preceded(char(':'), field_type))))(s);
        let (_, (class, name, ty)) = parsed.map_err(|_| invalid("field reference", s))?;
        FieldKey::new(class, name, ty)
    }
}

/// `Lclass;->name(params)ret`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodKey {
    pub class: String,
    pub name: String,
    pub proto: ProtoKey,
}

impl MethodKey {
    pub fn new(class: &str, name: &str, proto: ProtoKey) -> DexResult<MethodKey> {
        validate_type_descriptor(class)?;
        validate_member_name(name)?;
        Ok(MethodKey { class: class.to_string(), name: name.to_string(), proto })
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.class, self.name, self.proto)
    }
}

impl FromStr for MethodKey {
    type Err = DexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed: IResult<&str, (&str, &str, (Vec<&str>, &str))> =
            all_consuming(tuple((field_type, preceded(tag("->"), member_name), proto)))(s);
        let (_, (class, name, (params, ret))) = parsed.map_err(|_| invalid("method reference", s))?;
        MethodKey::new(class, name, ProtoKey::new(ret, &params)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn type_descriptors() {
        for ok in ["I", "V", "[[J", "Ljava/lang/String;", "[Lcom/example/Outer$Inner;"] {
            validate_type_descriptor(ok).unwrap();
        }
        for bad in ["", "L;", "Ljava/lang/String", "java.lang.String", "[V", "Q", "Ljava//String;", "II"] {
            assert_eq!(validate_type_descriptor(bad).unwrap_err().kind(), ErrorKind::InvalidKey, "{}", bad);
        }
    }

    #[test]
    fn proto_shorty_and_text() {
        let p: ProtoKey = "(I[Ljava/lang/String;J)V".parse().unwrap();
        assert_eq!(p.parameters, vec!["I", "[Ljava/lang/String;", "J"]);
        assert_eq!(p.shorty(), "VILJ");
        assert_eq!(p.to_string(), "(I[Ljava/lang/String;J)V");
        assert!("(V)V".parse::<ProtoKey>().is_err());
    }

    #[test]
    fn member_keys() {
        let m: MethodKey = "Lcom/example/Foo;-><init>(I)V".parse().unwrap();
        assert_eq!(m.name, "<init>");
        assert_eq!(m.to_string(), "Lcom/example/Foo;-><init>(I)V");
        let f: FieldKey = "Lcom/example/Foo;->count:I".parse().unwrap();
        assert_eq!(f.field_type, "I");
        assert!("Lcom/example/Foo;->count:V".parse::<FieldKey>().is_err());
        assert!("Lcom/example/Foo;->bad name:I".parse::<FieldKey>().is_err());
    }
}
