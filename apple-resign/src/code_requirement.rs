// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code requirement expressions.

Code signatures contain a binary encoded expression tree denoting requirements.
The designated requirement of a signed bundle typically pins the bundle
identifier and fields of the signing certificate. When a bundle is re-signed
under a new identity, those literals need to change.

# Binary Encoding

Requirement expressions consist of opcodes. An opcode is defined by a u32 where
the high byte contains flags and the lower 3 bytes denote the opcode value.

Some opcodes have payloads and the payload varies by opcode. Variable length
data is a u32 length followed by that many bytes, NULL padded so the next
opcode is aligned on a 4 byte boundary.

We only rewrite requirements we fully understand. A requirement blob whose
bytes aren't reproduced exactly by its parsed tree is carried as opaque data.
*/

use {
    crate::{
        embedded_signature::{read_and_validate_blob_header, Blob, CodeSigningMagic},
        error::ResignError,
    },
    bcder::Oid,
    chrono::{DateTime, TimeZone, Utc},
    scroll::{IOwrite, Pread},
    std::{fmt::Display, io::Write},
};

const OPCODE_FLAG_MASK: u32 = 0xff000000;

/// Deepest nesting of `and`, `or` and `not` we are willing to parse.
const MAX_EXPRESSION_DEPTH: usize = 64;

/// Requirement blob payload kind for expression form.
pub const REQUIREMENT_KIND_EXPRESSION: u32 = 1;

/// Expression opcode values.
mod op {
    pub const FALSE: u32 = 0;
    pub const TRUE: u32 = 1;
    pub const IDENT: u32 = 2;
    pub const APPLE_ANCHOR: u32 = 3;
    pub const ANCHOR_HASH: u32 = 4;
    pub const INFO_KEY_VALUE: u32 = 5;
    pub const AND: u32 = 6;
    pub const OR: u32 = 7;
    pub const CD_HASH: u32 = 8;
    pub const NOT: u32 = 9;
    pub const INFO_KEY_FIELD: u32 = 10;
    pub const CERT_FIELD: u32 = 11;
    pub const TRUSTED_CERT: u32 = 12;
    pub const TRUSTED_CERTS: u32 = 13;
    pub const CERT_GENERIC: u32 = 14;
    pub const APPLE_GENERIC_ANCHOR: u32 = 15;
    pub const ENTITLEMENT_FIELD: u32 = 16;
    pub const CERT_POLICY: u32 = 17;
    pub const NAMED_ANCHOR: u32 = 18;
    pub const NAMED_CODE: u32 = 19;
    pub const PLATFORM: u32 = 20;
    pub const NOTARIZED: u32 = 21;
    pub const CERT_FIELD_DATE: u32 = 22;
    pub const LEGACY_DEV_ID: u32 = 23;
}

/// Match operation values.
mod match_op {
    pub const EXISTS: u32 = 0;
    pub const EQUAL: u32 = 1;
    pub const CONTAINS: u32 = 2;
    pub const BEGINS_WITH: u32 = 3;
    pub const ENDS_WITH: u32 = 4;
    pub const LESS_THAN: u32 = 5;
    pub const GREATER_THAN: u32 = 6;
    pub const LESS_EQUAL: u32 = 7;
    pub const GREATER_EQUAL: u32 = 8;
    pub const ON: u32 = 9;
    pub const BEFORE: u32 = 10;
    pub const AFTER: u32 = 11;
    pub const ON_OR_BEFORE: u32 = 12;
    pub const ON_OR_AFTER: u32 = 13;
    pub const ABSENT: u32 = 14;
}

fn malformed(what: &'static str) -> ResignError {
    ResignError::MalformedStructure(what)
}

/// Cursor over encoded expression data.
///
/// Every read is bounds checked up front, so running out of data is reported
/// as a malformed structure rather than a low level read error.
struct ExpressionReader<'a> {
    data: &'a [u8],
    depth: usize,
}

impl<'a> ExpressionReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, depth: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ResignError> {
        if len > self.data.len() {
            return Err(malformed("requirement expression truncated"));
        }

        let (head, tail) = self.data.split_at(len);
        self.data = tail;

        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, ResignError> {
        Ok(self.take(4)?.pread_with(0, scroll::BE)?)
    }

    fn i32(&mut self) -> Result<i32, ResignError> {
        Ok(self.take(4)?.pread_with(0, scroll::BE)?)
    }

    /// Length prefixed data, consuming the alignment padding.
    fn data(&mut self) -> Result<&'a [u8], ResignError> {
        let len = self.u32()? as usize;
        let value = self.take(len)?;
        self.take((4 - len % 4) % 4)?;

        Ok(value)
    }

    fn string(&mut self, what: &'static str) -> Result<String, ResignError> {
        let value = self.data()?;

        Ok(std::str::from_utf8(value).map_err(|_| malformed(what))?.to_string())
    }

    fn oid(&mut self) -> Result<Oid<Vec<u8>>, ResignError> {
        Ok(Oid(self.data()?.to_vec()))
    }

    fn timestamp(&mut self) -> Result<DateTime<Utc>, ResignError> {
        let value = self.take(8)?.pread_with::<i64>(0, scroll::BE)?;

        Utc.timestamp_opt(value, 0)
            .single()
            .ok_or_else(|| malformed("requirement timestamp out of range"))
    }

    fn match_expression(&mut self) -> Result<CodeRequirementMatchExpression, ResignError> {
        type M = CodeRequirementMatchExpression;

        Ok(match self.u32()? {
            match_op::EXISTS => M::Exists,
            match_op::ABSENT => M::Absent,
            match_op::EQUAL => M::Equal(self.data()?.into()),
            match_op::CONTAINS => M::Contains(self.data()?.into()),
            match_op::BEGINS_WITH => M::BeginsWith(self.data()?.into()),
            match_op::ENDS_WITH => M::EndsWith(self.data()?.into()),
            match_op::LESS_THAN => M::LessThan(self.data()?.into()),
            match_op::GREATER_THAN => M::GreaterThan(self.data()?.into()),
            match_op::LESS_EQUAL => M::LessThanEqual(self.data()?.into()),
            match_op::GREATER_EQUAL => M::GreaterThanEqual(self.data()?.into()),
            match_op::ON => M::On(self.timestamp()?),
            match_op::BEFORE => M::Before(self.timestamp()?),
            match_op::AFTER => M::After(self.timestamp()?),
            match_op::ON_OR_BEFORE => M::OnOrBefore(self.timestamp()?),
            match_op::ON_OR_AFTER => M::OnOrAfter(self.timestamp()?),
            _ => return Err(malformed("unknown requirement match type")),
        })
    }

    fn expression(&mut self) -> Result<CodeRequirementExpression, ResignError> {
        if self.depth >= MAX_EXPRESSION_DEPTH {
            return Err(malformed("requirement expression nested too deeply"));
        }

        self.depth += 1;
        let res = self.expression_body();
        self.depth -= 1;

        res
    }

    fn boxed_expression(&mut self) -> Result<Box<CodeRequirementExpression>, ResignError> {
        Ok(Box::new(self.expression()?))
    }

    fn expression_body(&mut self) -> Result<CodeRequirementExpression, ResignError> {
        type E = CodeRequirementExpression;

        let opcode = self.u32()?;

        // Flags alter how unknown opcodes are evaluated. We never keep flagged
        // opcodes in parsed form, so the exact bytes survive through the opaque path.
        if opcode & OPCODE_FLAG_MASK != 0 {
            return Err(malformed("requirement opcode carries flags"));
        }

        Ok(match opcode {
            op::FALSE => E::False,
            op::TRUE => E::True,
            op::IDENT => E::Identifier(self.string("identifier value not UTF-8")?),
            op::APPLE_ANCHOR => E::AnchorApple,
            op::ANCHOR_HASH => E::AnchorCertificateHash(self.i32()?, self.data()?.to_vec()),
            op::INFO_KEY_VALUE => E::InfoKeyValueLegacy(
                self.string("info key not UTF-8")?,
                self.string("info value not UTF-8")?,
            ),
            op::AND => E::And(self.boxed_expression()?, self.boxed_expression()?),
            op::OR => E::Or(self.boxed_expression()?, self.boxed_expression()?),
            op::CD_HASH => E::CodeDirectoryHash(self.data()?.to_vec()),
            op::NOT => E::Not(self.boxed_expression()?),
            op::INFO_KEY_FIELD => {
                E::InfoPlistKeyField(self.string("info key not UTF-8")?, self.match_expression()?)
            }
            op::CERT_FIELD => E::CertificateField(
                self.i32()?,
                self.string("certificate field not UTF-8")?,
                self.match_expression()?,
            ),
            op::TRUSTED_CERT => E::CertificateTrusted(self.i32()?),
            op::TRUSTED_CERTS => E::AnchorTrusted,
            op::CERT_GENERIC => {
                E::CertificateGeneric(self.i32()?, self.oid()?, self.match_expression()?)
            }
            op::APPLE_GENERIC_ANCHOR => E::AnchorAppleGeneric,
            op::ENTITLEMENT_FIELD => E::EntitlementsKey(
                self.string("entitlement key not UTF-8")?,
                self.match_expression()?,
            ),
            op::CERT_POLICY => {
                E::CertificatePolicy(self.i32()?, self.oid()?, self.match_expression()?)
            }
            op::NAMED_ANCHOR => E::NamedAnchor(self.string("named anchor not UTF-8")?),
            op::NAMED_CODE => E::NamedCode(self.string("named code not UTF-8")?),
            op::PLATFORM => E::Platform(self.u32()?),
            op::NOTARIZED => E::Notarized,
            op::CERT_FIELD_DATE => {
                E::CertificateFieldDate(self.i32()?, self.oid()?, self.match_expression()?)
            }
            op::LEGACY_DEV_ID => E::LegacyDeveloperId,
            _ => return Err(malformed("unknown requirement opcode")),
        })
    }
}

fn write_data(dest: &mut impl Write, data: &[u8]) -> Result<(), ResignError> {
    dest.iowrite_with(data.len() as u32, scroll::BE)?;
    dest.write_all(data)?;
    dest.write_all(&[0u8; 3][..(4 - data.len() % 4) % 4])?;

    Ok(())
}

/// The role of a requirement within a requirement set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Host,
            2 => Self::Guest,
            3 => Self::Designated,
            4 => Self::Library,
            5 => Self::Plugin,
            _ => Self::Unknown(v),
        }
    }
}

impl From<RequirementType> for u32 {
    fn from(t: RequirementType) -> Self {
        match t {
            RequirementType::Host => 1,
            RequirementType::Guest => 2,
            RequirementType::Designated => 3,
            RequirementType::Library => 4,
            RequirementType::Plugin => 5,
            RequirementType::Unknown(v) => v,
        }
    }
}

/// A literal operand in a match expression.
///
/// Printable data is kept as a string so it can be compared and replaced
/// naturally. Both forms encode identically.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementValue {
    String(String),
    Bytes(Vec<u8>),
}

impl From<&[u8]> for CodeRequirementValue {
    fn from(value: &[u8]) -> Self {
        let printable = |c: &u8| c.is_ascii_graphic() || *c == b' ';

        match std::str::from_utf8(value) {
            Ok(s) if value.iter().all(printable) => Self::String(s.to_string()),
            _ => Self::Bytes(value.to_vec()),
        }
    }
}

impl From<&str> for CodeRequirementValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for CodeRequirementValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl Display for CodeRequirementValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bytes(data) => f.write_str(&hex::encode(data)),
        }
    }
}

impl CodeRequirementValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::String(s) => s.as_bytes(),
            Self::Bytes(data) => data,
        }
    }
}

/// A node in a code requirement expression tree.
///
/// Certificate slots count from the leaf (0) toward the anchor; negative
/// values count back from the anchor (-1).
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementExpression {
    False,
    True,
    /// Signing identifier equals the string.
    Identifier(String),
    AnchorApple,
    /// Certificate in slot has the given SHA-1 digest.
    AnchorCertificateHash(i32, Vec<u8>),
    InfoKeyValueLegacy(String, String),
    And(Box<CodeRequirementExpression>, Box<CodeRequirementExpression>),
    Or(Box<CodeRequirementExpression>, Box<CodeRequirementExpression>),
    CodeDirectoryHash(Vec<u8>),
    Not(Box<CodeRequirementExpression>),
    InfoPlistKeyField(String, CodeRequirementMatchExpression),
    /// Named field (e.g. `subject.CN`) of the certificate in slot.
    CertificateField(i32, String, CodeRequirementMatchExpression),
    CertificateTrusted(i32),
    AnchorTrusted,
    /// Certificate extension identified by OID.
    CertificateGeneric(i32, Oid<Vec<u8>>, CodeRequirementMatchExpression),
    AnchorAppleGeneric,
    EntitlementsKey(String, CodeRequirementMatchExpression),
    CertificatePolicy(i32, Oid<Vec<u8>>, CodeRequirementMatchExpression),
    NamedAnchor(String),
    NamedCode(String),
    Platform(u32),
    Notarized,
    CertificateFieldDate(i32, Oid<Vec<u8>>, CodeRequirementMatchExpression),
    LegacyDeveloperId,
}

impl CodeRequirementExpression {
    /// Parse an expression from the start of a slice.
    ///
    /// Returns the expression and the data following it.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, &[u8]), ResignError> {
        let mut reader = ExpressionReader::new(data);
        let expr = reader.expression()?;

        Ok((expr, reader.data))
    }

    fn opcode(&self) -> u32 {
        match self {
            Self::False => op::FALSE,
            Self::True => op::TRUE,
            Self::Identifier(_) => op::IDENT,
            Self::AnchorApple => op::APPLE_ANCHOR,
            Self::AnchorCertificateHash(..) => op::ANCHOR_HASH,
            Self::InfoKeyValueLegacy(..) => op::INFO_KEY_VALUE,
            Self::And(..) => op::AND,
            Self::Or(..) => op::OR,
            Self::CodeDirectoryHash(_) => op::CD_HASH,
            Self::Not(_) => op::NOT,
            Self::InfoPlistKeyField(..) => op::INFO_KEY_FIELD,
            Self::CertificateField(..) => op::CERT_FIELD,
            Self::CertificateTrusted(_) => op::TRUSTED_CERT,
            Self::AnchorTrusted => op::TRUSTED_CERTS,
            Self::CertificateGeneric(..) => op::CERT_GENERIC,
            Self::AnchorAppleGeneric => op::APPLE_GENERIC_ANCHOR,
            Self::EntitlementsKey(..) => op::ENTITLEMENT_FIELD,
            Self::CertificatePolicy(..) => op::CERT_POLICY,
            Self::NamedAnchor(_) => op::NAMED_ANCHOR,
            Self::NamedCode(_) => op::NAMED_CODE,
            Self::Platform(_) => op::PLATFORM,
            Self::Notarized => op::NOTARIZED,
            Self::CertificateFieldDate(..) => op::CERT_FIELD_DATE,
            Self::LegacyDeveloperId => op::LEGACY_DEV_ID,
        }
    }

    /// Write the binary form of this expression.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), ResignError> {
        dest.iowrite_with(self.opcode(), scroll::BE)?;

        match self {
            Self::False
            | Self::True
            | Self::AnchorApple
            | Self::AnchorTrusted
            | Self::AnchorAppleGeneric
            | Self::Notarized
            | Self::LegacyDeveloperId => {}
            Self::Identifier(s) | Self::NamedAnchor(s) | Self::NamedCode(s) => {
                write_data(dest, s.as_bytes())?;
            }
            Self::AnchorCertificateHash(slot, hash) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, hash)?;
            }
            Self::InfoKeyValueLegacy(key, value) => {
                write_data(dest, key.as_bytes())?;
                write_data(dest, value.as_bytes())?;
            }
            Self::And(a, b) | Self::Or(a, b) => {
                a.write_to(dest)?;
                b.write_to(dest)?;
            }
            Self::CodeDirectoryHash(hash) => write_data(dest, hash)?,
            Self::Not(expr) => expr.write_to(dest)?,
            Self::InfoPlistKeyField(key, m) | Self::EntitlementsKey(key, m) => {
                write_data(dest, key.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateField(slot, field, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, field.as_bytes())?;
                m.write_to(dest)?;
            }
            Self::CertificateTrusted(slot) => dest.iowrite_with(*slot, scroll::BE)?,
            Self::CertificateGeneric(slot, oid, m)
            | Self::CertificatePolicy(slot, oid, m)
            | Self::CertificateFieldDate(slot, oid, m) => {
                dest.iowrite_with(*slot, scroll::BE)?;
                write_data(dest, oid.as_ref())?;
                m.write_to(dest)?;
            }
            Self::Platform(value) => dest.iowrite_with(*value, scroll::BE)?,
        }

        Ok(())
    }

    /// Produce the binary serialization of this expression, without a blob header.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ResignError> {
        let mut res = vec![];
        self.write_to(&mut res)?;

        Ok(res)
    }
}

/// How a field referenced by an expression is compared.
#[derive(Clone, Debug, PartialEq)]
pub enum CodeRequirementMatchExpression {
    Exists,
    Equal(CodeRequirementValue),
    Contains(CodeRequirementValue),
    BeginsWith(CodeRequirementValue),
    EndsWith(CodeRequirementValue),
    LessThan(CodeRequirementValue),
    GreaterThan(CodeRequirementValue),
    LessThanEqual(CodeRequirementValue),
    GreaterThanEqual(CodeRequirementValue),
    On(DateTime<Utc>),
    Before(DateTime<Utc>),
    After(DateTime<Utc>),
    OnOrBefore(DateTime<Utc>),
    OnOrAfter(DateTime<Utc>),
    Absent,
}

impl CodeRequirementMatchExpression {
    /// Parse a match expression from the start of a slice.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, &[u8]), ResignError> {
        let mut reader = ExpressionReader::new(data);
        let m = reader.match_expression()?;

        Ok((m, reader.data))
    }

    fn match_op(&self) -> u32 {
        match self {
            Self::Exists => match_op::EXISTS,
            Self::Equal(_) => match_op::EQUAL,
            Self::Contains(_) => match_op::CONTAINS,
            Self::BeginsWith(_) => match_op::BEGINS_WITH,
            Self::EndsWith(_) => match_op::ENDS_WITH,
            Self::LessThan(_) => match_op::LESS_THAN,
            Self::GreaterThan(_) => match_op::GREATER_THAN,
            Self::LessThanEqual(_) => match_op::LESS_EQUAL,
            Self::GreaterThanEqual(_) => match_op::GREATER_EQUAL,
            Self::On(_) => match_op::ON,
            Self::Before(_) => match_op::BEFORE,
            Self::After(_) => match_op::AFTER,
            Self::OnOrBefore(_) => match_op::ON_OR_BEFORE,
            Self::OnOrAfter(_) => match_op::ON_OR_AFTER,
            Self::Absent => match_op::ABSENT,
        }
    }

    /// Write the binary form of this match expression.
    pub fn write_to(&self, dest: &mut impl Write) -> Result<(), ResignError> {
        dest.iowrite_with(self.match_op(), scroll::BE)?;

        match self {
            Self::Exists | Self::Absent => {}
            Self::On(t)
            | Self::Before(t)
            | Self::After(t)
            | Self::OnOrBefore(t)
            | Self::OnOrAfter(t) => dest.iowrite_with(t.timestamp(), scroll::BE)?,
            _ => {
                if let Some(value) = self.value() {
                    write_data(dest, value.as_bytes())?;
                }
            }
        }

        Ok(())
    }

    /// The literal operand of a valued match, if this match carries one.
    pub fn value(&self) -> Option<&CodeRequirementValue> {
        match self {
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value)
            | Self::LessThan(value)
            | Self::GreaterThan(value)
            | Self::LessThanEqual(value)
            | Self::GreaterThanEqual(value) => Some(value),
            _ => None,
        }
    }

    /// Mutable variant of [Self::value].
    pub fn value_mut(&mut self) -> Option<&mut CodeRequirementValue> {
        match self {
            Self::Equal(value)
            | Self::Contains(value)
            | Self::BeginsWith(value)
            | Self::EndsWith(value)
            | Self::LessThan(value)
            | Self::GreaterThan(value)
            | Self::LessThanEqual(value)
            | Self::GreaterThanEqual(value) => Some(value),
            _ => None,
        }
    }
}

/// The body of a requirement blob.
#[derive(Clone, Debug, PartialEq)]
pub enum RequirementBody {
    /// An expression form requirement we can rewrite.
    Expression(CodeRequirementExpression),
    /// The raw payload, `kind` field included, of a requirement we don't fully understand.
    Opaque(Vec<u8>),
}

/// A single code requirement blob.
#[derive(Clone, Debug, PartialEq)]
pub struct RequirementBlob {
    pub body: RequirementBody,
}

impl Blob for RequirementBlob {
    fn magic(&self) -> u32 {
        u32::from(CodeSigningMagic::Requirement)
    }

    fn from_blob_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let payload = read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::Requirement),
            "requirement blob",
        )?;

        Ok(Self {
            body: Self::parse_body(payload),
        })
    }

    fn serialize_payload(&self) -> Result<Vec<u8>, ResignError> {
        match &self.body {
            RequirementBody::Expression(expr) => {
                let mut res = Vec::new();
                res.iowrite_with(REQUIREMENT_KIND_EXPRESSION, scroll::BE)?;
                expr.write_to(&mut res)?;

                Ok(res)
            }
            RequirementBody::Opaque(data) => Ok(data.clone()),
        }
    }
}

impl RequirementBlob {
    /// Construct an instance from an expression.
    pub fn from_expression(expr: CodeRequirementExpression) -> Self {
        Self {
            body: RequirementBody::Expression(expr),
        }
    }

    /// Interpret a payload, falling back to opaque data.
    ///
    /// A parse is only kept if serializing it reproduces `payload` exactly.
    fn parse_body(payload: &[u8]) -> RequirementBody {
        let parsed = payload
            .pread_with::<u32>(0, scroll::BE)
            .ok()
            .filter(|kind| *kind == REQUIREMENT_KIND_EXPRESSION)
            .and_then(|_| CodeRequirementExpression::from_bytes(&payload[4..]).ok())
            .filter(|(_, remaining)| remaining.is_empty())
            .map(|(expr, _)| Self::from_expression(expr));

        match parsed {
            Some(blob) if blob.serialize_payload().ok().as_deref() == Some(payload) => blob.body,
            _ => RequirementBody::Opaque(payload.to_vec()),
        }
    }

    /// The parsed expression, if this requirement could be parsed.
    pub fn expression(&self) -> Option<&CodeRequirementExpression> {
        match &self.body {
            RequirementBody::Expression(expr) => Some(expr),
            RequirementBody::Opaque(_) => None,
        }
    }

    /// Mutable variant of [Self::expression].
    pub fn expression_mut(&mut self) -> Option<&mut CodeRequirementExpression> {
        match &mut self.body {
            RequirementBody::Expression(expr) => Some(expr),
            RequirementBody::Opaque(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_single(source: &[u8]) -> CodeRequirementExpression {
        let (expr, data) = CodeRequirementExpression::from_bytes(source).unwrap();
        assert!(data.is_empty());
        assert_eq!(expr.to_bytes().unwrap(), source);

        expr
    }

    #[test]
    fn parse_identifier() {
        let source = hex::decode("000000020000000f636f6d2e6578616d706c652e61707000").unwrap();

        assert_eq!(
            parse_single(&source),
            CodeRequirementExpression::Identifier("com.example.app".into())
        );
    }

    #[test]
    fn parse_certificate_field() {
        let source = hex::decode("0000000bffffffff0000000a7375626a6563742e434e000000000000")
            .unwrap();

        assert_eq!(
            parse_single(&source),
            CodeRequirementExpression::CertificateField(
                -1,
                "subject.CN".into(),
                CodeRequirementMatchExpression::Exists
            )
        );
    }

    #[test]
    fn parse_certificate_generic() {
        let source = hex::decode("0000000effffffff000000035504030000000000").unwrap();

        assert_eq!(
            parse_single(&source),
            CodeRequirementExpression::CertificateGeneric(
                -1,
                Oid(vec![0x55, 4, 3]),
                CodeRequirementMatchExpression::Exists
            )
        );
    }

    #[test]
    fn parse_match_equal() {
        let source =
            hex::decode("0000000a000000036b657900000000010000000576616c7565000000").unwrap();

        let mut expr = parse_single(&source);
        assert_eq!(
            expr,
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::Equal(b"value".as_ref().into())
            )
        );

        if let CodeRequirementExpression::InfoPlistKeyField(_, m) = &mut expr {
            *m.value_mut().unwrap() = "other value".into();
        }
        assert_eq!(
            expr.to_bytes().unwrap(),
            hex::decode(
                "0000000a000000036b65790000000001\
                 0000000b6f746865722076616c756500"
            )
            .unwrap()
        );
    }

    #[test]
    fn parse_match_on() {
        let source = hex::decode("0000000a000000036b6579000000000900000000605fca30").unwrap();

        assert_eq!(
            parse_single(&source),
            CodeRequirementExpression::InfoPlistKeyField(
                "key".into(),
                CodeRequirementMatchExpression::On(
                    chrono::Utc.timestamp_opt(1616890416, 0).unwrap()
                ),
            )
        );
    }

    #[test]
    fn parse_and() {
        let source = hex::decode("00000006000000030000000f").unwrap();

        assert_eq!(
            parse_single(&source),
            CodeRequirementExpression::And(
                Box::new(CodeRequirementExpression::AnchorApple),
                Box::new(CodeRequirementExpression::AnchorAppleGeneric)
            )
        );
    }

    #[test]
    fn truncated_data() {
        for source in [
            // String shorter than its length.
            "000000020000000f636f6d",
            // Opcode cut short.
            "000000",
            // Second operand of `and` missing.
            "0000000600000003",
            // Timestamp cut short.
            "0000000a000000036b657900000000090000",
        ] {
            let source = hex::decode(source).unwrap();

            assert!(
                matches!(
                    CodeRequirementExpression::from_bytes(&source),
                    Err(ResignError::MalformedStructure(_))
                ),
                "{}",
                hex::encode(&source)
            );
        }
    }

    #[test]
    fn nesting_is_bounded() {
        let nested = |depth: usize| {
            let mut source = hex::decode("00000009").unwrap().repeat(depth);
            source.extend(hex::decode("00000001").unwrap());
            source
        };

        let (expr, _) = CodeRequirementExpression::from_bytes(&nested(MAX_EXPRESSION_DEPTH - 1))
            .unwrap();
        assert!(matches!(expr, CodeRequirementExpression::Not(_)));

        assert!(matches!(
            CodeRequirementExpression::from_bytes(&nested(10_000)),
            Err(ResignError::MalformedStructure(_))
        ));

        // Inside a blob, such an expression is simply kept opaque.
        let payload = [REQUIREMENT_KIND_EXPRESSION.to_be_bytes().to_vec(), nested(10_000)].concat();
        let mut source = hex::decode("fade0c00").unwrap();
        source.extend(((payload.len() + 8) as u32).to_be_bytes());
        source.extend(payload);

        let blob = RequirementBlob::from_blob_bytes(&source).unwrap();
        assert!(blob.expression().is_none());
        assert_eq!(blob.to_blob_bytes().unwrap(), source);
    }

    #[test]
    fn parse_blob() {
        let source = hex::decode("fade0c00000000100000000100000000").unwrap();

        let blob = RequirementBlob::from_blob_bytes(&source).unwrap();
        assert_eq!(blob.expression(), Some(&CodeRequirementExpression::False));
        assert_eq!(blob.to_blob_bytes().unwrap(), source);
    }

    #[test]
    fn opaque_fallback() {
        for source in [
            // Unknown opcode.
            "fade0c0000000010000000010000ffff",
            // Opcode with flags.
            "fade0c00000000100000000180000003",
            // Non-zero padding.
            "fade0c000000001800000001000000020000000161ffffff",
            // Trailing data after the expression.
            "fade0c000000001400000001000000030000000f",
            // Not expression form.
            "fade0c00000000100000000200000003",
        ] {
            let source = hex::decode(source).unwrap();

            let blob = RequirementBlob::from_blob_bytes(&source).unwrap();
            assert!(blob.expression().is_none(), "{}", hex::encode(&source));
            assert_eq!(blob.to_blob_bytes().unwrap(), source);
        }
    }
}
