//! distinguished names and relative distinguished names
//!
//! DNs are parsed with a [chumsky] parser following RFC 4514 (including
//! hex pair escapes and multi-valued RDNs) and compared in a normalized,
//! case-insensitive form. The normalized form also provides the total order
//! the entry lock manager relies on to acquire several locks without
//! deadlocking.

use chumsky::prelude::*;
use ldap_types::basic::ChumskyError;
use serde::Deserialize;
use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// a piece of an attribute value as it appeared in the DN string
#[derive(Debug, Clone)]
enum ValuePiece {
    /// an unescaped character
    Plain(char),
    /// the bytes produced by an escape sequence
    Escaped(Vec<u8>),
}

/// join the pieces of an attribute value, dropping unescaped leading and
/// trailing spaces
fn assemble_value(mut pieces: Vec<ValuePiece>) -> Result<String, String> {
    while matches!(pieces.last(), Some(ValuePiece::Plain(' '))) {
        pieces.pop();
    }
    let leading = pieces
        .iter()
        .take_while(|p| matches!(p, ValuePiece::Plain(' ')))
        .count();
    let mut bytes = Vec::new();
    for piece in pieces.into_iter().skip(leading) {
        match piece {
            ValuePiece::Plain(c) => {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            ValuePiece::Escaped(b) => bytes.extend(b),
        }
    }
    String::from_utf8(bytes).map_err(|e| format!("attribute value is not valid UTF-8: {}", e))
}

/// parses a hex pair like `2C` into a single byte
pub(crate) fn hex_pair_parser() -> impl Parser<char, u8, Error = Simple<char>> + Clone {
    filter(|c: &char| c.is_ascii_hexdigit())
        .repeated()
        .exactly(2)
        .collect::<String>()
        .try_map(|s, span| {
            u8::from_str_radix(&s, 16).map_err(|e| Simple::custom(span, e.to_string()))
        })
}

/// parses an attribute value inside an RDN
fn attribute_value_parser() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    let escaped = just('\\').ignore_then(
        hex_pair_parser()
            .map(|b| ValuePiece::Escaped(vec![b]))
            .or(any().map(|c: char| ValuePiece::Escaped(c.to_string().into_bytes()))),
    );
    let plain = filter(|c: &char| !matches!(c, ',' | '+' | ';' | '\\')).map(ValuePiece::Plain);
    escaped
        .or(plain)
        .repeated()
        .try_map(|pieces, span| assemble_value(pieces).map_err(|e| Simple::custom(span, e)))
}

/// parses an attribute type name or numeric OID
pub(crate) fn attribute_type_parser() -> impl Parser<char, String, Error = Simple<char>> + Clone
{
    filter(|c: &char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ';' | '_'))
        .repeated()
        .at_least(1)
        .collect::<String>()
}

/// parses a (possibly multi-valued) RDN
fn rdn_parser() -> impl Parser<char, Rdn, Error = Simple<char>> + Clone {
    let ava = just(' ')
        .repeated()
        .ignore_then(attribute_type_parser())
        .then_ignore(just(' ').repeated())
        .then_ignore(just('='))
        .then(attribute_value_parser())
        .map(|(attribute_type, value)| Ava::new(attribute_type, value));
    ava.separated_by(just('+')).at_least(1).map(Rdn::from_avas)
}

/// parses a complete DN, the empty string being the root DSE
fn dn_parser() -> impl Parser<char, Vec<Rdn>, Error = Simple<char>> {
    rdn_parser()
        .separated_by(just(',').or(just(';')))
        .then_ignore(end())
}

/// normalize an attribute value for case-insensitive comparison
///
/// this approximates caseIgnoreMatch: leading, trailing and repeated inner
/// whitespace is insignificant
pub fn normalize_value(value: &str) -> String {
    itertools::join(value.split_whitespace(), " ").to_lowercase()
}

/// a single attribute value assertion inside an RDN
#[derive(Debug, Clone)]
pub struct Ava {
    /// the attribute type as written by the client
    attribute_type: String,
    /// the attribute value as written by the client (unescaped)
    value: String,
    /// lowercased attribute type
    normalized_type: String,
    /// normalized value
    normalized_value: String,
}

impl Ava {
    /// create a new attribute value assertion
    pub fn new(attribute_type: impl Into<String>, value: impl Into<String>) -> Self {
        let attribute_type = attribute_type.into();
        let value = value.into();
        Self {
            normalized_type: attribute_type.to_lowercase(),
            normalized_value: normalize_value(&value),
            attribute_type,
            value,
        }
    }

    /// the attribute type as provided
    pub fn attribute_type(&self) -> &str {
        &self.attribute_type
    }

    /// the attribute value as provided
    pub fn value(&self) -> &str {
        &self.value
    }

    /// the normalized `type=value` form
    fn normalized(&self) -> String {
        format!(
            "{}={}",
            self.normalized_type,
            ldap3::dn_escape(self.normalized_value.as_str())
        )
    }
}

impl PartialEq for Ava {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_type == other.normalized_type
            && self.normalized_value == other.normalized_value
    }
}

impl Eq for Ava {}

impl Display for Ava {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}={}",
            self.attribute_type,
            ldap3::dn_escape(self.value.as_str())
        )
    }
}

/// a relative distinguished name, one naming component of a DN
#[derive(Debug, Clone)]
pub struct Rdn {
    /// the attribute value assertions in the order given
    avas: Vec<Ava>,
    /// the normalized form with the assertions sorted
    normalized: String,
}

impl Rdn {
    /// build an RDN from its attribute value assertions
    pub fn from_avas(avas: Vec<Ava>) -> Self {
        let mut parts: Vec<String> = avas.iter().map(Ava::normalized).collect();
        parts.sort();
        Self {
            normalized: parts.join("+"),
            avas,
        }
    }

    /// a single-valued RDN
    pub fn single(attribute_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_avas(vec![Ava::new(attribute_type, value)])
    }

    /// parse an RDN such as `cn=robert` or `cn=a+sn=b`
    pub fn parse(src: &str) -> Result<Self, ChumskyError> {
        rdn_parser()
            .then_ignore(end())
            .parse(src)
            .map_err(|errors| ChumskyError {
                description: "relative distinguished name".to_string(),
                source: src.to_string(),
                errors,
            })
    }

    /// the attribute value assertions of this RDN
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// the normalized string form
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Rdn {}

impl Display for Rdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", itertools::join(self.avas.iter(), "+"))
    }
}

/// a distinguished name
///
/// `rdns[0]` is the leaf-most component, the root DSE has no components
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct Dn {
    /// the naming components, leaf first
    rdns: Vec<Rdn>,
    /// the normalized string form used for comparison, hashing and ordering
    normalized: String,
}

impl Dn {
    /// the empty DN of the root DSE
    pub fn root() -> Self {
        Self::from_rdns(Vec::new())
    }

    /// build a DN from its RDNs, leaf first
    pub fn from_rdns(rdns: Vec<Rdn>) -> Self {
        let normalized = itertools::join(rdns.iter().map(Rdn::normalized), ",");
        Self { rdns, normalized }
    }

    /// parse a DN string
    pub fn parse(src: &str) -> Result<Self, ChumskyError> {
        dn_parser()
            .parse(src)
            .map(Self::from_rdns)
            .map_err(|errors| ChumskyError {
                description: "distinguished name".to_string(),
                source: src.to_string(),
                errors,
            })
    }

    /// whether this is the root DSE
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// the naming components, leaf first
    pub fn rdns(&self) -> &[Rdn] {
        &self.rdns
    }

    /// the number of naming components
    pub fn len(&self) -> usize {
        self.rdns.len()
    }

    /// whether there are no naming components (same as [Dn::is_root])
    pub fn is_empty(&self) -> bool {
        self.rdns.is_empty()
    }

    /// the leaf-most RDN
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// the parent DN, `None` for the root DSE
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Self::from_rdns(self.rdns[1..].to_vec()))
        }
    }

    /// all strict ancestors, nearest first, ending with the root DSE
    pub fn ancestors(&self) -> impl Iterator<Item = Dn> + '_ {
        (1..=self.rdns.len()).map(move |i| Self::from_rdns(self.rdns[i..].to_vec()))
    }

    /// the DN of a child entry with the given RDN
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Self::from_rdns(rdns)
    }

    /// whether this DN is equal to or below `ancestor`
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        if ancestor.rdns.len() > self.rdns.len() {
            return false;
        }
        let offset = self.rdns.len() - ancestor.rdns.len();
        self.rdns[offset..]
            .iter()
            .zip(ancestor.rdns.iter())
            .all(|(a, b)| a == b)
    }

    /// whether this DN is strictly below `ancestor`
    pub fn is_strict_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.is_descendant_of(ancestor)
    }

    /// whether this DN is the immediate parent of `other`
    pub fn is_parent_of(&self, other: &Dn) -> bool {
        other.rdns.len() == self.rdns.len() + 1 && other.is_descendant_of(self)
    }

    /// move this DN from below `old_base` to below `new_base`
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_descendant_of(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Self::from_rdns(rdns))
    }

    /// the normalized string form
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl Default for Dn {
    fn default() -> Self {
        Self::root()
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", itertools::join(self.rdns.iter(), ","))
    }
}

impl TryFrom<String> for Dn {
    type Error = ChumskyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Dn::parse(&value)
    }
}

impl FromStr for Dn {
    type Err = ChumskyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dn::parse(s)
    }
}
