//! search filters in their RFC 4515 string representation
//!
//! used by the search operation and by the assertion control

use crate::dn::{attribute_type_parser, hex_pair_parser, normalize_value};
use crate::entry::Entry;
use chumsky::prelude::*;
use ldap_types::basic::ChumskyError;
use std::cmp::Ordering;
use std::fmt::Display;

/// a parsed search filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// all of the inner filters have to match, `(&)` is absolute true
    And(Vec<SearchFilter>),
    /// at least one of the inner filters has to match, `(|)` is absolute false
    Or(Vec<SearchFilter>),
    /// the inner filter must not match
    Not(Box<SearchFilter>),
    /// `(attr=value)`
    Equality {
        /// attribute type
        attribute: String,
        /// assertion value
        value: String,
    },
    /// `(attr=*)`
    Presence {
        /// attribute type
        attribute: String,
    },
    /// `(attr=initial*any*final)`
    Substring {
        /// attribute type
        attribute: String,
        /// the part the value has to start with
        initial: Option<String>,
        /// parts that have to occur in order
        any: Vec<String>,
        /// the part the value has to end with
        final_part: Option<String>,
    },
    /// `(attr>=value)`
    GreaterOrEqual {
        /// attribute type
        attribute: String,
        /// assertion value
        value: String,
    },
    /// `(attr<=value)`
    LessOrEqual {
        /// attribute type
        attribute: String,
        /// assertion value
        value: String,
    },
    /// `(attr~=value)`
    Approximate {
        /// attribute type
        attribute: String,
        /// assertion value
        value: String,
    },
}

/// the comparison operator of a simple filter item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    /// `=`
    Equal,
    /// `>=`
    GreaterOrEqual,
    /// `<=`
    LessOrEqual,
    /// `~=`
    Approximate,
}

/// build a simple filter item from the segments between the `*` wildcards
fn build_item(
    attribute: String,
    operator: FilterOperator,
    mut segments: Vec<String>,
) -> Result<SearchFilter, String> {
    if segments.len() == 1 {
        let value = segments.remove(0);
        return Ok(match operator {
            FilterOperator::Equal => SearchFilter::Equality { attribute, value },
            FilterOperator::GreaterOrEqual => SearchFilter::GreaterOrEqual { attribute, value },
            FilterOperator::LessOrEqual => SearchFilter::LessOrEqual { attribute, value },
            FilterOperator::Approximate => SearchFilter::Approximate { attribute, value },
        });
    }
    if operator != FilterOperator::Equal {
        return Err(format!(
            "wildcards are only allowed in equality filters, not for attribute {}",
            attribute
        ));
    }
    if segments.len() == 2 && segments.iter().all(String::is_empty) {
        return Ok(SearchFilter::Presence { attribute });
    }
    let final_part = segments.pop().filter(|s| !s.is_empty());
    let initial = Some(segments.remove(0)).filter(|s| !s.is_empty());
    if segments.iter().any(String::is_empty) {
        return Err(format!(
            "empty substring between two wildcards for attribute {}",
            attribute
        ));
    }
    Ok(SearchFilter::Substring {
        attribute,
        initial,
        any: segments,
        final_part,
    })
}

/// parser for a parenthesized filter
fn filter_parser() -> impl Parser<char, SearchFilter, Error = Simple<char>> {
    recursive(|inner| {
        let value_char = just('\\')
            .ignore_then(hex_pair_parser())
            .map(|b| vec![b])
            .or(filter(|c: &char| !matches!(c, '(' | ')' | '*' | '\\'))
                .map(|c: char| c.to_string().into_bytes()));
        let value = value_char
            .repeated()
            .flatten()
            .try_map(|bytes, span| {
                String::from_utf8(bytes).map_err(|e| Simple::custom(span, e.to_string()))
            });
        let operator = just("~=")
            .to(FilterOperator::Approximate)
            .or(just(">=").to(FilterOperator::GreaterOrEqual))
            .or(just("<=").to(FilterOperator::LessOrEqual))
            .or(just('=').to(FilterOperator::Equal));
        let item = attribute_type_parser()
            .then(operator)
            .then(value.separated_by(just('*')).at_least(1))
            .try_map(|((attribute, operator), segments), span| {
                build_item(attribute, operator, segments).map_err(|e| Simple::custom(span, e))
            });
        let and = just('&')
            .ignore_then(inner.clone().repeated())
            .map(SearchFilter::And);
        let or = just('|')
            .ignore_then(inner.clone().repeated())
            .map(SearchFilter::Or);
        let not = just('!')
            .ignore_then(inner)
            .map(|f| SearchFilter::Not(Box::new(f)));
        and.or(or)
            .or(not)
            .or(item)
            .delimited_by(just('('), just(')'))
            .padded()
    })
}

/// escape a filter assertion value
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// compare two values as integers if both are, otherwise as normalized strings
///
/// generalized time values order correctly as strings
fn compare_values(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<i64>(), b.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => normalize_value(a).cmp(&normalize_value(b)),
    }
}

impl SearchFilter {
    /// parse a filter such as `(&(objectClass=person)(uid=a*))`
    ///
    /// a filter without the outer parentheses is accepted as well
    pub fn parse(src: &str) -> Result<Self, ChumskyError> {
        let trimmed = src.trim();
        let to_parse = if trimmed.starts_with('(') {
            trimmed.to_string()
        } else {
            format!("({})", trimmed)
        };
        filter_parser()
            .then_ignore(end())
            .parse(to_parse.as_str())
            .map_err(|errors| ChumskyError {
                description: "search filter".to_string(),
                source: src.to_string(),
                errors,
            })
    }

    /// the filter matching every entry
    pub fn match_all() -> Self {
        SearchFilter::Presence {
            attribute: "objectClass".to_string(),
        }
    }

    /// evaluate the filter against an entry
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            SearchFilter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            SearchFilter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            SearchFilter::Not(f) => !f.matches(entry),
            SearchFilter::Equality { attribute, value } => entry.has_value(attribute, value),
            SearchFilter::Presence { attribute } => entry.has_attribute(attribute),
            SearchFilter::Substring {
                attribute,
                initial,
                any,
                final_part,
            } => entry.get(attribute).is_some_and(|values| {
                values.iter().any(|v| {
                    substring_matches(
                        &normalize_value(v),
                        initial.as_deref(),
                        any,
                        final_part.as_deref(),
                    )
                })
            }),
            SearchFilter::GreaterOrEqual { attribute, value } => entry
                .get(attribute)
                .is_some_and(|values| {
                    values
                        .iter()
                        .any(|v| compare_values(v, value) != Ordering::Less)
                }),
            SearchFilter::LessOrEqual { attribute, value } => entry
                .get(attribute)
                .is_some_and(|values| {
                    values
                        .iter()
                        .any(|v| compare_values(v, value) != Ordering::Greater)
                }),
            SearchFilter::Approximate { attribute, value } => {
                let needle: String = normalize_value(value)
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                entry.get(attribute).is_some_and(|values| {
                    values.iter().any(|v| {
                        normalize_value(v)
                            .chars()
                            .filter(|c| !c.is_whitespace())
                            .collect::<String>()
                            == needle
                    })
                })
            }
        }
    }
}

/// match a normalized value against the parts of a substring filter
fn substring_matches(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    final_part: Option<&str>,
) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        let initial = normalize_value(initial);
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = normalize_value(part);
        match rest.find(part.as_str()) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    if let Some(final_part) = final_part {
        return rest.ends_with(normalize_value(final_part).as_str());
    }
    true
}

impl Display for SearchFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchFilter::And(filters) => {
                write!(f, "(&{})", itertools::join(filters.iter(), ""))
            }
            SearchFilter::Or(filters) => {
                write!(f, "(|{})", itertools::join(filters.iter(), ""))
            }
            SearchFilter::Not(inner) => write!(f, "(!{})", inner),
            SearchFilter::Equality { attribute, value } => {
                write!(f, "({}={})", attribute, escape_value(value))
            }
            SearchFilter::Presence { attribute } => write!(f, "({}=*)", attribute),
            SearchFilter::Substring {
                attribute,
                initial,
                any,
                final_part,
            } => {
                write!(
                    f,
                    "({}={}*",
                    attribute,
                    initial.as_deref().map(escape_value).unwrap_or_default()
                )?;
                for part in any {
                    write!(f, "{}*", escape_value(part))?;
                }
                write!(
                    f,
                    "{})",
                    final_part.as_deref().map(escape_value).unwrap_or_default()
                )
            }
            SearchFilter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_value(value))
            }
            SearchFilter::LessOrEqual { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_value(value))
            }
            SearchFilter::Approximate { attribute, value } => {
                write!(f, "({}~={})", attribute, escape_value(value))
            }
        }
    }
}
