//! applying [ldap3::Mod] modifications to an in-memory [Entry]

use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::result_code::ResultCode;
use ldap3::Mod;
use std::collections::HashSet;

/// how strictly a modification is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// adding an existing value or deleting a missing one is an error
    Strict,
    /// adding an existing value or deleting a missing one is ignored
    ///
    /// used for modifications generated by the server or by plugins
    Lenient,
}

/// the attribute a modification targets
pub fn modification_attribute(modification: &Mod<String>) -> &str {
    match modification {
        Mod::Add(attr, _) | Mod::Delete(attr, _) | Mod::Replace(attr, _) => attr,
        Mod::Increment(attr, _) => attr,
    }
}

/// the values of a set in a stable order
fn sorted_values(values: &HashSet<String>) -> Vec<String> {
    let mut values: Vec<String> = values.iter().cloned().collect();
    values.sort();
    values
}

/// apply a single modification to an entry
pub fn apply_modification(
    entry: &mut Entry,
    modification: &Mod<String>,
    mode: ApplyMode,
) -> Result<(), DirectoryError> {
    match modification {
        Mod::Add(attr, values) => {
            for value in sorted_values(values) {
                if !entry.add_value(attr, value.clone()) && mode == ApplyMode::Strict {
                    return Err(DirectoryError::new(
                        ResultCode::AttributeOrValueExists,
                        format!(
                            "Entry {} already contains value {} for attribute {}",
                            entry.dn(),
                            value,
                            attr
                        ),
                    ));
                }
            }
        }
        Mod::Delete(attr, values) if values.is_empty() => {
            if entry.remove_attribute(attr).is_none() && mode == ApplyMode::Strict {
                return Err(DirectoryError::new(
                    ResultCode::NoSuchAttribute,
                    format!("Entry {} has no attribute {}", entry.dn(), attr),
                ));
            }
        }
        Mod::Delete(attr, values) => {
            for value in sorted_values(values) {
                if !entry.remove_value(attr, &value) && mode == ApplyMode::Strict {
                    return Err(DirectoryError::new(
                        ResultCode::NoSuchAttribute,
                        format!(
                            "Entry {} has no value {} for attribute {}",
                            entry.dn(),
                            value,
                            attr
                        ),
                    ));
                }
            }
        }
        Mod::Replace(attr, values) => {
            entry.replace(attr, sorted_values(values));
        }
        Mod::Increment(attr, amount) => {
            let amount: i64 = amount.trim().parse().map_err(|_| {
                DirectoryError::new(
                    ResultCode::ConstraintViolation,
                    format!(
                        "The increment amount {} for attribute {} is not an integer",
                        amount, attr
                    ),
                )
            })?;
            let Some(current) = entry.get(attr).filter(|v| !v.is_empty()) else {
                return Err(DirectoryError::new(
                    ResultCode::NoSuchAttribute,
                    format!(
                        "Entry {} has no attribute {} to increment",
                        entry.dn(),
                        attr
                    ),
                ));
            };
            let incremented = current
                .iter()
                .map(|v| {
                    v.trim()
                        .parse::<i64>()
                        .map(|n| (n + amount).to_string())
                        .map_err(|_| {
                            DirectoryError::new(
                                ResultCode::ConstraintViolation,
                                format!(
                                    "Value {} of attribute {} is not an integer and cannot be incremented",
                                    v, attr
                                ),
                            )
                        })
                })
                .collect::<Result<Vec<String>, DirectoryError>>()?;
            entry.replace(attr, incremented);
        }
    }
    Ok(())
}

/// apply modifications in order, stopping at the first failure
pub fn apply_modifications(
    entry: &mut Entry,
    modifications: &[Mod<String>],
    mode: ApplyMode,
) -> Result<(), DirectoryError> {
    for modification in modifications {
        apply_modification(entry, modification, mode)?;
    }
    Ok(())
}
