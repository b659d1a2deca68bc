//! the schema checks the pipeline relies on
//!
//! full schema handling is the job of the schema subsystem; the pipeline only
//! needs to validate a resulting entry and to know which attributes clients
//! may not modify or are obsolete.

use crate::entry::Entry;
use crate::error::DirectoryError;
use crate::result_code::ResultCode;
use std::collections::{HashMap, HashSet};

/// schema checks used by the operation pipeline
pub trait SchemaChecker: std::fmt::Debug + Send + Sync {
    /// validate an entry against the schema
    fn validate_entry(&self, entry: &Entry) -> Result<(), DirectoryError>;

    /// whether clients may not modify the attribute
    fn is_no_user_modification(&self, attribute: &str) -> bool;

    /// whether the attribute type is obsolete
    fn is_obsolete(&self, attribute: &str) -> bool;
}

/// a structural or auxiliary object class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectClassDefinition {
    /// the name
    pub name: String,
    /// the superior class
    pub superior: Option<String>,
    /// the required attributes
    pub must: Vec<String>,
}

impl ObjectClassDefinition {
    /// define an object class
    pub fn new(name: &str, superior: Option<&str>, must: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            superior: superior.map(str::to_string),
            must: must.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// a small schema with object classes, required attributes and attribute
/// flags
///
/// entries must only use known object classes, carry all attributes their
/// classes require (including those of superior classes) and contain the
/// values of their RDN
#[derive(Debug, Clone, Default)]
pub struct BasicSchema {
    /// the object classes keyed by lowercased name
    object_classes: HashMap<String, ObjectClassDefinition>,
    /// lowercased names of attributes clients may not modify
    no_user_modification: HashSet<String>,
    /// lowercased names of obsolete attributes
    obsolete: HashSet<String>,
}

impl BasicSchema {
    /// a schema with common object classes and operational attributes
    pub fn standard() -> Self {
        let mut schema = Self::default();
        for definition in [
            ObjectClassDefinition::new("top", None, &["objectClass"]),
            ObjectClassDefinition::new("extensibleObject", Some("top"), &[]),
            ObjectClassDefinition::new("person", Some("top"), &["sn", "cn"]),
            ObjectClassDefinition::new("organizationalPerson", Some("person"), &[]),
            ObjectClassDefinition::new("inetOrgPerson", Some("organizationalPerson"), &[]),
            ObjectClassDefinition::new("account", Some("top"), &["uid"]),
            ObjectClassDefinition::new("organization", Some("top"), &["o"]),
            ObjectClassDefinition::new("organizationalUnit", Some("top"), &["ou"]),
            ObjectClassDefinition::new("domain", Some("top"), &["dc"]),
            ObjectClassDefinition::new("dcObject", Some("top"), &["dc"]),
            ObjectClassDefinition::new("device", Some("top"), &["cn"]),
            ObjectClassDefinition::new("groupOfNames", Some("top"), &["cn"]),
        ] {
            schema.add_object_class(definition);
        }
        for attribute in [
            "createTimestamp",
            "creatorsName",
            "modifyTimestamp",
            "modifiersName",
            "entryDN",
            "entryUUID",
            "hasSubordinates",
            "numSubordinates",
            "subschemaSubentry",
        ] {
            schema.add_no_user_modification(attribute);
        }
        schema
    }

    /// add or replace an object class
    pub fn add_object_class(&mut self, definition: ObjectClassDefinition) {
        self.object_classes
            .insert(definition.name.to_lowercase(), definition);
    }

    /// mark an attribute as not modifiable by clients
    pub fn add_no_user_modification(&mut self, attribute: &str) {
        self.no_user_modification.insert(attribute.to_lowercase());
    }

    /// mark an attribute as obsolete
    pub fn add_obsolete(&mut self, attribute: &str) {
        self.obsolete.insert(attribute.to_lowercase());
    }

    /// the required attributes of a class and its superiors
    fn required_attributes(&self, object_class: &ObjectClassDefinition) -> Vec<String> {
        let mut required = Vec::new();
        let mut current = Some(object_class);
        let mut seen = HashSet::new();
        while let Some(class) = current {
            if !seen.insert(class.name.to_lowercase()) {
                break;
            }
            required.extend(class.must.iter().cloned());
            current = class
                .superior
                .as_ref()
                .and_then(|s| self.object_classes.get(&s.to_lowercase()));
        }
        required
    }
}

impl SchemaChecker for BasicSchema {
    fn validate_entry(&self, entry: &Entry) -> Result<(), DirectoryError> {
        let object_classes = entry.object_classes();
        if object_classes.is_empty() {
            return Err(DirectoryError::new(
                ResultCode::ObjectclassViolation,
                format!("Entry {} does not have any object classes", entry.dn()),
            ));
        }
        for name in &object_classes {
            let Some(definition) = self.object_classes.get(&name.to_lowercase()) else {
                return Err(DirectoryError::new(
                    ResultCode::ObjectclassViolation,
                    format!(
                        "Entry {} uses the undefined object class {}",
                        entry.dn(),
                        name
                    ),
                ));
            };
            for attribute in self.required_attributes(definition) {
                if !entry.has_attribute(&attribute) {
                    return Err(DirectoryError::new(
                        ResultCode::ObjectclassViolation,
                        format!(
                            "Entry {} is missing attribute {} required by object class {}",
                            entry.dn(),
                            attribute,
                            name
                        ),
                    ));
                }
            }
        }
        if let Some(rdn) = entry.dn().rdn() {
            for ava in rdn.avas() {
                if !entry.has_value(ava.attribute_type(), ava.value()) {
                    return Err(DirectoryError::new(
                        ResultCode::NamingViolation,
                        format!(
                            "Entry {} does not contain its RDN value {}",
                            entry.dn(),
                            ava
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    fn is_no_user_modification(&self, attribute: &str) -> bool {
        self.no_user_modification
            .contains(&attribute.to_lowercase())
    }

    fn is_obsolete(&self, attribute: &str) -> bool {
        self.obsolete.contains(&attribute.to_lowercase())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dn::Dn;

    fn bob() -> Entry {
        Entry::new(Dn::parse("cn=bob,dc=example").unwrap())
            .with_attribute("objectClass", ["top", "person"])
            .with_attribute("cn", ["bob"])
            .with_attribute("sn", ["Builder"])
    }

    #[test]
    fn valid_entry() {
        BasicSchema::standard().validate_entry(&bob()).unwrap();
    }

    #[test]
    fn missing_required_attribute() {
        let mut entry = bob();
        entry.remove_attribute("sn");
        let err = BasicSchema::standard().validate_entry(&entry).unwrap_err();
        assert_eq!(err.result_code, ResultCode::ObjectclassViolation);
    }

    #[test]
    fn inherited_requirements() {
        let entry = Entry::new(Dn::parse("cn=carol,dc=example").unwrap())
            .with_attribute("objectClass", ["top", "inetOrgPerson"])
            .with_attribute("cn", ["carol"]);
        let err = BasicSchema::standard().validate_entry(&entry).unwrap_err();
        assert_eq!(err.result_code, ResultCode::ObjectclassViolation);
    }

    #[test]
    fn rdn_value_must_be_present() {
        let mut entry = bob();
        entry.set_dn(Dn::parse("cn=robert,dc=example").unwrap());
        let err = BasicSchema::standard().validate_entry(&entry).unwrap_err();
        assert_eq!(err.result_code, ResultCode::NamingViolation);
    }

    #[test]
    fn attribute_flags() {
        let mut schema = BasicSchema::standard();
        schema.add_obsolete("oldAttr");
        assert!(schema.is_no_user_modification("CreateTimestamp"));
        assert!(schema.is_obsolete("OLDATTR"));
        assert!(!schema.is_obsolete("cn"));
    }
}
