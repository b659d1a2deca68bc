//! in-memory representation of a directory entry

use crate::dn::{normalize_value, Dn};
use lazy_static::lazy_static;
use ldap_types::basic::{ChumskyError, LDAPEntry};
use std::collections::{HashMap, HashSet};

lazy_static! {
    /// lowercased names of the operational attributes maintained by the server
    ///
    /// these are only returned to clients when requested by name or via `+`
    static ref OPERATIONAL_ATTRIBUTES: HashSet<&'static str> = HashSet::from([
        "createtimestamp",
        "creatorsname",
        "modifytimestamp",
        "modifiersname",
        "entrydn",
        "entryuuid",
        "hassubordinates",
        "numsubordinates",
        "subschemasubentry",
        "pwdchangedtime",
        "pwdfailuretime",
        "pwdaccountlockedtime",
        "pwdgraceusetime",
        "pwdreset",
        "ds-pwp-last-login-time",
        "ds-pwp-warned-time",
        "ds-pwp-account-disabled",
        "ds-pwp-account-expiration-time",
        "ds-pwp-password-policy-dn",
        "ds-rlim-size-limit",
        "ds-rlim-time-limit",
    ]);
}

/// whether the attribute is an operational attribute
pub fn is_operational_attribute(name: &str) -> bool {
    OPERATIONAL_ATTRIBUTES.contains(name.to_lowercase().as_str())
}

/// a directory entry
///
/// attribute names are matched case-insensitively but stored with the
/// spelling they were first added with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// the DN of the entry
    dn: Dn,
    /// textual attributes
    attrs: HashMap<String, Vec<String>>,
    /// binary attributes
    bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl Entry {
    /// create an entry without attributes
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attrs: HashMap::new(),
            bin_attrs: HashMap::new(),
        }
    }

    /// builder style helper adding all values of an attribute
    pub fn with_attribute<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for value in values {
            self.add_value(name, value.into());
        }
        self
    }

    /// convert an entry as used by the ldap client utilities
    pub fn from_ldap_entry(entry: LDAPEntry) -> Result<Self, ChumskyError> {
        Ok(Self {
            dn: Dn::parse(&entry.dn)?,
            attrs: entry.attrs,
            bin_attrs: entry.bin_attrs,
        })
    }

    /// convert into an entry as used by the ldap client utilities
    pub fn to_ldap_entry(&self) -> LDAPEntry {
        LDAPEntry {
            dn: self.dn.to_string(),
            attrs: self.attrs.clone(),
            bin_attrs: self.bin_attrs.clone(),
        }
    }

    /// the DN of this entry
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// change the DN of this entry
    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// all textual attributes
    pub fn attributes(&self) -> &HashMap<String, Vec<String>> {
        &self.attrs
    }

    /// all binary attributes
    pub fn binary_attributes(&self) -> &HashMap<String, Vec<Vec<u8>>> {
        &self.bin_attrs
    }

    /// the key under which an attribute is stored, if present
    fn key_for(&self, name: &str) -> Option<String> {
        self.attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// the values of an attribute
    pub fn get(&self, name: &str) -> Option<&Vec<String>> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// the first value of an attribute
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// the values of a binary attribute
    pub fn get_binary(&self, name: &str) -> Option<&Vec<Vec<u8>>> {
        self.bin_attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// whether the attribute has at least one value
    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_empty())
            || self.get_binary(name).is_some_and(|v| !v.is_empty())
    }

    /// whether the attribute contains the value (compared normalized)
    pub fn has_value(&self, name: &str, value: &str) -> bool {
        let needle = normalize_value(value);
        self.get(name)
            .is_some_and(|values| values.iter().any(|v| normalize_value(v) == needle))
    }

    /// add a value, returns false if it was already present
    pub fn add_value(&mut self, name: &str, value: String) -> bool {
        if self.has_value(name, &value) {
            return false;
        }
        let key = self.key_for(name).unwrap_or_else(|| name.to_string());
        self.attrs.entry(key).or_default().push(value);
        true
    }

    /// remove a value, returns false if it was not present
    ///
    /// the attribute is removed entirely once its last value is gone
    pub fn remove_value(&mut self, name: &str, value: &str) -> bool {
        let Some(key) = self.key_for(name) else {
            return false;
        };
        let needle = normalize_value(value);
        let mut removed = false;
        if let Some(values) = self.attrs.get_mut(&key) {
            let before = values.len();
            values.retain(|v| normalize_value(v) != needle);
            removed = values.len() != before;
            if values.is_empty() {
                self.attrs.remove(&key);
            }
        }
        removed
    }

    /// remove an attribute with all its values
    pub fn remove_attribute(&mut self, name: &str) -> Option<Vec<String>> {
        let text = self.key_for(name).and_then(|key| self.attrs.remove(&key));
        let bin_key = self
            .bin_attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        let binary = bin_key.and_then(|key| self.bin_attrs.remove(&key));
        match (text, binary) {
            (Some(values), _) => Some(values),
            (None, Some(_)) => Some(Vec::new()),
            (None, None) => None,
        }
    }

    /// replace all values of an attribute, an empty list removes it
    pub fn replace(&mut self, name: &str, values: Vec<String>) {
        let key = self.key_for(name);
        if values.is_empty() {
            if let Some(key) = key {
                self.attrs.remove(&key);
            }
            return;
        }
        let mut deduplicated: Vec<String> = Vec::with_capacity(values.len());
        for value in values {
            let normalized = normalize_value(&value);
            if !deduplicated
                .iter()
                .any(|v| normalize_value(v) == normalized)
            {
                deduplicated.push(value);
            }
        }
        self.attrs
            .insert(key.unwrap_or_else(|| name.to_string()), deduplicated);
    }

    /// replace all values of a binary attribute, an empty list removes it
    pub fn replace_binary(&mut self, name: &str, values: Vec<Vec<u8>>) {
        let key = self
            .bin_attrs
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        if let Some(key) = &key {
            self.bin_attrs.remove(key);
        }
        if !values.is_empty() {
            self.bin_attrs
                .insert(key.unwrap_or_else(|| name.to_string()), values);
        }
    }

    /// the object classes of the entry
    pub fn object_classes(&self) -> Vec<String> {
        self.get("objectClass").cloned().unwrap_or_default()
    }

    /// whether the entry has the object class
    pub fn has_object_class(&self, object_class: &str) -> bool {
        self.object_classes()
            .iter()
            .any(|oc| oc.eq_ignore_ascii_case(object_class))
    }

    /// a copy of the entry containing only the selected attributes
    ///
    /// an empty selection or `*` selects all user attributes, `+` all
    /// operational attributes, anything else the named attribute
    pub fn select_attributes(&self, selection: &[String]) -> Entry {
        let all_user = selection.is_empty() || selection.iter().any(|a| a == "*");
        let all_operational = selection.iter().any(|a| a == "+");
        let wanted = |name: &str| {
            let operational = is_operational_attribute(name);
            (all_user && !operational)
                || (all_operational && operational)
                || selection.iter().any(|a| a.eq_ignore_ascii_case(name))
        };
        Entry {
            dn: self.dn.clone(),
            attrs: self
                .attrs
                .iter()
                .filter(|(k, _)| wanted(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            bin_attrs: self
                .bin_attrs
                .iter()
                .filter(|(k, _)| wanted(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}
