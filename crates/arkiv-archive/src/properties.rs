//! Product property documents.
//!
//! A product is a set of namespaces, each mapping property identifiers to
//! typed values. Every product carries the mandatory `core` namespace with
//! the identity and lifecycle fields the coordinator maintains.

use std::collections::BTreeMap;

use arkiv_expr::{DataType, NamespaceSchema, Value};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Properties of a single namespace.
pub type PropertyMap = BTreeMap<String, Value>;

/// A product property document: namespace name to property map.
///
/// A property set to [`Value::Null`] means "clear this property"; the
/// accessors below treat `Null` the same as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    namespaces: BTreeMap<String, PropertyMap>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(&self, namespace: &str) -> Option<&PropertyMap> {
        self.namespaces.get(namespace)
    }

    pub fn namespace_mut(&mut self, namespace: &str) -> &mut PropertyMap {
        self.namespaces.entry(namespace.to_string()).or_default()
    }

    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyMap)> {
        self.namespaces
            .iter()
            .map(|(name, properties)| (name.as_str(), properties))
    }

    /// Raw property access, `Null` included.
    pub fn get(&self, namespace: &str, name: &str) -> Option<&Value> {
        self.namespaces.get(namespace)?.get(name)
    }

    /// Property access treating `Null` as absent.
    pub fn get_defined(&self, namespace: &str, name: &str) -> Option<&Value> {
        self.get(namespace, name).filter(|value| !value.is_null())
    }

    pub fn set(&mut self, namespace: &str, name: &str, value: Value) {
        self.namespace_mut(namespace).insert(name.to_string(), value);
    }

    pub fn set_core(&mut self, name: &str, value: Value) {
        self.set("core", name, value);
    }

    pub fn remove(&mut self, namespace: &str, name: &str) -> Option<Value> {
        self.namespaces.get_mut(namespace)?.remove(name)
    }

    /// Overlay `other` onto this document, property by property.
    pub fn merge(&mut self, other: &Properties) {
        for (namespace, properties) in other.iter() {
            let target = self.namespace_mut(namespace);
            for (name, value) in properties {
                target.insert(name.clone(), value.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Typed core accessors
    // ------------------------------------------------------------------

    pub fn uuid(&self) -> Result<Uuid> {
        match self.get_defined("core", "uuid") {
            Some(Value::Uuid(uuid)) => Ok(*uuid),
            _ => Err(Error::Internal(
                "product properties missing core.uuid".to_string(),
            )),
        }
    }

    pub fn product_name(&self) -> Result<&str> {
        match self.get_defined("core", "product_name") {
            Some(Value::Text(name)) => Ok(name),
            _ => Err(Error::Internal(
                "product properties missing core.product_name".to_string(),
            )),
        }
    }

    pub fn product_type(&self) -> Result<&str> {
        match self.get_defined("core", "product_type") {
            Some(Value::Text(product_type)) => Ok(product_type),
            _ => Err(Error::Internal(
                "product properties missing core.product_type".to_string(),
            )),
        }
    }

    pub fn active(&self) -> bool {
        matches!(self.get_defined("core", "active"), Some(Value::Boolean(true)))
    }

    pub fn archive_path(&self) -> Option<&str> {
        match self.get_defined("core", "archive_path") {
            Some(Value::Text(path)) => Some(path),
            _ => None,
        }
    }

    pub fn physical_name(&self) -> Option<&str> {
        match self.get_defined("core", "physical_name") {
            Some(Value::Text(name)) => Some(name),
            _ => None,
        }
    }

    pub fn hash(&self) -> Option<&str> {
        match self.get_defined("core", "hash") {
            Some(Value::Text(hash)) => Some(hash),
            _ => None,
        }
    }

    pub fn remote_url(&self) -> Option<&str> {
        match self.get_defined("core", "remote_url") {
            Some(Value::Text(url)) => Some(url),
            _ => None,
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self.get_defined("core", "size") {
            Some(Value::Integer(size)) => Some(*size),
            _ => None,
        }
    }

    pub fn archive_date(&self) -> Option<NaiveDateTime> {
        match self.get_defined("core", "archive_date") {
            Some(Value::Timestamp(date)) => Some(*date),
            _ => None,
        }
    }

    /// `'product_name' (uuid)` rendering used in error messages.
    pub fn display_name(&self) -> String {
        let name = self.product_name().unwrap_or("?");
        let uuid = self
            .uuid()
            .map(|uuid| uuid.to_string())
            .unwrap_or_else(|_| "?".to_string());
        format!("'{name}' ({uuid})")
    }
}

/// Schema of the mandatory `core` namespace.
pub fn core_schema() -> NamespaceSchema {
    let mut schema = NamespaceSchema::new();
    schema.insert("uuid".to_string(), DataType::Uuid);
    schema.insert("active".to_string(), DataType::Boolean);
    schema.insert("hash".to_string(), DataType::Text);
    schema.insert("size".to_string(), DataType::Long);
    schema.insert("metadata_date".to_string(), DataType::Timestamp);
    schema.insert("archive_date".to_string(), DataType::Timestamp);
    schema.insert("archive_path".to_string(), DataType::Text);
    schema.insert("physical_name".to_string(), DataType::Text);
    schema.insert("product_type".to_string(), DataType::Text);
    schema.insert("product_name".to_string(), DataType::Text);
    schema.insert("remote_url".to_string(), DataType::Text);
    schema.insert("validity_start".to_string(), DataType::Timestamp);
    schema.insert("validity_stop".to_string(), DataType::Timestamp);
    schema.insert("footprint".to_string(), DataType::Geometry);
    schema
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reads_as_undefined() {
        let mut properties = Properties::new();
        properties.set_core("archive_path", Value::Text("a/b".to_string()));
        assert_eq!(properties.archive_path(), Some("a/b"));
        properties.set_core("archive_path", Value::Null);
        assert_eq!(properties.archive_path(), None);
        assert!(properties.get("core", "archive_path").is_some());
    }

    #[test]
    fn merge_overlays_per_property() {
        let mut base = Properties::new();
        base.set_core("product_name", "p".into());
        base.set_core("size", 10i64.into());

        let mut update = Properties::new();
        update.set_core("size", 20i64.into());
        update.set("station", "elevation", 1.5.into());

        base.merge(&update);
        assert_eq!(base.size(), Some(20));
        assert_eq!(base.product_name().unwrap(), "p");
        assert_eq!(base.get_defined("station", "elevation"), Some(&Value::Real(1.5)));
    }
}
