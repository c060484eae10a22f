//! Compiled schema
//!
//! The live, read-only materialization of a `SchemaModel`: per type the full
//! inherited property set, methods and views, plus relationship descriptors
//! and the subtype index. A `CompiledSchema` is never mutated after
//! compilation; schema changes produce a new one that is swapped in whole.

use crate::property::PropertyDescriptor;
use crate::schema::{Cardinality, SchemaError, SchemaModel};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Property descriptors of one type, keyed by name
pub type PropertyMap = BTreeMap<String, Arc<dyn PropertyDescriptor>>;

/// A schema method resolved for a concrete type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// `DeclaringType.name`
    pub id: String,
    pub name: String,
    pub declaring_type: String,
    pub source: String,
    pub is_static: bool,
    pub parameters: Option<String>,
}

/// Everything known about a node type after inheritance resolution
#[derive(Debug)]
pub struct TypeDescriptor {
    pub name: String,
    pub extends: Option<String>,
    pub is_abstract: bool,
    pub is_builtin: bool,
    /// The type itself first, then its supertypes up to the root
    pub ancestors: Vec<String>,
    pub properties: PropertyMap,
    pub methods: BTreeMap<String, MethodDescriptor>,
    pub views: BTreeMap<String, Vec<String>>,
}

impl TypeDescriptor {
    pub fn property(&self, name: &str) -> Option<&Arc<dyn PropertyDescriptor>> {
        self.properties.get(name)
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn view(&self, name: &str) -> Option<&[String]> {
        self.views.get(name).map(Vec::as_slice)
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.ancestors.iter().any(|a| a == type_name)
    }
}

/// A compiled relationship type
#[derive(Debug)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub source_type: String,
    pub target_type: String,
    pub rel: String,
    pub cardinality: Cardinality,
    pub properties: PropertyMap,
    pub views: BTreeMap<String, Vec<String>>,
}

/// One row of the schema property listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyListing {
    pub name: String,
    pub declaring_class: String,
    pub is_selected: bool,
    pub property_type: String,
    pub not_null: bool,
    pub unique: bool,
    pub indexed: bool,
    pub is_collection: bool,
    pub is_part_of_built_in_schema: bool,
    pub is_dynamic: bool,
}

#[derive(Debug)]
pub struct CompiledSchema {
    model: SchemaModel,
    types: BTreeMap<String, TypeDescriptor>,
    relationships: BTreeMap<String, RelationshipDescriptor>,
    subtypes: HashMap<String, Vec<String>>,
    date_format: String,
}

impl CompiledSchema {
    pub(crate) fn new(
        model: SchemaModel,
        types: BTreeMap<String, TypeDescriptor>,
        relationships: BTreeMap<String, RelationshipDescriptor>,
        date_format: String,
    ) -> Self {
        let mut subtypes: HashMap<String, Vec<String>> = HashMap::new();
        for descriptor in types.values() {
            for ancestor in &descriptor.ancestors {
                subtypes
                    .entry(ancestor.clone())
                    .or_default()
                    .push(descriptor.name.clone());
            }
        }

        Self {
            model,
            types,
            relationships,
            subtypes,
            date_format,
        }
    }

    /// The model this schema was compiled from, with enums resolved
    pub fn model(&self) -> &SchemaModel {
        &self.model
    }

    pub fn date_format(&self) -> &str {
        &self.date_format
    }

    pub fn type_descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.values()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.get(name)
    }

    /// The type and every type extending it, directly or not
    pub fn subtypes_of(&self, name: &str) -> &[String] {
        self.subtypes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Properties of a node type or relationship type
    pub fn properties_of(&self, type_name: &str) -> Option<&PropertyMap> {
        self.types
            .get(type_name)
            .map(|t| &t.properties)
            .or_else(|| self.relationships.get(type_name).map(|r| &r.properties))
    }

    pub fn property(&self, type_name: &str, name: &str) -> Option<&Arc<dyn PropertyDescriptor>> {
        self.properties_of(type_name)?.get(name)
    }

    pub fn view_members(&self, type_name: &str, view: &str) -> Option<&[String]> {
        let views = self
            .types
            .get(type_name)
            .map(|t| &t.views)
            .or_else(|| self.relationships.get(type_name).map(|r| &r.views))?;
        views.get(view).map(Vec::as_slice)
    }

    pub fn method(&self, type_name: &str, name: &str) -> Option<&MethodDescriptor> {
        self.types.get(type_name)?.method(name)
    }

    /// Look up the schema method behind a `Type.method` id
    pub fn code_source(&self, method_id: &str) -> Option<&MethodDescriptor> {
        let (type_name, name) = method_id.rsplit_once('.')?;
        self.method(type_name, name)
            .filter(|method| method.id == method_id)
    }

    /// Property listing of a type; `view` marks the selected members
    pub fn list_properties(&self, type_name: &str, view: Option<&str>) -> Result<Vec<PropertyListing>, SchemaError> {
        let properties = self
            .properties_of(type_name)
            .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
        let selected = view.and_then(|view| self.view_members(type_name, view));

        Ok(properties
            .values()
            .map(|descriptor| {
                let info = descriptor.info();
                PropertyListing {
                    name: info.name.clone(),
                    declaring_class: info.declaring_type.clone(),
                    is_selected: selected.is_some_and(|members| members.contains(&info.name)),
                    property_type: info.kind_name.clone(),
                    not_null: info.required,
                    unique: info.unique,
                    indexed: info.indexed,
                    is_collection: info.is_collection,
                    is_part_of_built_in_schema: info.is_builtin,
                    is_dynamic: info.is_dynamic(),
                }
            })
            .collect())
    }
}
