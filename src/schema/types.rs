//! Schema model definitions
//!
//! The authoritative, user-editable description of types, properties,
//! methods, views and relationships. Everything else (compiled descriptors,
//! the canonical JSON document, the REST surface) is derived from it.

use crate::schema::SchemaError;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Name of the view every type gets implicitly
pub const PUBLIC_VIEW: &str = "public";

/// Complete schema: types and relationships keyed by name
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaModel {
    pub types: BTreeMap<String, SchemaType>,
    pub relationships: BTreeMap<String, SchemaRelationship>,
}

/// A node type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaType {
    pub name: String,
    /// Single supertype, if any
    pub extends: Option<String>,
    pub is_abstract: bool,
    /// Part of the built-in schema; cannot be removed or redefined by imports
    pub is_builtin: bool,
    pub properties: BTreeMap<String, SchemaProperty>,
    pub methods: BTreeMap<String, SchemaMethod>,
    /// View name to ordered property names
    pub views: BTreeMap<String, Vec<String>>,
}

/// A declared property
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaProperty {
    pub name: String,
    pub kind: PropertyKind,
    pub constraints: Constraints,
}

/// Validation and formatting constraints of a property
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constraints {
    pub required: bool,
    pub unique: bool,
    pub indexed: bool,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub exclusive_minimum: bool,
    pub exclusive_maximum: bool,
    /// Default value in input form, applied on create
    pub default_value: Option<String>,
    pub content_type: Option<String>,
    /// Format hint (date pattern for dates); derived for enums, never authored
    pub format: Option<String>,
    /// Lowercase string values on write
    pub lowercase: bool,
}

/// Declared value kind of a property
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Date,
    Enum(EnumSource),
    /// Computed property; `read_function` is evaluated on read
    Function {
        read_function: Option<String>,
        write_function: Option<String>,
    },
    Array(ElementKind),
    /// Projection of a related entity through one or more of its properties
    Notion(NotionSpec),
}

/// Element kind of array properties
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    String,
    Integer,
    Long,
    Double,
    Boolean,
}

/// Where an enum property gets its allowed values from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnumSource {
    /// Explicit value set
    Values(Vec<String>),
    /// Fully-qualified name of an externally registered enum type
    External(String),
    /// Neither was authored; resolved against the registered schema at compile time
    Unresolved,
}

/// Notion configuration: which relationship accessor it wraps and which
/// keys of the related entity it projects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionSpec {
    /// Relationship accessor on the same type
    pub base: String,
    /// Projected keys; one key projects a scalar, several project a map
    pub keys: Vec<String>,
    pub create_if_missing: bool,
}

/// A schema method; the source is a general-purpose script
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaMethod {
    pub name: String,
    pub source: String,
    pub is_static: bool,
    /// Parameter signature, e.g. `String, int`
    pub parameters: Option<String>,
}

/// A relationship definition between two node types
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaRelationship {
    pub name: String,
    pub source_type: String,
    pub target_type: String,
    /// Relationship label
    pub rel: String,
    pub cardinality: Cardinality,
    /// Accessor generated on the target type
    pub source_name: String,
    /// Accessor generated on the source type
    pub target_name: String,
    pub cascading_create: Cascade,
    pub cascading_delete: Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Cascading policy for create/delete across a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cascade {
    #[default]
    None,
    SourceToTarget,
    TargetToSource,
    Always,
}

impl SchemaModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in base schema every dynamic schema extends
    pub fn builtin() -> Self {
        let mut model = Self::new();

        let node = model.add_type("AbstractNode");
        node.is_abstract = true;
        node.is_builtin = true;
        node.add_property("id", PropertyKind::String).constraints.unique = true;
        node.add_property("type", PropertyKind::String).constraints.indexed = true;
        node.add_property("name", PropertyKind::String).constraints.indexed = true;
        node.add_property("createdDate", PropertyKind::Date);
        node.add_property("lastModifiedDate", PropertyKind::Date);
        node.add_to_view(PUBLIC_VIEW, &["id", "type", "name"]);

        let principal = model.add_type("Principal");
        principal.extends = Some("AbstractNode".to_string());
        principal.is_builtin = true;
        principal.add_property("eMail", PropertyKind::String).constraints.unique = true;
        principal.add_property("isAdmin", PropertyKind::Boolean);

        model
    }

    /// Get or create a type
    pub fn add_type(&mut self, name: &str) -> &mut SchemaType {
        self.types
            .entry(name.to_string())
            .or_insert_with(|| SchemaType::new(name))
    }

    pub fn get_type(&self, name: &str) -> Option<&SchemaType> {
        self.types.get(name)
    }

    pub fn get_type_mut(&mut self, name: &str) -> Option<&mut SchemaType> {
        self.types.get_mut(name)
    }

    /// Remove a dynamic type together with the relationships that reference it
    pub fn remove_type(&mut self, name: &str) -> Result<SchemaType, SchemaError> {
        match self.types.get(name) {
            None => return Err(SchemaError::UnknownType(name.to_string())),
            Some(t) if t.is_builtin => return Err(SchemaError::BuiltinType(name.to_string())),
            Some(_) => {}
        }
        self.relationships
            .retain(|_, r| r.source_type != name && r.target_type != name);
        self.types
            .remove(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))
    }

    /// Add a relationship with default naming and return it for customisation
    pub fn relate(
        &mut self,
        source: &str,
        rel: &str,
        target: &str,
        cardinality: Cardinality,
    ) -> &mut SchemaRelationship {
        let relationship = SchemaRelationship::new(source, rel, target, cardinality);
        match self.relationships.entry(relationship.name.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(relationship);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(relationship),
        }
    }

    /// Merge another model into this one. Types and relationships of
    /// `other` replace those with the same name; built-in types are kept.
    pub fn merge(&mut self, other: SchemaModel) -> Result<(), SchemaError> {
        for (name, schema_type) in other.types {
            if let Some(existing) = self.types.get(&name) {
                if existing.is_builtin && existing != &schema_type {
                    return Err(SchemaError::BuiltinType(name));
                }
            }
            self.types.insert(name, schema_type);
        }
        self.relationships.extend(other.relationships);
        Ok(())
    }

    /// Relationships in which the type takes part, on either side
    pub fn relationships_of<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a SchemaRelationship> {
        self.relationships
            .values()
            .filter(move |r| r.source_type == type_name || r.target_type == type_name)
    }
}

impl SchemaType {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn extending(&mut self, supertype: &str) -> &mut Self {
        self.extends = Some(supertype.to_string());
        self
    }

    /// Get or create a property; re-adding replaces its kind
    pub fn add_property(&mut self, name: &str, kind: PropertyKind) -> &mut SchemaProperty {
        let property = self
            .properties
            .entry(name.to_string())
            .or_insert_with(|| SchemaProperty::new(name, kind.clone()));
        property.kind = kind;
        property
    }

    /// Append properties to a view, keeping order and skipping duplicates
    pub fn add_to_view(&mut self, view: &str, properties: &[&str]) {
        let members = self.views.entry(view.to_string()).or_default();
        for property in properties {
            if !members.iter().any(|m| m == property) {
                members.push(property.to_string());
            }
        }
    }

    pub fn add_method(&mut self, name: &str, source: &str) -> &mut SchemaMethod {
        self.methods
            .entry(name.to_string())
            .or_insert_with(|| SchemaMethod {
                name: name.to_string(),
                ..Default::default()
            })
            .with_source(source)
    }

    /// Required property names in canonical (name) order
    pub fn required(&self) -> Vec<&str> {
        self.properties
            .values()
            .filter(|p| p.constraints.required)
            .map(|p| p.name.as_str())
            .collect()
    }
}

impl SchemaProperty {
    pub fn new(name: &str, kind: PropertyKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            constraints: Constraints::default(),
        }
    }

    pub fn required(&mut self) -> &mut Self {
        self.constraints.required = true;
        self
    }

    pub fn unique(&mut self) -> &mut Self {
        self.constraints.unique = true;
        self
    }

    pub fn indexed(&mut self) -> &mut Self {
        self.constraints.indexed = true;
        self
    }

    pub fn range(&mut self, minimum: Option<f64>, maximum: Option<f64>) -> &mut Self {
        self.constraints.minimum = minimum;
        self.constraints.maximum = maximum;
        self
    }

    pub fn default_value(&mut self, value: &str) -> &mut Self {
        self.constraints.default_value = Some(value.to_string());
        self
    }

    /// Effective format: derived from the value set for enums, authored otherwise
    pub fn format(&self) -> Option<String> {
        match &self.kind {
            PropertyKind::Enum(source) => source.format(),
            _ => self.constraints.format.clone(),
        }
    }
}

impl EnumSource {
    /// Build from authored parts. Explicit values win; a type reference
    /// given alongside them is ignored.
    pub fn from_parts(values: Option<Vec<String>>, fqcn: Option<String>) -> Self {
        match (values, fqcn) {
            (Some(values), _) if !values.is_empty() => EnumSource::Values(values),
            (_, Some(fqcn)) if !fqcn.trim().is_empty() => EnumSource::External(fqcn),
            _ => EnumSource::Unresolved,
        }
    }

    pub fn values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EnumSource::Values(values.into_iter().map(Into::into).collect())
    }

    /// Comma-joined value set, the only format an enum property has
    pub fn format(&self) -> Option<String> {
        match self {
            EnumSource::Values(values) => Some(values.join(", ")),
            _ => None,
        }
    }
}

impl SchemaMethod {
    fn with_source(&mut self, source: &str) -> &mut Self {
        self.source = source.to_string();
        self
    }

    pub fn static_method(&mut self) -> &mut Self {
        self.is_static = true;
        self
    }

    pub fn parameters(&mut self, signature: &str) -> &mut Self {
        self.parameters = Some(signature.to_string());
        self
    }
}

impl SchemaRelationship {
    /// Relationship with default names: `Source + rel + Target`, the
    /// target role `rel + Target` and the source role `source + Rel`,
    /// pluralised on collection sides.
    pub fn new(source: &str, rel: &str, target: &str, cardinality: Cardinality) -> Self {
        let mut target_name = format!("{}{}", rel, target);
        if cardinality.target_is_many() {
            target_name.push('s');
        }
        let mut source_name = format!("{}{}", lower_first(source), capitalize(rel));
        if cardinality.source_is_many() {
            source_name.push('s');
        }

        Self {
            name: format!("{}{}{}", source, rel, target),
            source_type: source.to_string(),
            target_type: target.to_string(),
            rel: rel.to_string(),
            cardinality,
            source_name,
            target_name,
            cascading_create: Cascade::None,
            cascading_delete: Cascade::None,
        }
    }

    pub fn named(&mut self, source_name: &str, target_name: &str) -> &mut Self {
        self.source_name = source_name.to_string();
        self.target_name = target_name.to_string();
        self
    }

    pub fn cascade(&mut self, create: Cascade, delete: Cascade) -> &mut Self {
        self.cascading_create = create;
        self.cascading_delete = delete;
        self
    }
}

impl Cardinality {
    /// Several sources may point at one target
    pub fn source_is_many(self) -> bool {
        matches!(self, Cardinality::ManyToOne | Cardinality::ManyToMany)
    }

    /// One source may point at several targets
    pub fn target_is_many(self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cardinality::OneToOne => "OneToOne",
            Cardinality::OneToMany => "OneToMany",
            Cardinality::ManyToOne => "ManyToOne",
            Cardinality::ManyToMany => "ManyToMany",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OneToOne" => Some(Cardinality::OneToOne),
            "OneToMany" => Some(Cardinality::OneToMany),
            "ManyToOne" => Some(Cardinality::ManyToOne),
            "ManyToMany" => Some(Cardinality::ManyToMany),
            _ => None,
        }
    }
}

impl Cascade {
    pub fn as_str(self) -> &'static str {
        match self {
            Cascade::None => "none",
            Cascade::SourceToTarget => "sourceToTarget",
            Cascade::TargetToSource => "targetToSource",
            Cascade::Always => "always",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Cascade::None),
            "sourceToTarget" => Some(Cascade::SourceToTarget),
            "targetToSource" => Some(Cascade::TargetToSource),
            "always" => Some(Cascade::Always),
            _ => None,
        }
    }

    /// Whether an operation on the source propagates to the target
    pub fn source_to_target(self) -> bool {
        matches!(self, Cascade::SourceToTarget | Cascade::Always)
    }

    /// Whether an operation on the target propagates to the source
    pub fn target_to_source(self) -> bool {
        matches!(self, Cascade::TargetToSource | Cascade::Always)
    }
}

impl ElementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementKind::String => "string",
            ElementKind::Integer => "integer",
            ElementKind::Long => "long",
            ElementKind::Double => "number",
            ElementKind::Boolean => "boolean",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(ElementKind::String),
            "integer" => Some(ElementKind::Integer),
            "long" => Some(ElementKind::Long),
            "number" => Some(ElementKind::Double),
            "boolean" => Some(ElementKind::Boolean),
            _ => None,
        }
    }
}

pub(crate) fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn lower_first(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relationship_names() {
        let rel = SchemaRelationship::new("Source", "link", "Target", Cardinality::OneToMany);
        assert_eq!(rel.name, "SourcelinkTarget");
        assert_eq!(rel.target_name, "linkTargets");
        assert_eq!(rel.source_name, "sourceLink");

        let rel = SchemaRelationship::new("Task", "owner", "Person", Cardinality::ManyToOne);
        assert_eq!(rel.target_name, "ownerPerson");
        assert_eq!(rel.source_name, "taskOwners");
    }

    #[test]
    fn test_enum_explicit_values_win_over_reference() {
        let source = EnumSource::from_parts(
            Some(vec!["open".to_string(), "closed".to_string()]),
            Some("org.app.Status".to_string()),
        );
        assert_eq!(source, EnumSource::values(["open", "closed"]));
        assert_eq!(source.format().as_deref(), Some("open, closed"));

        assert_eq!(
            EnumSource::from_parts(Some(vec![]), Some("org.app.Status".to_string())),
            EnumSource::External("org.app.Status".to_string())
        );
        assert_eq!(EnumSource::from_parts(None, None), EnumSource::Unresolved);
    }

    #[test]
    fn test_enum_format_is_derived() {
        let mut property = SchemaProperty::new("status", PropertyKind::Enum(EnumSource::values(["a", "b"])));
        property.constraints.format = Some("ignored".to_string());
        assert_eq!(property.format().as_deref(), Some("a, b"));
    }

    #[test]
    fn test_builtin_types_cannot_be_removed() {
        let mut model = SchemaModel::builtin();
        assert!(matches!(
            model.remove_type("Principal"),
            Err(SchemaError::BuiltinType(_))
        ));

        model.add_type("Project").extends = Some("AbstractNode".to_string());
        model.add_type("Task");
        model.relate("Project", "has", "Task", Cardinality::OneToMany);
        model.remove_type("Task").unwrap();
        assert!(model.relationships.is_empty());
    }

    #[test]
    fn test_merge_rejects_builtin_redefinition() {
        let mut model = SchemaModel::builtin();
        let mut other = SchemaModel::new();
        other.add_type("Principal").add_property("nickname", PropertyKind::String);
        assert!(model.merge(other).is_err());
    }

    #[test]
    fn test_view_membership_is_ordered_and_unique() {
        let mut t = SchemaType::new("Project");
        t.add_to_view("ui", &["name", "owner"]);
        t.add_to_view("ui", &["owner", "budget"]);
        assert_eq!(t.views["ui"], vec!["name", "owner", "budget"]);
    }
}
