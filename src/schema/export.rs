//! Canonical JSON schema document
//!
//! `definitions` maps every type and relationship name to its entry. Keys
//! are emitted in a fixed order and optional keys are omitted when they hold
//! their default, so serialize → parse → serialize is byte-identical.
//! Relationship accessors are written on both endpoint types for readers of
//! the document but are regenerated from the relationship entries on parse.

use crate::schema::types::{
    Cardinality, Cascade, Constraints, ElementKind, EnumSource, NotionSpec, PropertyKind, SchemaMethod,
    SchemaModel, SchemaProperty, SchemaRelationship, SchemaType,
};
use crate::schema::SchemaError;
use serde_json::{json, Map, Value as JsonValue};

const DEFINITIONS: &str = "#/definitions/";

/// Serialize the model to its canonical text
pub fn to_canonical_string(model: &SchemaModel) -> Result<String, SchemaError> {
    Ok(serde_json::to_string_pretty(&to_json(model))?)
}

/// Parse a canonical document back into a model
pub fn from_str(text: &str) -> Result<SchemaModel, SchemaError> {
    let document: JsonValue = serde_json::from_str(text)?;
    from_json(&document)
}

/// Build the canonical JSON document
pub fn to_json(model: &SchemaModel) -> JsonValue {
    let mut definitions = Map::new();

    for (name, relationship) in &model.relationships {
        definitions.insert(name.clone(), relationship_to_json(relationship));
    }
    for (name, schema_type) in &model.types {
        definitions.insert(name.clone(), type_to_json(model, schema_type));
    }

    json!({ "definitions": JsonValue::Object(sorted(definitions)) })
}

/// Read a model from a parsed document
pub fn from_json(document: &JsonValue) -> Result<SchemaModel, SchemaError> {
    let definitions = document
        .get("definitions")
        .and_then(JsonValue::as_object)
        .ok_or_else(|| SchemaError::Format("missing `definitions` object".to_string()))?;

    let mut model = SchemaModel::new();
    for (name, entry) in definitions {
        if entry.get("$source").is_some() {
            let relationship = relationship_from_json(name, entry)?;
            model.relationships.insert(name.clone(), relationship);
        } else {
            let schema_type = type_from_json(name, entry)?;
            model.types.insert(name.clone(), schema_type);
        }
    }

    Ok(model)
}

fn type_to_json(model: &SchemaModel, schema_type: &SchemaType) -> JsonValue {
    let mut entry = Map::new();

    if let Some(parent) = &schema_type.extends {
        entry.insert("$extends".to_string(), json!([format!("{}{}", DEFINITIONS, parent)]));
    }
    if schema_type.is_abstract {
        entry.insert("isAbstract".to_string(), JsonValue::Bool(true));
    }
    if schema_type.is_builtin {
        entry.insert("isBuiltinType".to_string(), JsonValue::Bool(true));
    }
    if !schema_type.methods.is_empty() {
        let methods: Vec<JsonValue> = schema_type.methods.values().map(method_to_json).collect();
        entry.insert("methods".to_string(), JsonValue::Array(methods));
    }

    let mut properties = Map::new();
    for (name, property) in &schema_type.properties {
        properties.insert(name.clone(), property_to_json(property));
    }
    for relationship in model.relationships_of(&schema_type.name) {
        if relationship.source_type == schema_type.name {
            properties.insert(
                relationship.target_name.clone(),
                link_to_json(relationship, &relationship.target_type, relationship.cardinality.target_is_many()),
            );
        }
        if relationship.target_type == schema_type.name {
            properties.insert(
                relationship.source_name.clone(),
                link_to_json(relationship, &relationship.source_type, relationship.cardinality.source_is_many()),
            );
        }
    }
    entry.insert("properties".to_string(), JsonValue::Object(sorted(properties)));

    let required = schema_type.required();
    if !required.is_empty() {
        entry.insert("required".to_string(), json!(required));
    }

    entry.insert("type".to_string(), json!("object"));

    if !schema_type.views.is_empty() {
        let views: Map<String, JsonValue> = schema_type
            .views
            .iter()
            .map(|(view, members)| (view.clone(), json!(members)))
            .collect();
        entry.insert("views".to_string(), JsonValue::Object(sorted(views)));
    }

    JsonValue::Object(sorted(entry))
}

fn link_to_json(relationship: &SchemaRelationship, other: &str, many: bool) -> JsonValue {
    let reference = format!("{}{}", DEFINITIONS, other);
    let link = format!("{}{}", DEFINITIONS, relationship.name);
    if many {
        json!({ "$link": link, "items": { "$ref": reference }, "type": "array" })
    } else {
        json!({ "$link": link, "$ref": reference, "type": "object" })
    }
}

fn method_to_json(method: &SchemaMethod) -> JsonValue {
    let mut entry = Map::new();
    if method.is_static {
        entry.insert("isStatic".to_string(), JsonValue::Bool(true));
    }
    entry.insert("name".to_string(), json!(method.name));
    if let Some(parameters) = &method.parameters {
        entry.insert("parameters".to_string(), json!(parameters));
    }
    entry.insert("source".to_string(), json!(method.source));
    JsonValue::Object(sorted(entry))
}

fn property_to_json(property: &SchemaProperty) -> JsonValue {
    let mut entry = Map::new();

    match &property.kind {
        PropertyKind::String => {
            entry.insert("type".to_string(), json!("string"));
        }
        PropertyKind::Integer => {
            entry.insert("type".to_string(), json!("integer"));
        }
        PropertyKind::Long => {
            entry.insert("type".to_string(), json!("long"));
        }
        PropertyKind::Double => {
            entry.insert("type".to_string(), json!("number"));
        }
        PropertyKind::Boolean => {
            entry.insert("type".to_string(), json!("boolean"));
        }
        PropertyKind::Date => {
            entry.insert("type".to_string(), json!("date"));
        }
        PropertyKind::Enum(source) => {
            entry.insert("type".to_string(), json!("string"));
            match source {
                EnumSource::Values(values) => {
                    entry.insert("enum".to_string(), json!(values));
                }
                EnumSource::External(fqcn) => {
                    entry.insert("fqcn".to_string(), json!(fqcn));
                }
                EnumSource::Unresolved => {
                    entry.insert("enum".to_string(), json!([]));
                }
            }
        }
        PropertyKind::Function {
            read_function,
            write_function,
        } => {
            entry.insert("type".to_string(), json!("function"));
            if let Some(read) = read_function {
                entry.insert("readFunction".to_string(), json!(read));
            }
            if let Some(write) = write_function {
                entry.insert("writeFunction".to_string(), json!(write));
            }
        }
        PropertyKind::Array(element) => {
            entry.insert("type".to_string(), json!("array"));
            entry.insert("items".to_string(), json!({ "type": element.as_str() }));
        }
        PropertyKind::Notion(notion) => {
            entry.insert("type".to_string(), json!("notion"));
            entry.insert("$base".to_string(), json!(notion.base));
            entry.insert("properties".to_string(), json!(notion.keys));
            if notion.create_if_missing {
                entry.insert("createIfMissing".to_string(), JsonValue::Bool(true));
            }
        }
    }

    constraints_to_json(&property.kind, &property.constraints, &mut entry);
    JsonValue::Object(sorted(entry))
}

fn constraints_to_json(kind: &PropertyKind, constraints: &Constraints, entry: &mut Map<String, JsonValue>) {
    if constraints.unique {
        entry.insert("unique".to_string(), JsonValue::Bool(true));
    }
    if constraints.indexed {
        entry.insert("indexed".to_string(), JsonValue::Bool(true));
    }
    if constraints.lowercase {
        entry.insert("lowercase".to_string(), JsonValue::Bool(true));
    }
    if let Some(minimum) = constraints.minimum.and_then(serde_json::Number::from_f64) {
        entry.insert("minimum".to_string(), JsonValue::Number(minimum));
    }
    if let Some(maximum) = constraints.maximum.and_then(serde_json::Number::from_f64) {
        entry.insert("maximum".to_string(), JsonValue::Number(maximum));
    }
    if constraints.exclusive_minimum {
        entry.insert("exclusiveMinimum".to_string(), JsonValue::Bool(true));
    }
    if constraints.exclusive_maximum {
        entry.insert("exclusiveMaximum".to_string(), JsonValue::Bool(true));
    }
    if let Some(default) = &constraints.default_value {
        entry.insert("default".to_string(), json!(default));
    }
    if let Some(content_type) = &constraints.content_type {
        entry.insert("contentType".to_string(), json!(content_type));
    }
    // enum formats are derived from the value set
    if !matches!(kind, PropertyKind::Enum(_)) {
        if let Some(format) = &constraints.format {
            entry.insert("format".to_string(), json!(format));
        }
    }
}

fn relationship_to_json(relationship: &SchemaRelationship) -> JsonValue {
    let mut entry = Map::new();
    entry.insert(
        "$source".to_string(),
        json!(format!("{}{}", DEFINITIONS, relationship.source_type)),
    );
    entry.insert(
        "$target".to_string(),
        json!(format!("{}{}", DEFINITIONS, relationship.target_type)),
    );
    entry.insert("cardinality".to_string(), json!(relationship.cardinality.as_str()));
    if relationship.cascading_create != Cascade::None {
        entry.insert("cascadingCreate".to_string(), json!(relationship.cascading_create.as_str()));
    }
    if relationship.cascading_delete != Cascade::None {
        entry.insert("cascadingDelete".to_string(), json!(relationship.cascading_delete.as_str()));
    }
    entry.insert("rel".to_string(), json!(relationship.rel));
    entry.insert("sourceName".to_string(), json!(relationship.source_name));
    entry.insert("targetName".to_string(), json!(relationship.target_name));
    entry.insert("type".to_string(), json!("object"));
    JsonValue::Object(sorted(entry))
}

fn type_from_json(name: &str, entry: &JsonValue) -> Result<SchemaType, SchemaError> {
    let mut schema_type = SchemaType::new(name);

    if let Some(extends) = entry.get("$extends").and_then(JsonValue::as_array) {
        match extends.as_slice() {
            [] => {}
            [parent] => schema_type.extends = Some(reference_name(name, parent)?),
            _ => {
                return Err(SchemaError::Format(format!(
                    "{}: only single inheritance is supported",
                    name
                )))
            }
        }
    }
    schema_type.is_abstract = flag(entry, "isAbstract");
    schema_type.is_builtin = flag(entry, "isBuiltinType");

    if let Some(methods) = entry.get("methods").and_then(JsonValue::as_array) {
        for method in methods {
            let method = method_from_json(name, method)?;
            schema_type.methods.insert(method.name.clone(), method);
        }
    }

    if let Some(properties) = entry.get("properties").and_then(JsonValue::as_object) {
        for (property_name, property) in properties {
            // relationship accessors are regenerated from the relationship entries
            if property.get("$link").is_some() {
                continue;
            }
            let property = property_from_json(name, property_name, property)?;
            schema_type.properties.insert(property_name.clone(), property);
        }
    }

    if let Some(required) = entry.get("required").and_then(JsonValue::as_array) {
        for property_name in required.iter().filter_map(JsonValue::as_str) {
            match schema_type.properties.get_mut(property_name) {
                Some(property) => property.constraints.required = true,
                None => {
                    return Err(SchemaError::Format(format!(
                        "{}: required property {} is not declared",
                        name, property_name
                    )))
                }
            }
        }
    }

    if let Some(views) = entry.get("views").and_then(JsonValue::as_object) {
        for (view, members) in views {
            let members: Vec<String> = members
                .as_array()
                .map(|m| m.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            schema_type.views.insert(view.clone(), members);
        }
    }

    Ok(schema_type)
}

fn method_from_json(type_name: &str, entry: &JsonValue) -> Result<SchemaMethod, SchemaError> {
    let name = string(entry, "name")
        .ok_or_else(|| SchemaError::Format(format!("{}: method without name", type_name)))?;
    Ok(SchemaMethod {
        name,
        source: string(entry, "source").unwrap_or_default(),
        is_static: flag(entry, "isStatic"),
        parameters: string(entry, "parameters"),
    })
}

fn property_from_json(type_name: &str, name: &str, entry: &JsonValue) -> Result<SchemaProperty, SchemaError> {
    let declared = string(entry, "type").unwrap_or_default();
    let kind = match declared.as_str() {
        "string" if entry.get("enum").is_some() || entry.get("fqcn").is_some() => {
            let values = entry.get("enum").and_then(JsonValue::as_array).map(|values| {
                values
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });
            let fqcn = string(entry, "fqcn");
            if values.as_ref().is_some_and(|v| !v.is_empty()) && fqcn.is_some() {
                tracing::warn!(
                    "⚠️ {}.{} declares both enum values and a type reference; using the values",
                    type_name,
                    name
                );
            }
            PropertyKind::Enum(EnumSource::from_parts(values, fqcn))
        }
        "string" => PropertyKind::String,
        "integer" => PropertyKind::Integer,
        "long" => PropertyKind::Long,
        "number" => PropertyKind::Double,
        "boolean" => PropertyKind::Boolean,
        "date" => PropertyKind::Date,
        "function" => PropertyKind::Function {
            read_function: string(entry, "readFunction"),
            write_function: string(entry, "writeFunction"),
        },
        "array" => {
            let element = entry
                .get("items")
                .and_then(|items| items.get("type"))
                .and_then(JsonValue::as_str)
                .and_then(ElementKind::parse)
                .ok_or_else(|| {
                    SchemaError::Format(format!("{}.{}: array without a supported item type", type_name, name))
                })?;
            PropertyKind::Array(element)
        }
        "notion" => PropertyKind::Notion(NotionSpec {
            base: string(entry, "$base").ok_or_else(|| {
                SchemaError::Format(format!("{}.{}: notion without $base", type_name, name))
            })?,
            keys: entry
                .get("properties")
                .and_then(JsonValue::as_array)
                .map(|keys| keys.iter().filter_map(JsonValue::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
            create_if_missing: flag(entry, "createIfMissing"),
        }),
        other => {
            return Err(SchemaError::Format(format!(
                "{}.{}: unsupported property type `{}`",
                type_name, name, other
            )))
        }
    };

    let constraints = Constraints {
        required: false,
        unique: flag(entry, "unique"),
        indexed: flag(entry, "indexed"),
        minimum: entry.get("minimum").and_then(JsonValue::as_f64),
        maximum: entry.get("maximum").and_then(JsonValue::as_f64),
        exclusive_minimum: flag(entry, "exclusiveMinimum"),
        exclusive_maximum: flag(entry, "exclusiveMaximum"),
        default_value: string(entry, "default"),
        content_type: string(entry, "contentType"),
        format: match kind {
            PropertyKind::Enum(_) => None,
            _ => string(entry, "format"),
        },
        lowercase: flag(entry, "lowercase"),
    };

    Ok(SchemaProperty {
        name: name.to_string(),
        kind,
        constraints,
    })
}

fn relationship_from_json(name: &str, entry: &JsonValue) -> Result<SchemaRelationship, SchemaError> {
    let source = entry
        .get("$source")
        .ok_or_else(|| SchemaError::Format(format!("{}: missing $source", name)))?;
    let target = entry
        .get("$target")
        .ok_or_else(|| SchemaError::Format(format!("{}: missing $target", name)))?;
    let cardinality = string(entry, "cardinality")
        .and_then(|c| Cardinality::parse(&c))
        .ok_or_else(|| SchemaError::Format(format!("{}: missing or unknown cardinality", name)))?;
    let source_type = reference_name(name, source)?;
    let target_type = reference_name(name, target)?;
    let rel = string(entry, "rel").unwrap_or_default();

    let defaults = SchemaRelationship::new(&source_type, &rel, &target_type, cardinality);
    Ok(SchemaRelationship {
        name: name.to_string(),
        source_name: string(entry, "sourceName").unwrap_or(defaults.source_name),
        target_name: string(entry, "targetName").unwrap_or(defaults.target_name),
        cascading_create: cascade(name, entry, "cascadingCreate")?,
        cascading_delete: cascade(name, entry, "cascadingDelete")?,
        source_type,
        target_type,
        rel,
        cardinality,
    })
}

fn cascade(name: &str, entry: &JsonValue, key: &str) -> Result<Cascade, SchemaError> {
    match string(entry, key) {
        None => Ok(Cascade::None),
        Some(value) => Cascade::parse(&value)
            .ok_or_else(|| SchemaError::Format(format!("{}: unknown {} policy `{}`", name, key, value))),
    }
}

fn reference_name(owner: &str, reference: &JsonValue) -> Result<String, SchemaError> {
    reference
        .as_str()
        .and_then(|r| r.strip_prefix(DEFINITIONS))
        .map(str::to_string)
        .ok_or_else(|| SchemaError::Format(format!("{}: invalid reference {}", owner, reference)))
}

fn string(entry: &JsonValue, key: &str) -> Option<String> {
    entry.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

fn flag(entry: &JsonValue, key: &str) -> bool {
    entry.get(key).and_then(JsonValue::as_bool).unwrap_or(false)
}

/// Rebuild a map with keys in lexical order regardless of the map backend
fn sorted(map: Map<String, JsonValue>) -> Map<String, JsonValue> {
    let mut entries: Vec<(String, JsonValue)> = map.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::PUBLIC_VIEW;

    fn sample_model() -> SchemaModel {
        let mut model = SchemaModel::builtin();

        let project = model.add_type("Project");
        project.extends = Some("AbstractNode".to_string());
        project.add_property("name", PropertyKind::String).required();
        project
            .add_property("budget", PropertyKind::Double)
            .range(Some(0.0), Some(1000000.0));
        project.add_property("status", PropertyKind::Enum(EnumSource::values(["open", "closed"])));
        project.add_property("origin", PropertyKind::Enum(EnumSource::External("org.app.Origin".to_string())));
        project.add_property("scores", PropertyKind::Array(ElementKind::Integer));
        project.add_property(
            "summary",
            PropertyKind::Function {
                read_function: Some("${concat(this.name, '!')}".to_string()),
                write_function: None,
            },
        );
        project.add_to_view(PUBLIC_VIEW, &["name", "status"]);
        project.add_method("describe", "return this.name");

        let task = model.add_type("Task");
        task.extends = Some("AbstractNode".to_string());
        task.add_property("priority", PropertyKind::Integer).constraints.exclusive_minimum = true;

        model
            .relate("Project", "has", "Task", Cardinality::OneToMany)
            .named("project", "tasks")
            .cascade(Cascade::None, Cascade::SourceToTarget);
        model
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let model = sample_model();
        let first = to_canonical_string(&model).unwrap();
        let parsed = from_str(&first).unwrap();
        let second = to_canonical_string(&parsed).unwrap();

        assert_eq!(first, second);
        assert_eq!(parsed, model);
    }

    #[test]
    fn test_document_shape() {
        let document = to_json(&sample_model());
        let project = &document["definitions"]["Project"];

        assert_eq!(project["type"], "object");
        assert_eq!(project["$extends"], json!(["#/definitions/AbstractNode"]));
        assert_eq!(project["required"], json!(["name"]));
        assert_eq!(project["properties"]["budget"]["type"], "number");
        assert_eq!(project["properties"]["budget"]["minimum"], json!(0.0));
        assert_eq!(project["properties"]["status"]["enum"], json!(["open", "closed"]));
        assert!(project["properties"]["status"].get("format").is_none());
        assert_eq!(project["properties"]["origin"]["fqcn"], "org.app.Origin");
        assert_eq!(project["properties"]["scores"]["items"]["type"], "integer");
        assert_eq!(
            project["properties"]["summary"]["readFunction"],
            "${concat(this.name, '!')}"
        );
        assert_eq!(project["views"]["public"], json!(["name", "status"]));

        assert_eq!(
            project["properties"]["tasks"],
            json!({
                "$link": "#/definitions/ProjecthasTask",
                "items": { "$ref": "#/definitions/Task" },
                "type": "array"
            })
        );
        assert_eq!(
            document["definitions"]["Task"]["properties"]["project"]["$ref"],
            "#/definitions/Project"
        );

        let rel = &document["definitions"]["ProjecthasTask"];
        assert_eq!(rel["$source"], "#/definitions/Project");
        assert_eq!(rel["$target"], "#/definitions/Task");
        assert_eq!(rel["cardinality"], "OneToMany");
        assert_eq!(rel["rel"], "has");
        assert_eq!(rel["sourceName"], "project");
        assert_eq!(rel["targetName"], "tasks");
        assert_eq!(rel["cascadingDelete"], "sourceToTarget");
        assert!(rel.get("cascadingCreate").is_none());
    }

    #[test]
    fn test_enum_with_values_and_reference_keeps_values() {
        let text = r##"{"definitions":{"Ticket":{"properties":{"state":{"type":"string","enum":["new","done"],"fqcn":"org.app.State"}},"type":"object"}}}"##;
        let model = from_str(text).unwrap();
        assert_eq!(
            model.types["Ticket"].properties["state"].kind,
            PropertyKind::Enum(EnumSource::values(["new", "done"]))
        );
    }

    #[test]
    fn test_enum_without_source_parses_as_unresolved() {
        let text = r##"{"definitions":{"Ticket":{"properties":{"state":{"type":"string","enum":[]}},"type":"object"}}}"##;
        let model = from_str(text).unwrap();
        assert_eq!(
            model.types["Ticket"].properties["state"].kind,
            PropertyKind::Enum(EnumSource::Unresolved)
        );
    }

    #[test]
    fn test_rejects_unknown_property_type() {
        let text = r##"{"definitions":{"Ticket":{"properties":{"x":{"type":"blob"}},"type":"object"}}}"##;
        assert!(matches!(from_str(text), Err(SchemaError::Format(_))));
    }
}
