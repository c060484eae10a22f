//! Schema compiler
//!
//! Turns a `SchemaModel` into a `CompiledSchema`. Malformed input (unknown
//! supertypes, inheritance cycles, enums without a source of values) is a
//! configuration error and stops compilation immediately. Inconsistencies
//! that a migration handler may be able to repair are collected as error
//! tokens and returned together as `SchemaError::Compilation`.

use crate::config::DEFAULT_DATE_FORMAT;
use crate::error::ErrorToken;
use crate::graph::Direction;
use crate::property::{
    Converter, Endpoint, EndpointProperty, FunctionProperty, NotionProperty, PropertyDescriptor, RelatedNodeProperty,
    RelationLink, ValueProperty,
};
use crate::schema::compiled::PropertyMap;
use crate::schema::{
    CompiledSchema, EnumSource, MethodDescriptor, PropertyKind, RelationshipDescriptor, SchemaError, SchemaModel,
    SchemaProperty, SchemaRelationship, SchemaType, TypeDescriptor, PUBLIC_VIEW,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Package dynamic types are reported under
pub const DYNAMIC_PACKAGE: &str = "org.strata.dynamic";

/// Fully-qualified class name of a dynamic type
pub fn fqcn(type_name: &str) -> String {
    format!("{}.{}", DYNAMIC_PACKAGE, type_name)
}

/// What the compiler may consult besides the model itself
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileEnv<'a> {
    /// Currently registered model; unresolved enums are looked up here
    pub previous: Option<&'a SchemaModel>,
    /// Externally registered enum types by fully-qualified name
    pub external_enums: Option<&'a HashMap<String, Vec<String>>>,
    /// Pattern for date properties without an explicit format
    pub date_format: Option<&'a str>,
}

impl<'a> CompileEnv<'a> {
    fn enum_values(&self, fqcn: &str) -> Option<&'a Vec<String>> {
        self.external_enums?.get(fqcn)
    }
}

/// Compile a schema model
pub fn compile(model: &SchemaModel, env: &CompileEnv<'_>) -> Result<CompiledSchema, SchemaError> {
    let mut model = model.clone();
    let date_format = env.date_format.unwrap_or(DEFAULT_DATE_FORMAT).to_string();

    check_names(&model)?;
    resolve_enums(&mut model, env)?;
    let order = inheritance_order(&model)?;
    let accessors = relationship_accessors(&model);

    let mut tokens = Vec::new();
    let mut types: BTreeMap<String, TypeDescriptor> = BTreeMap::new();
    for name in &order {
        let Some(schema_type) = model.types.get(name) else {
            continue;
        };
        let parent = schema_type.extends.as_deref().and_then(|p| types.get(p));
        let own_accessors = accessors.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let descriptor = compile_type(schema_type, parent, own_accessors, env, &date_format, &mut tokens)?;
        types.insert(name.clone(), descriptor);
    }

    let relationships: BTreeMap<String, RelationshipDescriptor> = model
        .relationships
        .values()
        .map(|r| (r.name.clone(), compile_relationship(r)))
        .collect();

    if !tokens.is_empty() {
        tracing::warn!("❌ Schema compilation produced {} error(s)", tokens.len());
        return Err(SchemaError::Compilation(tokens));
    }

    tracing::info!(
        "🧩 Compiled schema: {} types, {} relationships",
        types.len(),
        relationships.len()
    );
    Ok(CompiledSchema::new(model, types, relationships, date_format))
}

fn check_names(model: &SchemaModel) -> Result<(), SchemaError> {
    for relationship in model.relationships.values() {
        if model.types.contains_key(&relationship.name) {
            return Err(SchemaError::configuration(
                &relationship.name,
                "relationship name collides with a type name",
            ));
        }
        for endpoint in [&relationship.source_type, &relationship.target_type] {
            if !model.types.contains_key(endpoint) {
                return Err(SchemaError::configuration(
                    &relationship.name,
                    format!("unknown endpoint type {}", endpoint),
                ));
            }
        }
    }
    Ok(())
}

/// Fill in enum values that were not authored, or fail
fn resolve_enums(model: &mut SchemaModel, env: &CompileEnv<'_>) -> Result<(), SchemaError> {
    for schema_type in model.types.values_mut() {
        for property in schema_type.properties.values_mut() {
            let resolved = match &property.kind {
                PropertyKind::Enum(EnumSource::Unresolved) => {
                    let previous = env
                        .previous
                        .and_then(|m| m.get_type(&schema_type.name))
                        .and_then(|t| t.properties.get(&property.name))
                        .and_then(|p| match &p.kind {
                            PropertyKind::Enum(EnumSource::Values(values)) if !values.is_empty() => {
                                Some(values.clone())
                            }
                            _ => None,
                        });
                    match previous {
                        Some(values) => {
                            tracing::debug!(
                                "🔎 Resolved enum {}.{} from the registered schema",
                                schema_type.name,
                                property.name
                            );
                            Some(PropertyKind::Enum(EnumSource::Values(values)))
                        }
                        None => {
                            return Err(SchemaError::configuration(
                                &schema_type.name,
                                format!("Missing enum values for property {}", property.name),
                            ))
                        }
                    }
                }
                PropertyKind::Enum(EnumSource::Values(values)) if values.is_empty() => {
                    return Err(SchemaError::configuration(
                        &schema_type.name,
                        format!("Missing enum values for property {}", property.name),
                    ))
                }
                PropertyKind::Enum(EnumSource::External(name)) if env.enum_values(name).is_none() => {
                    return Err(SchemaError::configuration(
                        &schema_type.name,
                        format!("Unknown enum type {} for property {}", name, property.name),
                    ))
                }
                _ => None,
            };
            if let Some(kind) = resolved {
                property.kind = kind;
            }
        }
    }
    Ok(())
}

/// Type names ordered supertypes first
fn inheritance_order(model: &SchemaModel) -> Result<Vec<String>, SchemaError> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
    for name in model.types.keys() {
        indices.insert(name.as_str(), graph.add_node(name.as_str()));
    }

    for schema_type in model.types.values() {
        let Some(parent) = &schema_type.extends else {
            continue;
        };
        let from = indices.get(parent.as_str()).ok_or_else(|| {
            SchemaError::configuration(&schema_type.name, format!("unknown supertype {}", parent))
        })?;
        let to = indices[schema_type.name.as_str()];
        graph.add_edge(*from, to, ());
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let name = graph[cycle.node_id()];
        tracing::error!("❌ Inheritance cycle through {}", name);
        SchemaError::configuration(name, "inheritance cycle")
    })?;
    Ok(order.into_iter().map(|index| graph[index].to_string()).collect())
}

/// Accessor properties generated on each type by the relationships it takes part in
fn relationship_accessors(model: &SchemaModel) -> HashMap<String, Vec<(String, RelationLink)>> {
    let mut accessors: HashMap<String, Vec<(String, RelationLink)>> = HashMap::new();
    for r in model.relationships.values() {
        accessors.entry(r.source_type.clone()).or_default().push((
            r.target_name.clone(),
            RelationLink {
                relationship: r.name.clone(),
                rel: r.rel.clone(),
                direction: Direction::Outgoing,
                other_type: r.target_type.clone(),
                many: r.cardinality.target_is_many(),
                other_many: r.cardinality.source_is_many(),
                cascade_create: r.cascading_create.source_to_target(),
                cascade_delete: r.cascading_delete.source_to_target(),
            },
        ));
        accessors.entry(r.target_type.clone()).or_default().push((
            r.source_name.clone(),
            RelationLink {
                relationship: r.name.clone(),
                rel: r.rel.clone(),
                direction: Direction::Incoming,
                other_type: r.source_type.clone(),
                many: r.cardinality.source_is_many(),
                other_many: r.cardinality.target_is_many(),
                cascade_create: r.cascading_create.target_to_source(),
                cascade_delete: r.cascading_delete.target_to_source(),
            },
        ));
    }
    accessors
}

fn converter_for(property: &SchemaProperty, env: &CompileEnv<'_>, date_format: &str) -> Option<Converter> {
    Some(match &property.kind {
        PropertyKind::String => Converter::String {
            lowercase: property.constraints.lowercase,
        },
        PropertyKind::Integer => Converter::Integer,
        PropertyKind::Long => Converter::Long,
        PropertyKind::Double => Converter::Double,
        PropertyKind::Boolean => Converter::Boolean,
        PropertyKind::Date => Converter::Date {
            pattern: property
                .constraints
                .format
                .clone()
                .unwrap_or_else(|| date_format.to_string()),
        },
        PropertyKind::Enum(EnumSource::Values(values)) => Converter::Enum(values.clone()),
        PropertyKind::Enum(EnumSource::External(name)) => Converter::Enum(env.enum_values(name)?.clone()),
        PropertyKind::Enum(EnumSource::Unresolved) => return None,
        PropertyKind::Array(element) => Converter::for_element(*element),
        PropertyKind::Function { .. } | PropertyKind::Notion(_) => return None,
    })
}

fn compile_type(
    schema_type: &SchemaType,
    parent: Option<&TypeDescriptor>,
    accessors: &[(String, RelationLink)],
    env: &CompileEnv<'_>,
    date_format: &str,
    tokens: &mut Vec<ErrorToken>,
) -> Result<TypeDescriptor, SchemaError> {
    let name = schema_type.name.as_str();
    let mut ancestors = vec![name.to_string()];
    ancestors.extend(parent.map(|p| p.ancestors.clone()).unwrap_or_default());

    let mut properties: PropertyMap = parent.map(|p| p.properties.clone()).unwrap_or_default();

    for (accessor, link) in accessors {
        if schema_type.properties.contains_key(accessor) || properties.contains_key(accessor) {
            tokens.push(
                ErrorToken::new(name, "ambiguous_role_name")
                    .with_property(accessor)
                    .with_detail(format!(
                        "{} of relationship {} collides with an existing property",
                        accessor, link.relationship
                    )),
            );
            continue;
        }
        properties.insert(
            accessor.clone(),
            Arc::new(RelatedNodeProperty::new(accessor, name, link.clone())),
        );
    }

    for property in schema_type.properties.values() {
        let descriptor: Arc<dyn PropertyDescriptor> = match &property.kind {
            PropertyKind::Function {
                read_function,
                write_function,
            } => Arc::new(FunctionProperty::new(
                &property.name,
                name,
                read_function.clone(),
                write_function.clone(),
                schema_type.is_builtin,
            )),
            PropertyKind::Notion(notion_spec) => {
                if notion_spec.keys.is_empty() {
                    return Err(SchemaError::configuration(
                        name,
                        format!("notion {} projects no keys", property.name),
                    ));
                }
                let link = properties
                    .get(&notion_spec.base)
                    .and_then(|base| base.relation())
                    .ok_or_else(|| {
                        SchemaError::configuration(
                            name,
                            format!("notion {} wraps {}, which is not a relationship property", property.name, notion_spec.base),
                        )
                    })?;
                Arc::new(NotionProperty::new(
                    &property.name,
                    name,
                    &notion_spec.base,
                    notion_spec.keys.clone(),
                    &link.other_type,
                    link.many,
                    notion_spec.create_if_missing,
                ))
            }
            _ => {
                let converter = converter_for(property, env, date_format).ok_or_else(|| {
                    SchemaError::configuration(name, format!("Missing enum values for property {}", property.name))
                })?;
                Arc::new(ValueProperty::new(name, property, converter, schema_type.is_builtin))
            }
        };
        properties.insert(property.name.clone(), descriptor);
    }

    let mut methods = parent.map(|p| p.methods.clone()).unwrap_or_default();
    for method in schema_type.methods.values() {
        if let Some(inherited) = methods.get(&method.name) {
            if inherited.is_static != method.is_static {
                tokens.push(
                    ErrorToken::new(name, "compiler_error").with_detail(format!(
                        "method {}({}) is already defined in class {}",
                        method.name,
                        method.parameters.as_deref().unwrap_or(""),
                        fqcn(name)
                    )),
                );
                continue;
            }
        }
        methods.insert(
            method.name.clone(),
            MethodDescriptor {
                id: format!("{}.{}", name, method.name),
                name: method.name.clone(),
                declaring_type: name.to_string(),
                source: method.source.clone(),
                is_static: method.is_static,
                parameters: method.parameters.clone(),
            },
        );
    }

    let mut views = parent.map(|p| p.views.clone()).unwrap_or_default();
    for (view, members) in &schema_type.views {
        for member in members {
            if !properties.contains_key(member) {
                tokens.push(
                    ErrorToken::new(name, "unknown_view_property")
                        .with_property(member)
                        .with_detail(format!("view {} references unknown property {}", view, member)),
                );
            }
        }
        let merged = views.entry(view.clone()).or_default();
        for member in members {
            if !merged.contains(member) {
                merged.push(member.clone());
            }
        }
    }

    Ok(TypeDescriptor {
        name: name.to_string(),
        extends: schema_type.extends.clone(),
        is_abstract: schema_type.is_abstract,
        is_builtin: schema_type.is_builtin,
        ancestors,
        properties,
        methods,
        views,
    })
}

fn compile_relationship(relationship: &SchemaRelationship) -> RelationshipDescriptor {
    let name = relationship.name.as_str();
    let mut properties: PropertyMap = BTreeMap::new();
    for system in ["id", "type"] {
        let property = SchemaProperty::new(system, PropertyKind::String);
        properties.insert(
            system.to_string(),
            Arc::new(ValueProperty::new(
                name,
                &property,
                Converter::String { lowercase: false },
                true,
            )),
        );
    }
    properties.insert(
        "sourceNode".to_string(),
        Arc::new(EndpointProperty::new(name, Endpoint::Source, &relationship.source_type)),
    );
    properties.insert(
        "targetNode".to_string(),
        Arc::new(EndpointProperty::new(name, Endpoint::Target, &relationship.target_type)),
    );

    let mut views = BTreeMap::new();
    views.insert(
        PUBLIC_VIEW.to_string(),
        ["id", "type", "sourceNode", "targetNode"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );

    RelationshipDescriptor {
        name: name.to_string(),
        source_type: relationship.source_type.clone(),
        target_type: relationship.target_type.clone(),
        rel: relationship.rel.clone(),
        cardinality: relationship.cardinality,
        properties,
        views,
    }
}
