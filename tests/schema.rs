//! Schema round-trip through storage and the registry, and migration repair

use sqlx::sqlite::SqlitePoolOptions;
use strata::schema::{
    export, Cardinality, Cascade, PropertyKind, SchemaError, SchemaModel, SchemaRegistry, SchemaStorage,
};
use strata::Config;

fn project_model() -> SchemaModel {
    let mut model = SchemaModel::new();
    let project = model.add_type("Project");
    project.extending("AbstractNode");
    project.add_property("code", PropertyKind::String).constraints.unique = true;
    project.add_to_view("public", &["code"]);
    project.add_method("summary", "return this.code");

    model.add_type("Task").extending("AbstractNode");
    model
        .relate("Project", "has", "Task", Cardinality::OneToMany)
        .named("project", "tasks")
        .cascade(Cascade::None, Cascade::SourceToTarget);
    model
}

#[tokio::test]
async fn test_schema_survives_restart() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let config = Config::default();

    let registry = SchemaRegistry::new(&config)
        .unwrap()
        .with_storage(SchemaStorage::new(pool.clone()));
    registry.init_from_storage().await.unwrap();
    registry.replace(project_model()).unwrap();
    assert_eq!(registry.persist().await.unwrap(), Some(1));

    let restarted = SchemaRegistry::new(&config)
        .unwrap()
        .with_storage(SchemaStorage::new(pool));
    restarted.init_from_storage().await.unwrap();

    let schema = restarted.load();
    assert!(schema.property("Project", "tasks").is_some());
    assert!(schema.property("Task", "project").is_some());
    assert!(schema.method("Project", "summary").is_some());
    assert_eq!(
        export::to_canonical_string(schema.model()).unwrap(),
        export::to_canonical_string(registry.load().model()).unwrap()
    );
}

#[test]
fn test_exported_document_imports_unchanged() {
    let registry = SchemaRegistry::new(&Config::default()).unwrap();
    registry.replace(project_model()).unwrap();

    let document = export::to_json(registry.load().model());
    let imported = export::from_json(&document).unwrap();
    let compiled = registry.replace(imported).unwrap();

    assert_eq!(export::to_json(compiled.model()), document);
}

#[test]
fn test_registry_repairs_colliding_methods() {
    let registry = SchemaRegistry::new(&Config::default()).unwrap();

    let mut model = SchemaModel::new();
    model.add_type("Base").extending("AbstractNode").add_method("run", "return 1");
    let sub = model.add_type("Sub").extending("Base");
    sub.add_method("run", "return 2").static_method().parameters("String, int");
    sub.add_method("keep", "return 3");

    let compiled = registry.replace(model).unwrap();
    assert_eq!(compiled.method("Sub", "run").unwrap().declaring_type, "Base");
    assert!(compiled.method("Sub", "keep").is_some());
    assert!(!compiled.model().get_type("Sub").unwrap().methods.contains_key("run"));
}

#[test]
fn test_builtin_types_cannot_be_redefined() {
    let registry = SchemaRegistry::new(&Config::default()).unwrap();

    let mut model = SchemaModel::builtin();
    model
        .get_type_mut("AbstractNode")
        .unwrap()
        .add_property("hacked", PropertyKind::Boolean);

    let err = registry.replace(model).unwrap_err();
    assert!(matches!(err, SchemaError::BuiltinType(ref name) if name == "AbstractNode"));
    assert!(registry.load().property("AbstractNode", "hacked").is_none());
}
