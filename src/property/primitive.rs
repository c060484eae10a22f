//! Stored primitive properties
//!
//! Strings, numbers, booleans, dates, enums and arrays of primitives. The
//! built-in `id` and `type` properties are exposed read-only from the entity
//! itself rather than from its property map.

use crate::graph::Entity;
use crate::property::{Converter, PropertyDescriptor, PropertyError, PropertyInfo, ReadContext, WriteContext};
use crate::schema::{Constraints, SchemaProperty};
use crate::value::Value;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SystemField {
    Id,
    Type,
}

/// A property persisted in the entity's property map
#[derive(Debug)]
pub struct ValueProperty {
    info: PropertyInfo,
    converter: Converter,
    constraints: Constraints,
    system: Option<SystemField>,
}

impl ValueProperty {
    pub fn new(declaring_type: &str, property: &SchemaProperty, converter: Converter, is_builtin: bool) -> Self {
        let mut info = PropertyInfo::new(&property.name, declaring_type, converter.kind_name());
        info.sort_type = converter.sort_type();
        info.is_collection = matches!(converter, Converter::Array(_));
        info.is_builtin = is_builtin;
        info.required = property.constraints.required;
        info.unique = property.constraints.unique;
        info.indexed = property.constraints.indexed || property.constraints.unique;
        info.stored = true;

        let system = match (is_builtin, property.name.as_str()) {
            (true, "id") => Some(SystemField::Id),
            (true, "type") => Some(SystemField::Type),
            _ => None,
        };
        if system.is_some() {
            info.stored = false;
        }

        Self {
            info,
            converter,
            constraints: property.constraints.clone(),
            system,
        }
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    fn check_range(&self, value: &Value) -> Result<(), PropertyError> {
        if let Value::List(items) = value {
            return items.iter().try_for_each(|item| self.check_range(item));
        }
        let Some(number) = value.as_f64().filter(|_| !matches!(value, Value::String(_))) else {
            return Ok(());
        };

        if let Some(minimum) = self.constraints.minimum {
            let below = if self.constraints.exclusive_minimum {
                number <= minimum
            } else {
                number < minimum
            };
            if below {
                return Err(PropertyError::invalid(
                    self.info
                        .token("must_be_greater_than", format!("{} is below {}", number, minimum)),
                ));
            }
        }
        if let Some(maximum) = self.constraints.maximum {
            let above = if self.constraints.exclusive_maximum {
                number >= maximum
            } else {
                number > maximum
            };
            if above {
                return Err(PropertyError::invalid(
                    self.info
                        .token("must_be_less_than", format!("{} is above {}", number, maximum)),
                ));
            }
        }
        Ok(())
    }
}

impl PropertyDescriptor for ValueProperty {
    fn info(&self) -> &PropertyInfo {
        &self.info
    }

    fn read(&self, _ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError> {
        Ok(match self.system {
            Some(SystemField::Id) => Value::String(entity.id.clone()),
            Some(SystemField::Type) => Value::String(entity.type_name.clone()),
            None => self.from_storage_form(entity.property(&self.info.name)),
        })
    }

    fn write(&self, ctx: &mut WriteContext<'_>, entity_id: &str, value: Value) -> Result<(), PropertyError> {
        if self.system.is_some() {
            return Err(PropertyError::ReadOnly(self.info.name.clone()));
        }

        let stored = self.to_storage_form(&value)?;
        if self.info.required && stored.is_none() {
            return Err(PropertyError::invalid(
                self.info.token("must_not_be_empty", "value is required"),
            ));
        }
        self.check_range(&value)?;

        if let (true, Some(candidate)) = (self.info.unique, &stored) {
            let types = ctx.schema.subtypes_of(&self.info.declaring_type);
            let taken = ctx
                .graph
                .find(types, &self.info.name, candidate)
                .iter()
                .any(|other| other.id != entity_id);
            if taken {
                return Err(PropertyError::invalid(
                    self.info
                        .token("already_taken", format!("{} is already in use", candidate)),
                ));
            }
        }

        ctx.graph.set_property(entity_id, &self.info.name, stored)?;
        Ok(())
    }

    fn to_storage_form(&self, value: &Value) -> Result<Option<JsonValue>, PropertyError> {
        self.converter
            .to_storage(value)
            .map_err(|e| PropertyError::invalid(self.info.token(e.token, e.detail)))
    }

    fn from_storage_form(&self, stored: Option<&JsonValue>) -> Value {
        stored
            .map(|stored| self.converter.from_storage(stored))
            .unwrap_or_default()
    }

    fn from_input_form(&self, external: &JsonValue) -> Result<Value, PropertyError> {
        self.converter
            .from_input(external)
            .map_err(|e| PropertyError::invalid(self.info.token(e.token, e.detail)))
    }

    fn default_value(&self) -> Option<&str> {
        self.constraints.default_value.as_deref()
    }
}
