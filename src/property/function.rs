//! Script-computed properties
//!
//! The value is produced by evaluating `readFunction` with the entity bound
//! as `this`. A `writeFunction`, when present, runs on write with the new
//! value bound as `value`. It persists through the script's graph access on
//! the caller's transaction, or rejects the write by raising an application
//! error.

use crate::graph::Entity;
use crate::property::{PropertyDescriptor, PropertyError, PropertyInfo, ReadContext, WriteContext};
use crate::value::Value;

#[derive(Debug)]
pub struct FunctionProperty {
    info: PropertyInfo,
    read_function: Option<String>,
    write_function: Option<String>,
}

impl FunctionProperty {
    pub fn new(
        name: &str,
        declaring_type: &str,
        read_function: Option<String>,
        write_function: Option<String>,
        is_builtin: bool,
    ) -> Self {
        let mut info = PropertyInfo::new(name, declaring_type, "Function");
        info.is_builtin = is_builtin;
        Self {
            info,
            read_function,
            write_function,
        }
    }
}

impl PropertyDescriptor for FunctionProperty {
    fn info(&self) -> &PropertyInfo {
        &self.info
    }

    fn read(&self, ctx: &ReadContext<'_>, entity: &Entity) -> Result<Value, PropertyError> {
        let (Some(source), Some(functions)) = (&self.read_function, ctx.functions) else {
            return Ok(Value::Null);
        };
        Ok(functions.evaluate_read(ctx, entity, &self.info.name, source)?)
    }

    fn write(&self, ctx: &mut WriteContext<'_>, entity_id: &str, value: Value) -> Result<(), PropertyError> {
        let (Some(source), Some(functions)) = (&self.write_function, ctx.functions) else {
            return Err(PropertyError::ReadOnly(self.info.name.clone()));
        };
        let entity = ctx
            .graph
            .get(entity_id)
            .cloned()
            .ok_or_else(|| crate::graph::GraphError::NotFound(entity_id.to_string()))?;
        functions.evaluate_write(ctx, &entity, &self.info.name, source, &value)?;
        Ok(())
    }
}
