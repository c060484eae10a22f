//! Migration handlers and the compile/repair loop
//!
//! Compilation errors are tokens, not crashes. Each handler looks at one
//! token and may mutate the model to get rid of it; compilation is retried
//! as long as some handler changed something.

use crate::error::ErrorToken;
use crate::schema::{compile, CompileEnv, CompiledSchema, SchemaError, SchemaModel};
use regex::Regex;

/// Corrective action for one kind of compilation error
pub trait MigrationHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Repair the model for `token`; returns true when the model changed
    fn handle(&self, model: &mut SchemaModel, token: &ErrorToken) -> Result<bool, SchemaError>;
}

const METHOD_ALREADY_DEFINED: &str =
    r"method ([a-zA-Z0-9_]+)\(([a-zA-Z0-9_ \.,<>]*)\) is already defined in class ([a-zA-Z0-9\.]+)";

/// Drops a declared method whose signature collides with an inherited one
#[derive(Debug)]
pub struct RemoveMethodsWithUnusedSignature {
    pattern: Regex,
}

impl RemoveMethodsWithUnusedSignature {
    pub fn new() -> Result<Self, SchemaError> {
        Ok(Self {
            pattern: Regex::new(METHOD_ALREADY_DEFINED)?,
        })
    }
}

impl MigrationHandler for RemoveMethodsWithUnusedSignature {
    fn name(&self) -> &str {
        "RemoveMethodsWithUnusedSignature"
    }

    fn handle(&self, model: &mut SchemaModel, token: &ErrorToken) -> Result<bool, SchemaError> {
        if token.token != "compiler_error" {
            return Ok(false);
        }
        let Some(captures) = token
            .detail
            .as_deref()
            .and_then(|detail| self.pattern.captures(detail))
        else {
            return Ok(false);
        };

        let method = &captures[1];
        let class_name = &captures[3];
        let simple_name = class_name.rsplit('.').next().unwrap_or(class_name);

        let type_name = if model.types.contains_key(class_name) {
            class_name
        } else {
            simple_name
        };
        let Some(schema_type) = model.get_type_mut(type_name) else {
            tracing::debug!("No schema type for {}, leaving method {} alone", class_name, method);
            return Ok(false);
        };

        if schema_type.methods.remove(method).is_some() {
            tracing::info!(
                "🛠️ Removed method {}({}) from {} (signature collides with an inherited method)",
                method,
                &captures[2],
                type_name
            );
            return Ok(true);
        }
        Ok(false)
    }
}

/// The handlers every registry starts with
pub fn default_handlers() -> Result<Vec<Box<dyn MigrationHandler>>, SchemaError> {
    Ok(vec![Box::new(RemoveMethodsWithUnusedSignature::new()?)])
}

/// Compile, letting the handlers repair the model between attempts.
///
/// Returns the (possibly repaired) model together with its compiled form.
/// Configuration errors are returned immediately; compilation errors are
/// returned once no handler can make progress or the attempts run out.
pub fn compile_with_repair(
    model: SchemaModel,
    env: &CompileEnv<'_>,
    handlers: &[Box<dyn MigrationHandler>],
    max_attempts: usize,
) -> Result<(SchemaModel, CompiledSchema), SchemaError> {
    let mut model = model;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let tokens = match compile(&model, env) {
            Ok(compiled) => {
                if attempt > 1 {
                    tracing::info!("✅ Schema compiled after {} attempts", attempt);
                }
                return Ok((compiled.model().clone(), compiled));
            }
            Err(SchemaError::Compilation(tokens)) => tokens,
            Err(other) => return Err(other),
        };

        if attempt >= max_attempts.max(1) {
            tracing::error!("❌ Giving up on schema repair after {} attempts", attempt);
            return Err(SchemaError::Compilation(tokens));
        }

        let mut changed = false;
        for token in &tokens {
            for handler in handlers {
                if handler.handle(&mut model, token)? {
                    tracing::debug!("🛠️ {} handled {}", handler.name(), token);
                    changed = true;
                }
            }
        }

        if !changed {
            tracing::warn!("⚠️ No migration handler could repair {} error(s)", tokens.len());
            return Err(SchemaError::Compilation(tokens));
        }
    }
}
