//! Bounded cache of compiled scripts
//!
//! Shared by all requests. A miss only costs a compile; callers never depend
//! on an entry being present.

use crate::script::engine::{CompiledScript, EngineError, ScriptEngine};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub struct SourceCache {
    entries: Mutex<LruCache<String, Arc<CompiledScript>>>,
}

impl std::fmt::Debug for SourceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCache").field("len", &self.len()).finish()
    }
}

impl SourceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn key(engine: &str, source: &str) -> String {
        format!("{}:{}", engine, source.trim())
    }

    /// Cached compile of `source`, compiling with `engine` on a miss
    pub fn get_or_compile(&self, engine: &dyn ScriptEngine, source: &str) -> Result<Arc<CompiledScript>, EngineError> {
        let key = Self::key(engine.name(), source);
        if let Some(hit) = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return Ok(Arc::clone(hit));
        }

        tracing::debug!("🧮 Source cache miss for {} script", engine.name());
        let compiled = Arc::new(engine.compile(source)?);
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(key, Arc::clone(&compiled));
        Ok(compiled)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::engine::{Bindings, CompiledForm};
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        compiles: AtomicUsize,
    }

    impl ScriptEngine for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn compile(&self, source: &str) -> Result<CompiledScript, EngineError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledScript {
                engine: self.name().to_string(),
                form: CompiledForm::Source(source.to_string()),
            })
        }

        fn evaluate(&self, _script: &CompiledScript, _bindings: &mut Bindings<'_>) -> Result<Value, EngineError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_hits_skip_compilation() {
        let cache = SourceCache::new(10);
        let engine = Counting::default();
        let first = cache.get_or_compile(&engine, "return 1").unwrap();
        let second = cache.get_or_compile(&engine, "  return 1\n").unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let cache = SourceCache::new(2);
        let engine = Counting::default();
        for source in ["a", "b", "c"] {
            cache.get_or_compile(&engine, source).unwrap();
        }
        assert_eq!(cache.len(), 2);
        cache.get_or_compile(&engine, "a").unwrap();
        assert_eq!(engine.compiles.load(Ordering::SeqCst), 4);
    }
}
