use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::HandlerError;
use crate::queue::JobInput;
use crate::worker::handlers;

pub type Handler = Arc<dyn Fn(&JobInput) -> Result<Value, HandlerError> + Send + Sync>;

/// Fixed mapping from method name to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Handler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    pub fn builtin() -> Self {
        Self::new()
            .register("sentence-encode", handlers::sentence_encode)
            .register("cosine", handlers::cosine)
            .register("summarization", handlers::summarization)
            .register("cluster", handlers::cluster)
            .register("sentiment-analysis", handlers::sentiment_analysis)
    }

    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobInput) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn invoke(&self, method: &str, input: &JobInput) -> Result<Value, HandlerError> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| HandlerError::UnknownMethod(method.to_string()))?;
        handler(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_methods() {
        let registry = HandlerRegistry::builtin();
        assert_eq!(
            registry.names(),
            vec![
                "cluster",
                "cosine",
                "sentence-encode",
                "sentiment-analysis",
                "summarization"
            ]
        );
    }

    #[test]
    fn unknown_method_error_names_method() {
        let err = HandlerRegistry::builtin()
            .invoke("not-a-real-method", &JobInput::default())
            .unwrap_err();
        assert_eq!(err, HandlerError::UnknownMethod("not-a-real-method".to_string()));
        assert_eq!(err.to_string(), "unknown method: not-a-real-method");
    }

    #[test]
    fn custom_handler() {
        let registry =
            HandlerRegistry::new().register("echo", |input: &JobInput| Ok(json!(input.args)));
        assert!(registry.contains("echo"));
        assert_eq!(
            registry.invoke("echo", &JobInput::new(vec![json!(1)])).unwrap(),
            json!([1])
        );
    }
}
