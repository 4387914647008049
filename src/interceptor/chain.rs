//! Ordered, uniquely named interceptor registration and execution.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::interceptor::{InterceptError, InterceptedResponse, Interceptor};

/// Errors raised while registering or running interceptors.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to load a new interceptor: an interceptor named '{0}' already exists")]
    DuplicateName(String),

    #[error("interceptor '{name}' failed to run: {source}")]
    Handler {
        name: String,
        #[source]
        source: InterceptError,
    },

    #[error("interceptor '{name}' left the response without a body")]
    BodyLost { name: String },
}

struct Registered {
    name: String,
    interceptor: Arc<dyn Interceptor>,
}

/// Interceptors keyed by name for uniqueness, executed in registration order.
#[derive(Default, Clone)]
pub struct InterceptorChain {
    index: HashMap<String, usize>,
    entries: Vec<Arc<Registered>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interceptor. A taken name is rejected and the existing
    /// entry is kept.
    pub fn register<I>(&mut self, name: impl Into<String>, interceptor: I) -> Result<(), ChainError>
    where
        I: Interceptor + 'static,
    {
        self.register_shared(name, Arc::new(interceptor))
    }

    /// Register an interceptor that is already shared.
    pub fn register_shared(
        &mut self,
        name: impl Into<String>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<(), ChainError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(ChainError::DuplicateName(name));
        }

        self.index.insert(name.clone(), self.entries.len());
        self.entries.push(Arc::new(Registered { name, interceptor }));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Run every interceptor against the response.
    ///
    /// Returns the number of handlers that ran. A handler error aborts the
    /// whole chain.
    pub async fn apply(&self, response: &mut InterceptedResponse) -> Result<usize, ChainError> {
        let mut handled = 0;

        for entry in &self.entries {
            let mut accepted = true;
            for rule in entry.interceptor.rules() {
                if !rule.check(response).await {
                    tracing::trace!(
                        interceptor = %entry.name,
                        rule = rule.name(),
                        status = %response.status(),
                        "Rule rejected response"
                    );
                    accepted = false;
                    break;
                }
            }

            if response.body_lost() {
                return Err(ChainError::BodyLost {
                    name: entry.name.clone(),
                });
            }

            if !accepted {
                continue;
            }

            entry
                .interceptor
                .handle(response)
                .await
                .map_err(|source| ChainError::Handler {
                    name: entry.name.clone(),
                    source,
                })?;

            tracing::debug!(interceptor = %entry.name, "Interceptor applied");
            handled += 1;
        }

        Ok(handled)
    }
}
