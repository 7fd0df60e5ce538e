//! Immutable registries mapping names to activity and workflow handlers.
//!
//! Registries are built once at startup and frozen behind `Arc`, so handler
//! lookup never takes a lock. Workflow registrations declare the activities
//! they call, letting `validate` fail fast on a missing registration instead
//! of failing instances at dispatch time.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{codec, WorkflowContext};

/// Handler invoked on the worker dispatcher with a raw string payload.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

struct FnActivity<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

struct TypedActivity<F, In, Out>(F, std::marker::PhantomData<fn(In) -> Out>);

#[async_trait]
impl<F, Fut, In, Out> ActivityHandler for TypedActivity<F, In, Out>
where
    F: Fn(In) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Out, String>> + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        let typed: In = codec::decode(&input)?;
        let out = (self.0)(typed).await?;
        codec::encode(&out)
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

#[derive(Default)]
pub struct ActivityRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistryBuilder {
    /// Register a raw string-to-string activity.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    /// Register an activity with serde-typed input and output.
    pub fn register_typed<F, Fut, In, Out>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(TypedActivity(f, std::marker::PhantomData)));
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            handlers: self.handlers,
        }
    }
}

/// Workflow entry point. Must be deterministic: all effects go through the
/// context's scheduled activities.
pub trait WorkflowHandler: Send + Sync {
    fn invoke(
        &self,
        ctx: WorkflowContext,
        input: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>>>>;
}

struct FnWorkflow<F>(F);

impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + 'static,
{
    fn invoke(
        &self,
        ctx: WorkflowContext,
        input: String,
    ) -> Pin<Box<dyn Future<Output = Result<String, String>>>> {
        Box::pin((self.0)(ctx, input))
    }
}

#[derive(Clone)]
struct WorkflowEntry {
    handler: Arc<dyn WorkflowHandler>,
    required_activities: Vec<String>,
}

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    entries: HashMap<String, WorkflowEntry>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowHandler>> {
        self.entries.get(name).map(|e| e.handler.clone())
    }

    /// Check that every activity the registered workflows declare is present
    /// in the activity registry. Returns the first missing pair.
    pub fn validate(&self, activities: &ActivityRegistry) -> Result<(), String> {
        for (workflow, entry) in &self.entries {
            for activity in &entry.required_activities {
                if !activities.contains(activity) {
                    return Err(format!(
                        "workflow '{workflow}' requires unregistered activity '{activity}'"
                    ));
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct WorkflowRegistryBuilder {
    entries: HashMap<String, WorkflowEntry>,
}

impl WorkflowRegistryBuilder {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + 'static,
    {
        self.register_with_activities(name, &[], f)
    }

    /// Register a workflow along with the activity names it calls.
    pub fn register_with_activities<F, Fut>(
        mut self,
        name: impl Into<String>,
        required_activities: &[&str],
        f: F,
    ) -> Self
    where
        F: Fn(WorkflowContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + 'static,
    {
        self.entries.insert(
            name.into(),
            WorkflowEntry {
                handler: Arc::new(FnWorkflow(f)),
                required_activities: required_activities.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            entries: self.entries,
        }
    }
}
