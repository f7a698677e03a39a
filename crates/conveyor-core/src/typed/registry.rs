//! RunnerRegistry - lookup table from content type to runner.
//!
//! Adding a content type is one `register` call; nothing dispatches on a
//! hard-coded list.

use std::collections::HashMap;
use std::sync::Arc;

use super::request::PipelineRequest;
use super::runner::{DynRunner, JobRunner, TypedRunner};
use crate::domain::{ContentType, PipelineKind};

/// # Usage
/// ```ignore
/// let mut registry = RunnerRegistry::new();
/// registry.register::<PublicationRequest, _>(PublicationRunner)?;
/// let runner = registry.get(&task.content_type);
/// ```
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<ContentType, Arc<dyn DynRunner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("runner for content type '{0}' is already registered")]
    AlreadyRegistered(ContentType),
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<R: PipelineRequest, X: JobRunner<R> + 'static>(
        &mut self,
        runner: X,
    ) -> Result<(), RegistryError> {
        self.insert(Arc::new(TypedRunner::<R, X>::new(runner)))
    }

    /// Register an already type-erased runner.
    pub fn insert(&mut self, runner: Arc<dyn DynRunner>) -> Result<(), RegistryError> {
        let content_type = runner.content_type();
        if self.runners.contains_key(&content_type) {
            return Err(RegistryError::AlreadyRegistered(content_type));
        }
        self.runners.insert(content_type, runner);
        Ok(())
    }

    pub fn get(&self, content_type: &ContentType) -> Option<Arc<dyn DynRunner>> {
        self.runners.get(content_type).cloned()
    }

    /// Sorted, so claim filters built from it are stable.
    pub fn registered_types(&self) -> Vec<ContentType> {
        let mut types: Vec<ContentType> = self.runners.keys().cloned().collect();
        types.sort();
        types
    }

    /// Content types served by the monitor of `kind`.
    pub fn content_types_for(&self, kind: PipelineKind) -> Vec<ContentType> {
        let mut types: Vec<ContentType> = self
            .runners
            .values()
            .filter(|r| r.kind() == kind)
            .map(|r| r.content_type())
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::runner::testing::{EchoRequest, EchoRunner};

    #[test]
    fn register_and_get() {
        let mut registry = RunnerRegistry::new();
        registry.register::<EchoRequest, _>(EchoRunner).unwrap();
        assert!(registry.get(&EchoRequest::content_type()).is_some());
        assert!(registry.get(&ContentType::new("unknown.v1")).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = RunnerRegistry::new();
        registry.register::<EchoRequest, _>(EchoRunner).unwrap();
        let result = registry.register::<EchoRequest, _>(EchoRunner);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(t)) if t == EchoRequest::content_type()));
    }

    #[test]
    fn content_types_are_grouped_by_kind() {
        let mut registry = RunnerRegistry::new();
        registry.register::<EchoRequest, _>(EchoRunner).unwrap();
        assert_eq!(
            registry.content_types_for(PipelineKind::Publication),
            vec![EchoRequest::content_type()]
        );
        assert!(registry.content_types_for(PipelineKind::Reduction).is_empty());
        assert_eq!(registry.registered_types(), vec![EchoRequest::content_type()]);
    }
}
