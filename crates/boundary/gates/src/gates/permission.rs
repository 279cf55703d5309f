use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use boundary_kernel::{CrossingRequest, CrossingView, Gate, GateError, GateOutcome};
use boundary_types::GateId;
use tracing::debug;

use crate::traits::PermissionProvider;

/// Fixed grant table.
///
/// A grant is an exact operation name, a prefix ending in `.*`
/// (`payments.*`), or `*` for every operation.
#[derive(Clone, Debug, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, HashSet<String>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor: impl Into<String>, operation: impl Into<String>) -> Self {
        self.grants
            .entry(actor.into())
            .or_default()
            .insert(operation.into());
        self
    }

    fn covers(pattern: &str, operation: &str) -> bool {
        if pattern == "*" || pattern == operation {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('.') => operation.starts_with(prefix),
            _ => false,
        }
    }
}

impl PermissionProvider for StaticPermissions {
    fn is_permitted(&self, actor: &str, operation: &str) -> Result<bool, GateError> {
        Ok(self
            .grants
            .get(actor)
            .map(|ops| ops.iter().any(|p| Self::covers(p, operation)))
            .unwrap_or(false))
    }
}

/// K2: Permission
///
/// Verifies that the requesting actor holds a grant for the operation.
pub struct PermissionGate {
    permissions: Arc<dyn PermissionProvider>,
}

impl PermissionGate {
    pub fn new(permissions: Arc<dyn PermissionProvider>) -> Self {
        Self { permissions }
    }
}

#[async_trait]
impl Gate for PermissionGate {
    fn id(&self) -> GateId {
        GateId::K2
    }

    fn name(&self) -> &str {
        "permission"
    }

    async fn evaluate(
        &self,
        crossing: &CrossingView,
        request: &CrossingRequest,
    ) -> Result<GateOutcome, GateError> {
        if self
            .permissions
            .is_permitted(request.actor(), request.operation())?
        {
            debug!(correlation_id = %crossing.correlation_id, actor = request.actor(), "permission granted");
            return Ok(GateOutcome::Pass);
        }
        Ok(GateOutcome::fail(format!(
            "{} may not perform {}",
            request.actor(),
            request.operation()
        )))
    }
}
