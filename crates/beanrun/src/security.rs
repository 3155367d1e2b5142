//! # Security Context
//!
//! The caller principal of the running call lives in a task-local slot, so it
//! follows the call across awaits and into nested local invocations. A new
//! principal is only ever installed for the extent of a future, which makes
//! restoring the previous one structural rather than a matter of discipline.

use std::future::Future;

use beanwire::MethodSignature;
use beanwire::Principal;

use crate::descriptor::ComponentDescriptor;

tokio::task_local! {
    static CALLER: Principal;
}

/// The principal the current task runs as; anonymous outside any scope.
pub fn current() -> Principal {
    CALLER
        .try_with(Principal::clone)
        .unwrap_or_else(|_| Principal::anonymous())
}

/// Runs `fut` as `principal`, restoring the surrounding principal afterwards.
pub async fn scope<F: Future>(principal: Principal, fut: F) -> F::Output {
    CALLER.scope(principal, fut).await
}

/// Decides whether a caller may run a method.
pub trait PermissionCheck: Send + Sync {
    fn check(
        &self,
        caller: &Principal,
        descriptor: &ComponentDescriptor,
        method: &MethodSignature,
        run_as: bool,
    ) -> bool;
}

/// Grants access according to the descriptor's own access rules.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeclaredAccess;

impl PermissionCheck for DeclaredAccess {
    fn check(
        &self,
        caller: &Principal,
        descriptor: &ComponentDescriptor,
        method: &MethodSignature,
        _run_as: bool,
    ) -> bool {
        descriptor.access().permits(caller, &method.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_defaults_to_anonymous() {
        assert!(current().is_anonymous());
    }

    #[tokio::test]
    async fn test_nested_scopes_restore() {
        scope(Principal::new("alice"), async {
            assert_eq!(current().name(), "alice");
            scope(Principal::new("system"), async {
                assert_eq!(current().name(), "system");
            })
            .await;
            assert_eq!(current().name(), "alice");
        })
        .await;
        assert!(current().is_anonymous());
    }

    #[tokio::test]
    async fn test_scope_restores_after_error() {
        let result: Result<(), &str> = scope(Principal::new("bob"), async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(current().is_anonymous());
    }
}
