//! # Resolution Scope
//!
//! Construction and injection run inside the component's own resolution scope
//! (the scope its dependencies are looked up in). The scope is installed by a
//! guard and the previous one is put back when the guard drops, including
//! when construction fails or panics.

use std::cell::RefCell;

/// Supplies the scope register that construction switches.
pub trait ScopeProvider: Send + Sync {
    fn current(&self) -> Option<String>;
    fn install(&self, scope: Option<String>);
}

/// Restores the previous scope on drop.
pub struct ScopeGuard<'a> {
    provider: &'a dyn ScopeProvider,
    previous: Option<String>,
}

impl<'a> ScopeGuard<'a> {
    pub fn enter(provider: &'a dyn ScopeProvider, scope: &str) -> Self {
        let previous = provider.current();
        provider.install(Some(scope.to_string()));
        Self { provider, previous }
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.provider.install(self.previous.take());
    }
}

thread_local! {
    static THREAD_SCOPE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Keeps the scope in a thread-local register. Construction is synchronous,
/// so the scope never outlives the thread that installed it.
#[derive(Copy, Clone, Debug, Default)]
pub struct ThreadScope;

impl ThreadScope {
    /// The scope installed on the calling thread, if any.
    pub fn get() -> Option<String> {
        THREAD_SCOPE.with(|s| s.borrow().clone())
    }
}

impl ScopeProvider for ThreadScope {
    fn current(&self) -> Option<String> {
        Self::get()
    }

    fn install(&self, scope: Option<String>) {
        THREAD_SCOPE.with(|s| *s.borrow_mut() = scope);
    }
}
