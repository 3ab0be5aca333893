use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Source of nested scope descriptions attached to records.
pub trait ScopeProvider: Send + Sync {
    /// Push a scope onto the current call context's stack. The scope is
    /// popped when the returned guard is dropped.
    fn push(&self, state: String) -> ScopeGuard;

    /// Visit the active scopes from outermost to innermost.
    fn for_each_scope(&self, f: &mut dyn FnMut(&str));
}

/// Releases a scope on drop, so every exit path (early return, `?`, panic
/// unwinding) pops it.
#[must_use = "the scope is popped as soon as the guard is dropped"]
pub struct ScopeGuard {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ScopeGuard {
    pub fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        ScopeGuard { release: Some(Box::new(release)) }
    }

    /// A guard that releases nothing.
    pub fn noop() -> Self {
        ScopeGuard { release: None }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static STACKS: RefCell<HashMap<u64, Vec<String>>> = RefCell::new(HashMap::new());
}

/// Scope provider keeping one stack per thread.
///
/// Each provider instance has its own stacks, so independent providers on
/// the same thread do not see each other's scopes. A guard only pops the
/// stack of the thread that pushed it; dropping it elsewhere (a guard held
/// across an `.await` that resumed on another worker) is a no-op.
#[derive(Debug)]
pub struct LocalScopeProvider {
    id: u64,
}

impl LocalScopeProvider {
    pub fn new() -> Self {
        LocalScopeProvider {
            id: NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Number of active scopes on the current thread.
    pub fn depth(&self) -> usize {
        STACKS.with(|stacks| stacks.borrow().get(&self.id).map_or(0, Vec::len))
    }
}

impl Default for LocalScopeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeProvider for LocalScopeProvider {
    fn push(&self, state: String) -> ScopeGuard {
        let id = self.id;
        let owner = thread::current().id();
        let depth = STACKS.with(|stacks| {
            let mut stacks = stacks.borrow_mut();
            let stack = stacks.entry(id).or_default();
            stack.push(state);
            stack.len() - 1
        });

        ScopeGuard::new(move || {
            if thread::current().id() != owner {
                return;
            }
            // `try_with`: the guard may outlive the thread-local during teardown.
            let _ = STACKS.try_with(|stacks| {
                let mut stacks = stacks.borrow_mut();
                if let Some(stack) = stacks.get_mut(&id) {
                    stack.truncate(depth);
                    if stack.is_empty() {
                        stacks.remove(&id);
                    }
                }
            });
        })
    }

    fn for_each_scope(&self, f: &mut dyn FnMut(&str)) {
        STACKS.with(|stacks| {
            if let Some(stack) = stacks.borrow().get(&self.id) {
                for scope in stack {
                    f(scope);
                }
            }
        });
    }
}

/// Join the active scopes with `.`, outermost first. `None` when no scope
/// is active.
pub fn collect_scopes(provider: &dyn ScopeProvider) -> Option<String> {
    let mut scopes: Vec<String> = Vec::new();
    provider.for_each_scope(&mut |s| scopes.push(s.to_string()));
    if scopes.is_empty() {
        None
    } else {
        Some(scopes.join("."))
    }
}
