//! Hook pipeline.
//!
//! Four ordered middleware phases — `request`, `decode`, `response`,
//! `error` — composed as a manual continuation chain: each phase gets an
//! explicit, inspectable `next` closure to call instead of being wrapped
//! inside an opaque `Service`.

use std::sync::Arc;

use crate::status::TempoError;

/// Context visible to a hook: implementors hand in whatever per-call state
/// makes sense (client or server call context); hooks are generic over it.
pub type HookResult = Result<(), TempoError>;

/// A single middleware step. `next` must be invoked to continue the chain;
/// omitting the call short-circuits it (§4.5).
pub type Middleware<C> = Arc<dyn Fn(&mut C, Next<'_, C>) -> HookResult + Send + Sync>;

/// The continuation passed to a middleware step.
pub struct Next<'a, C> {
    remaining: &'a [Middleware<C>],
}

impl<'a, C> Next<'a, C> {
    pub fn call(self, ctx: &mut C) -> HookResult {
        match self.remaining.split_first() {
            Some((hook, rest)) => hook(ctx, Next { remaining: rest }),
            None => Ok(()),
        }
    }
}

/// An ordered list of middleware for one phase.
#[derive(Clone)]
pub struct Phase<C> {
    middlewares: Vec<Middleware<C>>,
}

impl<C> Default for Phase<C> {
    fn default() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }
}

impl<C> Phase<C> {
    pub fn push(&mut self, hook: Middleware<C>) {
        self.middlewares.push(hook);
    }

    /// Run the chain from the start. An empty phase is a no-op success.
    pub fn run(&self, ctx: &mut C) -> HookResult {
        Next {
            remaining: &self.middlewares,
        }
        .call(ctx)
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

/// The four phases a call passes through (§4.5):
/// `request` fires after auth, before serialize/send; `decode` fires after
/// a payload is decoded; `response` fires after response headers are
/// validated and before delivery; `error` fires once per failed call.
#[derive(Clone, Default)]
pub struct Hooks<C> {
    pub request: Phase<C>,
    pub decode: Phase<C>,
    pub response: Phase<C>,
    pub error: Phase<C>,
}

impl<C> Hooks<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, Next<'_, C>) -> HookResult + Send + Sync + 'static,
    {
        self.request.push(Arc::new(hook));
        self
    }

    pub fn on_decode<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, Next<'_, C>) -> HookResult + Send + Sync + 'static,
    {
        self.decode.push(Arc::new(hook));
        self
    }

    pub fn on_response<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, Next<'_, C>) -> HookResult + Send + Sync + 'static,
    {
        self.response.push(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, Next<'_, C>) -> HookResult + Send + Sync + 'static,
    {
        self.error.push(Arc::new(hook));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn hooks_run_in_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let hooks: Hooks<()> = Hooks::new()
            .on_request(move |_ctx, next| {
                o1.lock().unwrap().push(1);
                next.call(_ctx)
            })
            .on_request(move |_ctx, next| {
                o2.lock().unwrap().push(2);
                next.call(_ctx)
            });
        let mut ctx = ();
        hooks.request.run(&mut ctx).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn hook_omitting_next_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let hooks: Hooks<()> = Hooks::new()
            .on_request(move |_ctx, _next| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                Ok(()) // doesn't call next
            })
            .on_request(move |_ctx, _next| {
                panic!("should never run, chain was short-circuited");
            });
        let mut ctx = ();
        hooks.request.run(&mut ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_error_propagates_out_of_the_chain() {
        use crate::status::StatusCode;
        let hooks: Hooks<()> = Hooks::new().on_request(|_ctx, _next| {
            Err(TempoError::new(StatusCode::PermissionDenied, "nope"))
        });
        let mut ctx = ();
        let err = hooks.request.run(&mut ctx).unwrap_err();
        assert_eq!(err.status, StatusCode::PermissionDenied);
    }

    #[test]
    fn empty_phase_is_a_noop() {
        let hooks: Hooks<()> = Hooks::new();
        let mut ctx = ();
        assert!(hooks.request.is_empty());
        hooks.request.run(&mut ctx).unwrap();
    }
}
