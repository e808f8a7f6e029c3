use crate::config::ContextConfig;
use crate::upstream::Completion;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named hook points invoked along the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    OnRequest,
    OnPrompt,
    OnResponse,
    OnError,
    OnShutdown,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::OnRequest => "on_request",
            HookPoint::OnPrompt => "on_prompt",
            HookPoint::OnResponse => "on_response",
            HookPoint::OnError => "on_error",
            HookPoint::OnShutdown => "on_shutdown",
        }
    }
}

/// Context handed to every hook. `on_prompt` handlers may rewrite the prompt
/// (context injection lives here); the controller only passes a response
/// that has not yet been committed to the wire.
pub struct HookContext {
    pub request_id: String,
    pub endpoint: String,
    pub prompt: Option<String>,
    pub response: Option<Completion>,
    pub error: Option<String>,
    /// Context-injection settings surfaced from config for plugins that
    /// implement retrieval.
    pub context: ContextConfig,
}

impl HookContext {
    pub fn new(request_id: &str, endpoint: &str, context: ContextConfig) -> Self {
        Self {
            request_id: request_id.to_string(),
            endpoint: endpoint.to_string(),
            prompt: None,
            response: None,
            error: None,
            context,
        }
    }
}

type HookFn = dyn Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync;

struct NamedHook {
    name: String,
    f: Box<HookFn>,
}

/// Registration-ordered hook lists. Execution is best-effort: a failing
/// handler is logged with trace correlation and the chain continues.
#[derive(Default)]
pub struct PluginRegistry {
    hooks: RwLock<HashMap<HookPoint, Vec<Arc<NamedHook>>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, point: HookPoint, name: &str, f: F)
    where
        F: Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut hooks = self.hooks.write().unwrap();
        hooks.entry(point).or_default().push(Arc::new(NamedHook {
            name: name.to_string(),
            f: Box::new(f),
        }));
    }

    pub fn count(&self, point: HookPoint) -> usize {
        self.hooks
            .read()
            .unwrap()
            .get(&point)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Run every handler registered for `point` in registration order.
    /// Returns how many handlers failed.
    pub fn execute(&self, point: HookPoint, ctx: &mut HookContext) -> usize {
        // Snapshot under the read lock so a blocking handler cannot stall
        // registration.
        let snapshot: Vec<Arc<NamedHook>> = self
            .hooks
            .read()
            .unwrap()
            .get(&point)
            .cloned()
            .unwrap_or_default();

        let mut failures = 0;
        for hook in snapshot {
            if let Err(err) = (hook.f)(ctx) {
                failures += 1;
                tracing::warn!(
                    "plugin: handler failed, hook={}, name={}, request_id={}, error={}",
                    point.as_str(),
                    hook.name,
                    ctx.request_id,
                    err
                );
                metrics::counter!(
                    "gateway_plugin_failures_total",
                    "hook" => point.as_str(),
                    "name" => hook.name.clone(),
                )
                .increment(1);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> HookContext {
        HookContext::new("req1", "/api/smart", ContextConfig::default())
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let reg = PluginRegistry::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            reg.register(HookPoint::OnRequest, name, move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        let mut c = ctx();
        assert_eq!(reg.execute(HookPoint::OnRequest, &mut c), 0);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failure_does_not_stop_chain() {
        let reg = PluginRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        reg.register(HookPoint::OnPrompt, "boom", |_| anyhow::bail!("nope"));
        {
            let ran = ran.clone();
            reg.register(HookPoint::OnPrompt, "after", move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let mut c = ctx();
        assert_eq!(reg.execute(HookPoint::OnPrompt, &mut c), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_prompt_can_rewrite_prompt() {
        let reg = PluginRegistry::new();
        reg.register(HookPoint::OnPrompt, "inject", |ctx| {
            if let Some(p) = &mut ctx.prompt {
                p.insert_str(0, "[context]\n");
            }
            Ok(())
        });
        let mut c = ctx();
        c.prompt = Some("question".into());
        reg.execute(HookPoint::OnPrompt, &mut c);
        assert_eq!(c.prompt.as_deref(), Some("[context]\nquestion"));
    }

    #[test]
    fn test_empty_point_is_noop() {
        let reg = PluginRegistry::new();
        let mut c = ctx();
        assert_eq!(reg.execute(HookPoint::OnShutdown, &mut c), 0);
        assert_eq!(reg.count(HookPoint::OnShutdown), 0);
    }
}
