//! Hook identifier to factory mapping.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::DevSettings;
use crate::error::{Error, Result};

use super::builtin::{
    Delay, ForceStop, HealthCheck, HealthCheckNegative, Interrupt, PortFree, TcpPort,
};
use super::{Hook, HookDescriptor, HookKind};

/// Builds a hook from the resolved settings.
pub type HookFactory = Arc<dyn Fn(&DevSettings) -> Arc<dyn Hook> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    kind: HookKind,
    description: String,
    factory: HookFactory,
}

/// Listing entry for a registered hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookInfo {
    pub id: String,
    pub kind: HookKind,
    pub description: String,
}

/// A hook ready to run, with where it came from.
#[derive(Clone)]
pub struct ResolvedHook {
    pub descriptor: HookDescriptor,
    pub hook: Arc<dyn Hook>,
}

impl fmt::Debug for ResolvedHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedHook")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Registry of hooks available to a deployment.
#[derive(Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Registration>,
}

impl HookRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    /// A registry holding the built-in hooks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            "health-check",
            HookKind::Startup,
            "poll the health endpoint until it answers with the expected status and body",
            |settings| Arc::new(HealthCheck::from_settings(settings)),
        );
        registry.register(
            "tcp-port",
            HookKind::Startup,
            "poll until the generation's port accepts connections",
            |_| Arc::new(TcpPort),
        );
        registry.register(
            "delay",
            HookKind::Startup,
            "wait for the configured startup delay",
            |settings| Arc::new(Delay::new(settings.startup_delay)),
        );
        registry.register(
            "interrupt",
            HookKind::Shutdown,
            "request cooperative shutdown and wait for the grace period",
            |_| Arc::new(Interrupt),
        );
        registry.register(
            "force-stop",
            HookKind::Shutdown,
            "kill the generation if it is still running",
            |_| Arc::new(ForceStop),
        );
        registry.register(
            "health-check-negative",
            HookKind::Shutdown,
            "poll the health endpoint until it stops answering",
            |settings| Arc::new(HealthCheckNegative::from_settings(settings)),
        );
        registry.register(
            "port-free",
            HookKind::Shutdown,
            "poll until the generation's port can be bound again",
            |_| Arc::new(PortFree),
        );
        registry
    }

    /// Register a hook, replacing any hook with the same id.
    pub fn register<F>(
        &mut self,
        id: impl Into<String>,
        kind: HookKind,
        description: impl Into<String>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&DevSettings) -> Arc<dyn Hook> + Send + Sync + 'static,
    {
        self.hooks.insert(
            id.into(),
            Registration {
                kind,
                description: description.into(),
                factory: Arc::new(factory),
            },
        );
        self
    }

    pub fn contains(&self, id: &str, kind: HookKind) -> bool {
        self.hooks.get(id).is_some_and(|r| r.kind == kind)
    }

    /// Registered hooks, sorted by id.
    pub fn describe(&self) -> Vec<HookInfo> {
        self.hooks
            .iter()
            .map(|(id, registration)| HookInfo {
                id: id.clone(),
                kind: registration.kind,
                description: registration.description.clone(),
            })
            .collect()
    }

    /// Resolve configured ids, in order, into runnable hooks.
    ///
    /// Fails on the first id that is not registered for `kind`.
    pub fn resolve<S: AsRef<str>>(
        &self,
        ids: &[S],
        kind: HookKind,
        settings: &DevSettings,
    ) -> Result<Vec<ResolvedHook>> {
        ids.iter()
            .enumerate()
            .map(|(order, id)| {
                let id = id.as_ref();
                let registration = self
                    .hooks
                    .get(id)
                    .filter(|r| r.kind == kind)
                    .ok_or_else(|| Error::HookResolution {
                        id: id.to_string(),
                        kind,
                    })?;
                Ok(ResolvedHook {
                    descriptor: HookDescriptor {
                        id: id.to_string(),
                        kind,
                        order,
                    },
                    hook: (registration.factory)(settings),
                })
            })
            .collect()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hooks.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_SHUTDOWN_HOOKS, DEFAULT_STARTUP_HOOKS};
    use crate::hooks::HookContext;
    use futures::future::BoxFuture;

    struct Noop;

    impl Hook for Noop {
        fn run<'a>(&'a self, _cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn test_builtins_cover_defaults() {
        let registry = HookRegistry::with_builtins();
        for id in DEFAULT_STARTUP_HOOKS {
            assert!(registry.contains(id, HookKind::Startup), "{}", id);
        }
        for id in DEFAULT_SHUTDOWN_HOOKS {
            assert!(registry.contains(id, HookKind::Shutdown), "{}", id);
        }
        assert_eq!(registry.describe().len(), 7);
    }

    #[test]
    fn test_resolve_keeps_order() {
        let registry = HookRegistry::with_builtins();
        let resolved = registry
            .resolve(&["tcp-port", "health-check"], HookKind::Startup, &DevSettings::default())
            .unwrap();
        let ids: Vec<_> = resolved
            .iter()
            .map(|h| (h.descriptor.id.as_str(), h.descriptor.order))
            .collect();
        assert_eq!(ids, vec![("tcp-port", 0), ("health-check", 1)]);
    }

    #[test]
    fn test_unknown_or_wrong_kind_fails() {
        let registry = HookRegistry::with_builtins();
        let settings = DevSettings::default();

        let err = registry
            .resolve(&["warp-drive"], HookKind::Startup, &settings)
            .unwrap_err();
        assert!(matches!(err, Error::HookResolution { ref id, .. } if id == "warp-drive"));

        let err = registry
            .resolve(&["interrupt"], HookKind::Startup, &settings)
            .unwrap_err();
        assert_eq!(err.to_string(), "unknown startup hook: interrupt");
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = HookRegistry::new();
        registry.register("noop", HookKind::Shutdown, "does nothing", |_| Arc::new(Noop));
        assert!(registry.contains("noop", HookKind::Shutdown));
        assert!(!registry.contains("noop", HookKind::Startup));
        assert!(!registry.contains("health-check", HookKind::Startup));
    }
}
