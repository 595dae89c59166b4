//! Ordered execution of resolved hooks.

use std::time::Instant;

use crate::config::{DevSettings, ReloadConfig};
use crate::error::{Error, Result};
use crate::execute::{ExecutionContext, Termination};
use crate::logger::BuildLogger;

use super::{HookContext, HookKind, HookRegistry, ResolvedHook};

/// Startup and shutdown hooks of a deployment, resolved once.
#[derive(Debug, Clone)]
pub struct HookPipeline {
    startup: Vec<ResolvedHook>,
    shutdown: Vec<ResolvedHook>,
}

impl HookPipeline {
    /// Resolve the configured hook ids. Unknown ids fail here, before any
    /// generation exists.
    pub fn resolve(registry: &HookRegistry, config: &ReloadConfig, settings: &DevSettings) -> Result<Self> {
        Ok(Self {
            startup: registry.resolve(config.startup_hooks.as_slice(), HookKind::Startup, settings)?,
            shutdown: registry.resolve(config.shutdown_hooks.as_slice(), HookKind::Shutdown, settings)?,
        })
    }

    pub fn startup(&self) -> &[ResolvedHook] {
        &self.startup
    }

    pub fn shutdown(&self) -> &[ResolvedHook] {
        &self.shutdown
    }

    /// Run startup hooks in order until all report ready.
    ///
    /// Bounded by the startup timeout as a whole. Fails as soon as a hook
    /// fails or the unit exits.
    pub async fn run_startup(
        &self,
        cx: &ExecutionContext,
        settings: &DevSettings,
        logger: &dyn BuildLogger,
    ) -> Result<()> {
        let generation = cx.generation();
        let hook_cx = HookContext {
            execution: cx,
            settings,
            logger,
        };

        let hooks = async {
            for hook in &self.startup {
                run_hook(hook, hook_cx).await.map_err(|e| Error::StartupFailed {
                    generation,
                    reason: format!("{} hook failed: {}", hook.descriptor.id, e),
                })?;
            }
            Ok::<(), Error>(())
        };

        tokio::select! {
            biased;
            exit = cx.exited() => Err(Error::StartupFailed {
                generation,
                reason: format!("unit {} before becoming ready", exit),
            }),
            result = tokio::time::timeout(settings.startup_timeout, hooks) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::StartupTimeout {
                    generation,
                    waited: settings.startup_timeout,
                }),
            },
        }
    }

    /// Run shutdown hooks in order, then terminate the context.
    ///
    /// Every hook is bounded by the shutdown timeout. Failures do not stop
    /// the sequence; they are logged and returned.
    pub async fn run_shutdown(
        &self,
        cx: &ExecutionContext,
        settings: &DevSettings,
        logger: &dyn BuildLogger,
    ) -> Vec<Error> {
        let generation = cx.generation();
        let hook_cx = HookContext {
            execution: cx,
            settings,
            logger,
        };
        let mut errors = Vec::new();

        for hook in &self.shutdown {
            match tokio::time::timeout(settings.shutdown_timeout, run_hook(hook, hook_cx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    logger.warn(
                        &format!("{} hook failed for generation {}", hook.descriptor.id, generation),
                        Some(&e),
                    );
                    errors.push(e);
                }
                Err(_) => {
                    let e = Error::TerminationTimeout {
                        generation,
                        hook: hook.descriptor.id.clone(),
                    };
                    logger.warn(&e.to_string(), None);
                    errors.push(e);
                }
            }
        }

        if cx.terminate(settings.shutdown_grace).await == Termination::Forced {
            logger.warn(&format!("generation {} was killed", generation), None);
        }
        errors
    }
}

async fn run_hook(hook: &ResolvedHook, cx: HookContext<'_>) -> Result<()> {
    let start = Instant::now();
    let result = hook.hook.run(cx).await;
    cx.logger.debug(&format!(
        "{} hook {} for generation {} took {}ms",
        hook.descriptor.kind,
        hook.descriptor.id,
        cx.execution.generation(),
        start.elapsed().as_millis()
    ));
    result
}
