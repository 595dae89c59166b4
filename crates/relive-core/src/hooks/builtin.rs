//! Built-in startup and shutdown hooks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::config::DevSettings;
use crate::error::{Error, Result};

use super::{Hook, HookContext};

/// Interval between readiness checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout of a single health request.
const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Address to connect to for a generation listening on `endpoint`.
///
/// A generation bound to the unspecified address is reached over loopback.
fn connect_addr(endpoint: SocketAddr) -> SocketAddr {
    match endpoint.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), endpoint.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), endpoint.port()),
        _ => endpoint,
    }
}

/// Expected answer of the health endpoint.
#[derive(Debug, Clone)]
struct HealthPoller {
    path: String,
    status: u16,
    body: Option<String>,
}

impl HealthPoller {
    fn from_settings(settings: &DevSettings) -> Self {
        let path = if settings.health_path.starts_with('/') {
            settings.health_path.clone()
        } else {
            format!("/{}", settings.health_path)
        };
        Self {
            path,
            status: settings.health_status,
            body: settings.health_body.clone(),
        }
    }

    fn client() -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
    }

    fn url(&self, endpoint: SocketAddr) -> String {
        format!("http://{}{}", connect_addr(endpoint), self.path)
    }

    /// Whether the endpoint currently answers as expected.
    async fn healthy(&self, client: &reqwest::Client, url: &str) -> bool {
        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(_) => return false,
        };
        if response.status().as_u16() != self.status {
            return false;
        }
        match &self.body {
            None => true,
            Some(expected) => response.text().await.is_ok_and(|body| body == *expected),
        }
    }
}

/// Polls the health endpoint until it answers with the expected status
/// and, if configured, the expected body.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    poller: HealthPoller,
}

impl HealthCheck {
    pub fn from_settings(settings: &DevSettings) -> Self {
        Self {
            poller: HealthPoller::from_settings(settings),
        }
    }
}

impl Hook for HealthCheck {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let client = HealthPoller::client()?;
            let url = self.poller.url(cx.execution.endpoint());
            cx.logger.debug(&format!("waiting for {}", url));
            while !self.poller.healthy(&client, &url).await {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        })
    }
}

/// Polls the health endpoint until it stops answering as expected.
#[derive(Debug, Clone)]
pub struct HealthCheckNegative {
    poller: HealthPoller,
}

impl HealthCheckNegative {
    pub fn from_settings(settings: &DevSettings) -> Self {
        Self {
            poller: HealthPoller::from_settings(settings),
        }
    }
}

impl Hook for HealthCheckNegative {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let client = HealthPoller::client()?;
            let url = self.poller.url(cx.execution.endpoint());
            while self.poller.healthy(&client, &url).await {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        })
    }
}

/// Polls until the generation's port accepts TCP connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPort;

impl Hook for TcpPort {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let addr = connect_addr(cx.execution.endpoint());
            while TcpStream::connect(addr).await.is_err() {
                sleep(POLL_INTERVAL).await;
            }
            Ok(())
        })
    }
}

/// Waits a fixed time.
#[derive(Debug, Clone, Copy)]
pub struct Delay {
    duration: Duration,
}

impl Delay {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl Hook for Delay {
    fn run<'a>(&'a self, _cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sleep(self.duration).await;
            Ok(())
        })
    }
}

/// Requests cooperative shutdown and waits up to the grace period.
#[derive(Debug, Clone, Copy, Default)]
pub struct Interrupt;

impl Hook for Interrupt {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            cx.execution.interrupt();
            if cx.execution.wait_exit(cx.settings.shutdown_grace).await.is_none() {
                cx.logger.debug(&format!(
                    "generation {} still running after {}ms grace period",
                    cx.execution.generation(),
                    cx.settings.shutdown_grace.as_millis()
                ));
            }
            Ok(())
        })
    }
}

/// Kills the generation if it is still running and waits for the exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceStop;

impl Hook for ForceStop {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if cx.execution.is_alive() {
                cx.logger.info(&format!("force stopping generation {}", cx.execution.generation()));
                cx.execution.kill();
                cx.execution.exited().await;
            }
            Ok(())
        })
    }
}

/// Polls until the generation's port can be bound again.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFree;

impl Hook for PortFree {
    fn run<'a>(&'a self, cx: HookContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let addr = cx.execution.endpoint();
            loop {
                match TcpListener::bind(addr).await {
                    Ok(listener) => {
                        drop(listener);
                        return Ok(());
                    }
                    Err(_) => sleep(POLL_INTERVAL).await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HEALTH_BODY, HEALTH_PATH, Settings};
    use crate::execute::{ExecutionContext, Launcher, ExecutionUnit};
    use crate::generation::{ArtifactSet, GenerationId};
    use crate::logger::TracingLogger;
    use axum::Router;
    use axum::routing::get;

    fn context(endpoint: SocketAddr) -> ExecutionContext {
        ExecutionContext::create(
            GenerationId::new(1),
            &ArtifactSet::default(),
            "app",
            &Settings::new(),
            endpoint,
        )
    }

    async fn serve(body: &'static str) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/ready", get(move || async move { body }));
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, handle)
    }

    fn settings(body: Option<&str>) -> DevSettings {
        let mut settings: Settings = [(HEALTH_PATH, "ready")].into_iter().collect();
        if let Some(body) = body {
            settings.insert(HEALTH_BODY, body);
        }
        DevSettings::resolve(&settings, |_| None).unwrap()
    }

    #[test]
    fn test_connect_addr_maps_unspecified() {
        let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
        assert_eq!(connect_addr(addr), "127.0.0.1:8080".parse().unwrap());
        let addr: SocketAddr = "10.0.0.1:8080".parse().unwrap();
        assert_eq!(connect_addr(addr), addr);
    }

    #[tokio::test]
    async fn test_health_check_passes_on_expected_body() {
        let (addr, server) = serve("ok").await;
        let settings = settings(Some("ok"));
        let cx = context(addr);
        let hook = HealthCheck::from_settings(&settings);
        let hook_cx = HookContext {
            execution: &cx,
            settings: &settings,
            logger: &TracingLogger,
        };
        tokio::time::timeout(Duration::from_secs(5), hook.run(hook_cx))
            .await
            .unwrap()
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_health_check_waits_on_wrong_body() {
        let (addr, server) = serve("starting").await;
        let settings = settings(Some("ok"));
        let cx = context(addr);
        let hook = HealthCheck::from_settings(&settings);
        let hook_cx = HookContext {
            execution: &cx,
            settings: &settings,
            logger: &TracingLogger,
        };
        let result = tokio::time::timeout(Duration::from_millis(300), hook.run(hook_cx)).await;
        assert!(result.is_err());
        server.abort();
    }

    #[tokio::test]
    async fn test_negative_check_and_port_free_after_server_stops() {
        let (addr, server) = serve("ok").await;
        let settings = settings(None);
        let cx = context(addr);
        let hook_cx = HookContext {
            execution: &cx,
            settings: &settings,
            logger: &TracingLogger,
        };

        server.abort();
        let _ = server.await;

        let negative = HealthCheckNegative::from_settings(&settings);
        tokio::time::timeout(Duration::from_secs(5), negative.run(hook_cx))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), PortFree.run(hook_cx))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_port() {
        let (addr, server) = serve("ok").await;
        let settings = settings(None);
        let cx = context(addr);
        let hook_cx = HookContext {
            execution: &cx,
            settings: &settings,
            logger: &TracingLogger,
        };
        tokio::time::timeout(Duration::from_secs(5), TcpPort.run(hook_cx))
            .await
            .unwrap()
            .unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_force_stop_kills_running_unit() {
        struct Stubborn(crate::execute::ExitNotifier);
        impl ExecutionUnit for Stubborn {
            fn interrupt(&self) {}
            fn kill(&self) {
                self.0.notify(crate::execute::UnitExit::Killed);
            }
            fn describe(&self) -> String {
                "stubborn".into()
            }
        }
        struct StubbornLauncher;
        impl Launcher for StubbornLauncher {
            fn launch(&self, cx: &ExecutionContext) -> Result<Box<dyn ExecutionUnit>> {
                Ok(Box::new(Stubborn(cx.exit_notifier())))
            }
        }

        let mut cx = context("127.0.0.1:1".parse().unwrap());
        cx.launch(&StubbornLauncher);
        let settings = DevSettings {
            shutdown_grace: Duration::from_millis(20),
            ..DevSettings::default()
        };
        let hook_cx = HookContext {
            execution: &cx,
            settings: &settings,
            logger: &TracingLogger,
        };

        Interrupt.run(hook_cx).await.unwrap();
        assert!(cx.is_alive());
        ForceStop.run(hook_cx).await.unwrap();
        assert!(!cx.is_alive());
    }
}
