//! In-process stand-ins for an ESP32 used by the async tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::Query;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

/// Serve `router` on an ephemeral loopback port.
pub async fn spawn_device(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    addr
}

/// A loopback address nothing listens on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Device answering `GET /status` with `state` and 404 elsewhere.
pub fn status_device(state: &'static str) -> Router {
    Router::new().route("/status", get(move || async move { state }))
}

/// Device that answers every path after `delay`.
pub fn slow_device(delay: Duration) -> Router {
    Router::new().fallback(move || async move {
        tokio::time::sleep(delay).await;
        "late"
    })
}

/// Device implementing `/status` and `/control?cmd=` that records commands.
#[derive(Clone)]
pub struct FakeDevice {
    reply: String,
    control_delay: Duration,
    health_delay: Duration,
    health: bool,
    commands: Arc<Mutex<Vec<String>>>,
    health_hits: Arc<AtomicUsize>,
}

impl FakeDevice {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            control_delay: Duration::ZERO,
            health_delay: Duration::ZERO,
            health: true,
            commands: Arc::default(),
            health_hits: Arc::default(),
        }
    }

    /// Drop the `/status` route so health checks see 404.
    pub fn without_health(mut self) -> Self {
        self.health = false;
        self
    }

    pub fn with_control_delay(mut self, delay: Duration) -> Self {
        self.control_delay = delay;
        self
    }

    /// Answer `/status` only after `delay`.
    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn health_hits(&self) -> usize {
        self.health_hits.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new().route("/control", get(control));
        if self.health {
            router = router.route("/status", get(health));
        }
        router.with_state(self.clone())
    }

    pub async fn spawn(&self) -> SocketAddr {
        spawn_device(self.router()).await
    }
}

async fn health(State(device): State<FakeDevice>) -> &'static str {
    device.health_hits.fetch_add(1, Ordering::SeqCst);
    if !device.health_delay.is_zero() {
        tokio::time::sleep(device.health_delay).await;
    }
    "on"
}

async fn control(
    State(device): State<FakeDevice>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    if !device.control_delay.is_zero() {
        tokio::time::sleep(device.control_delay).await;
    }
    let cmd = params.get("cmd").cloned().unwrap_or_default();
    device.commands.lock().unwrap().push(cmd);
    device.reply.clone()
}
