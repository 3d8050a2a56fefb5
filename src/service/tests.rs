use super::*;
use crate::bus::MemoryBroker;
use crate::subscription::{PullSubscription, PushSubscription};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

fn env() -> ServiceEnv {
    ServiceEnv::default()
        .with_project_id("test-project")
        .with_port(0)
}

/// Subscription that counts lifecycle calls and can be told to fail.
struct ScriptedSubscription {
    name: String,
    teardowns: Arc<AtomicUsize>,
    fail_teardown: bool,
    fail_listen: bool,
}

impl ScriptedSubscription {
    fn new(name: &str, teardowns: Arc<AtomicUsize>) -> Self {
        Self {
            name: name.to_string(),
            teardowns,
            fail_teardown: false,
            fail_listen: false,
        }
    }
}

#[async_trait]
impl Subscription for ScriptedSubscription {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }

    async fn setup(
        &mut self,
        _ctx: &mut SetupContext<'_>,
        _index: usize,
    ) -> Result<(), SubscriptionError> {
        Ok(())
    }

    async fn listen(&self, _ctx: Arc<ServiceContext>) -> Result<(), SubscriptionError> {
        if self.fail_listen {
            return Err(SubscriptionError::Listen {
                name: self.name.clone(),
                message: "connection lost".to_string(),
            });
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<(), SubscriptionError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_teardown {
            return Err(SubscriptionError::Teardown {
                name: self.name.clone(),
                message: "broker unavailable".to_string(),
            });
        }
        Ok(())
    }
}

fn broker() -> Arc<dyn Broker> {
    Arc::new(MemoryBroker::new())
}

#[tokio::test]
async fn test_missing_project_id_aborts_startup() {
    let service = Service::new("svc", "1.0.0", broker()).with_output("orders.placed");
    let lifecycle = service.lifecycle();

    let result = service
        .run_until(ServiceEnv::default().with_port(0), async {})
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::Config(ConfigError::Missing("PUBSUB_PROJECT_ID")))
    ));
    assert_eq!(*lifecycle.borrow(), Lifecycle::Created);
}

#[tokio::test]
async fn test_bare_service_runs_without_project_id() {
    let service = Service::new("svc", "1.0.0", broker());
    let lifecycle = service.lifecycle();

    service
        .run_until(ServiceEnv::default().with_port(0), async {})
        .await
        .unwrap();

    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_every_teardown_runs_once_despite_failures() {
    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let mut failing = ScriptedSubscription::new("first", first.clone());
    failing.fail_teardown = true;

    let service = Service::new("svc", "1.0.0", broker())
        .with_subscription(failing)
        .with_subscription(ScriptedSubscription::new("second", second.clone()));

    service.run_until(env(), async {}).await.unwrap();

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_listen_failure_shuts_down_service() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let mut failing = ScriptedSubscription::new("flaky", teardowns.clone());
    failing.fail_listen = true;

    let service = Service::new("svc", "1.0.0", broker()).with_subscription(failing);
    let lifecycle = service.lifecycle();

    let result = service
        .run_until(env(), std::future::pending::<()>())
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::Subscription(SubscriptionError::Listen { .. }))
    ));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_publishers_flush_on_shutdown() {
    let memory = MemoryBroker::new();
    let service = Service::new("svc", "1.0.0", Arc::new(memory.clone()))
        .with_output("orders.placed")
        .on_start(|ctx| async move {
            for n in 0..3 {
                ctx.publish("orders.placed", &json!({ "n": n })).await?;
            }
            Ok::<(), ServiceError>(())
        });

    service.run_until(env(), async {}).await.unwrap();

    let published = memory.published("orders-placed").await;
    assert_eq!(published.len(), 3);
    let envelope = Envelope::from_slice(&published[0]).unwrap();
    assert_eq!(envelope.source(), "svc.1.0.0");
    assert_eq!(envelope.event_type(), "orders.placed");
}

#[tokio::test]
async fn test_publish_to_undeclared_output_fails() {
    let service = Service::new("svc", "1.0.0", broker()).on_start(|ctx| async move {
        let result = ctx.publish("orders.placed", &json!({})).await;
        assert!(matches!(result, Err(PublisherError::NotConfigured(_))));
        Ok::<(), ServiceError>(())
    });

    service.run_until(env(), async {}).await.unwrap();
}

#[tokio::test]
async fn test_failed_start_hook_tears_down() {
    let teardowns = Arc::new(AtomicUsize::new(0));
    let service = Service::new("svc", "1.0.0", broker())
        .with_subscription(ScriptedSubscription::new("only", teardowns.clone()))
        .on_start(|_ctx| async { Err(ServiceError::Startup("not today".to_string())) });

    let result = service.run_until(env(), async {}).await;

    assert!(matches!(result, Err(ServiceError::Startup(_))));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscription_setup_failure_aborts_startup() {
    let memory = MemoryBroker::new();
    memory.set_fail_on_connect(true);
    let service = Service::new("svc", "1.0.0", Arc::new(memory)).with_subscription(
        PullSubscription::new("orders.placed", |_ctx: Arc<ServiceContext>, _e: Envelope| async {
            true
        }),
    );
    let lifecycle = service.lifecycle();

    let result = service.run_until(env(), async {}).await;

    assert!(matches!(
        result,
        Err(ServiceError::Subscription(SubscriptionError::Setup { .. }))
    ));
    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_lifecycle_reaches_running_before_stop() {
    let service = Service::new("svc", "1.0.0", broker());
    let mut lifecycle = service.lifecycle();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let run = tokio::spawn(service.run_until(env(), async move {
        let _ = stop_rx.await;
    }));

    lifecycle
        .wait_for(|state| *state == Lifecycle::Running)
        .await
        .unwrap();
    stop_tx.send(()).unwrap();

    run.await.unwrap().unwrap();
    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
}

async fn hello() -> &'static str {
    "hello"
}

#[tokio::test]
async fn test_duplicate_route_fails_startup() {
    let service = Service::new("svc", "1.0.0", broker())
        .with_route("/orders", axum::routing::get(hello))
        .with_route("/orders", axum::routing::post(hello));
    let lifecycle = service.lifecycle();

    let result = service.run_until(env(), async {}).await;

    assert!(matches!(result, Err(ServiceError::RouteConflict(path)) if path == "/orders"));
    assert_eq!(*lifecycle.borrow(), Lifecycle::Stopped);
}

#[tokio::test]
async fn test_route_on_push_path_fails_subscription_setup() {
    let memory = MemoryBroker::new();
    let service = Service::new("svc", "1.0.0", Arc::new(memory.clone()))
        .with_route("/_courier/v1/push/audit", axum::routing::post(hello))
        .with_subscription(
            PushSubscription::new("orders.placed", |_ctx: Arc<ServiceContext>, _e: Envelope| async {
                true
            })
            .with_name("audit"),
        );

    let result = service
        .run_until(env().with_host("https://svc.example.com"), async {})
        .await;

    assert!(matches!(
        result,
        Err(ServiceError::Subscription(SubscriptionError::Setup { .. }))
    ));
    assert_eq!(memory.subscription_count().await, 0);
}

#[tokio::test]
async fn test_root_route_replaces_health_check() {
    let service = Service::new("svc", "1.0.0", broker()).with_route("/", axum::routing::get(hello));

    service.run_until(env(), async {}).await.unwrap();
}
