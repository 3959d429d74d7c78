//! Built-in demo workflows hosted by the CLI.
//!
//! - `greeting`: two steps around a one-second durable sleep.
//! - `approval`: opens a ticket, then waits for an `approval` event.
//! - `flaky`: a step that fails its first attempts and is retried with backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde_json::{Value, json};
use stepwise_core::service::hash::ContentHasher;
use stepwise_core::workflow::{Context, FnWorkflow, StoreProvider, Workflow, WorkflowBinding};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::WorkflowError;
use stepwise_types::event::{TriggerEvent, WaitForEventOptions};
use stepwise_types::step::{Backoff, StepConfig};

/// Names accepted by `stepwise run`.
pub const NAMES: [&str; 3] = ["greeting", "approval", "flaky"];

/// Bind a demo workflow by name. Returns None for unknown names.
pub fn bind(
    name: &str,
    provider: Arc<dyn StoreProvider>,
    hasher: Arc<dyn ContentHasher>,
    config: EngineConfig,
) -> Option<WorkflowBinding> {
    let binding = match name {
        "greeting" => WorkflowBinding::new(name, greeting(), provider, hasher, config),
        "approval" => WorkflowBinding::new(name, approval(), provider, hasher, config),
        "flaky" => WorkflowBinding::new(name, flaky(), provider, hasher, config),
        _ => return None,
    };
    Some(binding)
}

fn greeting() -> impl Workflow {
    FnWorkflow::new(|event: TriggerEvent, ctx: Context| async move {
        let name = event.payload["name"].as_str().unwrap_or("world").to_string();

        let greeting: String = ctx
            .do_step("compose greeting", || async { Ok(format!("Hello, {name}!")) })
            .await?;
        ctx.sleep("let it sink in", "1 second").await?;
        let farewell: String = ctx
            .do_step("sign off", || async { Ok(format!("Goodbye, {name}.")) })
            .await?;

        Ok(json!({ "greeting": greeting, "farewell": farewell }))
    })
}

fn approval() -> impl Workflow {
    FnWorkflow::new(|event: TriggerEvent, ctx: Context| async move {
        let request = event.payload.get("request").cloned().unwrap_or(Value::Null);
        let timeout = event.payload["timeout"].as_str().unwrap_or("1 hour").to_string();

        let ticket: Value = ctx
            .do_step("open ticket", || async {
                Ok(json!({ "request": request, "opened_at": Utc::now().to_rfc3339() }))
            })
            .await?;

        let decision = ctx
            .wait_for_event(
                "await approval",
                WaitForEventOptions::new("approval").with_timeout(timeout),
            )
            .await?;
        let approved = decision.payload["approved"].as_bool().unwrap_or(false);

        let closed: Value = ctx
            .do_step("close ticket", || async {
                Ok(json!({ "approved": approved, "closed_at": Utc::now().to_rfc3339() }))
            })
            .await?;

        Ok(json!({ "ticket": ticket, "decision": closed }))
    })
}

fn flaky() -> impl Workflow {
    FnWorkflow::new(|event: TriggerEvent, ctx: Context| async move {
        let failures = event.payload["failures"]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(2);
        let attempts = AtomicU32::new(0);

        let config = StepConfig::new()
            .retries(failures + 1, "200 ms")
            .backoff(Backoff::Exponential)
            .timeout("5 seconds");
        let reply: Value = ctx
            .do_step_with("call upstream", config, || async {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= failures {
                    Err(WorkflowError::named(
                        "UpstreamError",
                        format!("upstream unavailable on attempt {attempt}"),
                    ))
                } else {
                    Ok(json!({ "attempt": attempt }))
                }
            })
            .await?;

        Ok(json!({ "reply": reply }))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use stepwise_infra::crypto::hash::Sha256ContentHasher;
    use stepwise_infra::sqlite::durable_store::SqliteStoreProvider;
    use stepwise_infra::sqlite::pool::DatabasePool;
    use stepwise_types::instance::InstanceStatus;

    use super::*;

    async fn binding(name: &str) -> WorkflowBinding {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("demos.db").display());
        std::mem::forget(dir);
        let pool = DatabasePool::new(&url).await.unwrap();
        bind(
            name,
            Arc::new(SqliteStoreProvider::new(pool)),
            Arc::new(Sha256ContentHasher::new()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_demo() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("demos.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let bound = bind(
            "nope",
            Arc::new(SqliteStoreProvider::new(pool)),
            Arc::new(Sha256ContentHasher::new()),
            EngineConfig::default(),
        );
        assert!(bound.is_none());
    }

    #[tokio::test]
    async fn test_greeting_completes() {
        let greeting = binding("greeting").await;
        let handle = greeting.create(None, json!({"name": "Ada"})).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_status(InstanceStatus::Complete))
            .await
            .unwrap()
            .unwrap();
        let details = handle.status().await.unwrap();
        assert_eq!(
            details.output,
            Some(json!({ "greeting": "Hello, Ada!", "farewell": "Goodbye, Ada." }))
        );
    }

    #[tokio::test]
    async fn test_approval_waits_for_event() {
        let approval = binding("approval").await;
        let handle = approval
            .create(Some("req-7".into()), json!({"request": "new laptop"}))
            .await
            .unwrap();
        handle.wait_for_status(InstanceStatus::Running).await.unwrap();

        handle.send_event("approval", json!({"approved": true})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_status(InstanceStatus::Complete))
            .await
            .unwrap()
            .unwrap();

        let output = handle.status().await.unwrap().output.unwrap();
        assert_eq!(output["ticket"]["request"], json!("new laptop"));
        assert_eq!(output["decision"]["approved"], json!(true));
    }

    #[tokio::test]
    async fn test_flaky_succeeds_after_retries() {
        let flaky = binding("flaky").await;
        let handle = flaky.create(None, json!({"failures": 2})).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.wait_for_status(InstanceStatus::Complete))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            handle.status().await.unwrap().output,
            Some(json!({ "reply": { "attempt": 3 } }))
        );
    }
}
