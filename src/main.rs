//! Agora sync demo
//!
//! Drives a scripted client session against the in-memory backend and prints
//! the engine state after every step as JSON.

use std::sync::Arc;
use std::time::Duration;

use agora_client::cache::keys;
use agora_client::memory::{MemoryBackend, MemoryTransportFactory};
use agora_client::stores::{Fetcher, QuerySnapshot};
use agora_client::{
    CancelSignal, EngineSnapshot, EnvironmentSignal, OperationGuard, QueryStore, ScopedCallbacks,
    SyncConfig, SyncEngine,
};
use agora_shared::{CacheKey, ChangeEvent, EntityDomain, Table};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PRINCIPAL: &str = "demo-user";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StepReport {
    step: &'static str,
    at: DateTime<Utc>,
    fetches: u64,
    engine: EngineSnapshot,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionReport {
    started_at: DateTime<Utc>,
    steps: Vec<StepReport>,
    queries: Vec<QuerySnapshot>,
}

struct Session {
    engine: SyncEngine,
    backend: MemoryBackend,
    store: Arc<QueryStore>,
    steps: Vec<StepReport>,
}

impl Session {
    async fn record(&mut self, step: &'static str) {
        self.engine.settle().await;
        tracing::info!(step, "step complete");
        self.steps.push(StepReport {
            step,
            at: Utc::now(),
            fetches: self.store.fetch_count(),
            engine: self.engine.snapshot(),
        });
    }
}

fn demo_fetcher() -> Fetcher {
    Arc::new(|key: CacheKey, _signal: CancelSignal| {
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!({ "key": key.to_string(), "fetchedAt": Utc::now() }))
        }
        .boxed()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=debug,agora_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env();
    let backend = MemoryBackend::new().with_row_filters();
    let store = Arc::new(QueryStore::with_timeouts(
        demo_fetcher(),
        OperationGuard::new(config.default_timeout),
        config.key_timeouts(),
    ));
    let engine = SyncEngine::new(
        config,
        Arc::new(MemoryTransportFactory::new(backend.clone())),
        store.clone(),
    )?;

    for key in [
        keys::session(),
        keys::current_user(),
        keys::list(EntityDomain::Post, "recent"),
        keys::detail(EntityDomain::Post, "p1"),
        keys::comments_for(EntityDomain::Post, "p1"),
        keys::unread(PRINCIPAL),
        keys::conversations(PRINCIPAL),
        keys::stats(EntityDomain::Post),
    ] {
        store.observe(&key);
        store.seed(&key, json!(null));
    }

    let started_at = Utc::now();
    let mut session = Session {
        engine,
        backend,
        store,
        steps: Vec::new(),
    };

    session.engine.start().await?;
    session.engine.sign_in(PRINCIPAL).await;
    session.engine.scoped_streams().register_callbacks(
        "inbox",
        ScopedCallbacks::new().on_message(|event| {
            tracing::info!(message = ?event.field("id"), "new message");
        }),
    );
    session.record("connected").await;

    session
        .backend
        .publish(ChangeEvent::insert(
            Table::Comments,
            json!({"id": "c1", "parent_type": "post", "parent_id": "p1", "author_id": "someone"}),
        ))
        .await;
    session.record("comment-inserted").await;

    session.engine.handle_signal(EnvironmentSignal::Focus).await;
    session.engine.handle_signal(EnvironmentSignal::Foreground).await;
    session.record("focus-and-foreground").await;

    session.engine.handle_signal(EnvironmentSignal::NetworkOffline).await;
    session.engine.handle_signal(EnvironmentSignal::NetworkOnline).await;
    session.record("network-flap").await;

    session.engine.core().recreate_client().await;
    session.record("transport-recreated").await;

    session
        .backend
        .publish(ChangeEvent::insert(
            Table::Messages,
            json!({"id": "m1", "conversation_id": "conv-1", "sender_id": "someone", "recipient_id": PRINCIPAL}),
        ))
        .await;
    session.record("message-received").await;

    let report = SessionReport {
        started_at,
        queries: session.store.snapshot(),
        steps: std::mem::take(&mut session.steps),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    session.engine.shutdown().await;
    Ok(())
}
