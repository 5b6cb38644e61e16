// Test Handlers
// Small step and resource types shared by the execution tests

use crate::handlers::{HandlerRegistry, Resource, ResourceSchema, Resources, Step, StepSchema};

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of handler activity
#[derive(Debug, Default)]
pub struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

#[derive(Debug, Deserialize)]
pub struct StepArgs {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub delay_ms: u64,
}

/// Returns its `value` argument as `output.value`
pub struct Echo {
    journal: Arc<Journal>,
}

#[async_trait::async_trait]
impl Step for Echo {
    type Input = StepArgs;
    type Output = Value;

    fn schema(&self) -> StepSchema {
        StepSchema::new().output("value")
    }

    async fn run(&self, _resources: &Resources, input: StepArgs) -> anyhow::Result<Value> {
        if input.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(input.delay_ms)).await;
        }
        if let Some(label) = &input.label {
            self.journal.record(format!("run:{}", label));
        }
        Ok(json!({ "value": input.value }))
    }
}

/// Appends its value to the bound store and reports which store it saw
pub struct Record {
    journal: Arc<Journal>,
}

#[async_trait::async_trait]
impl Step for Record {
    type Input = StepArgs;
    type Output = Value;

    fn schema(&self) -> StepSchema {
        StepSchema::new()
            .output("value")
            .output("store_id")
            .resource("store", "store")
    }

    async fn run(&self, resources: &Resources, input: StepArgs) -> anyhow::Result<Value> {
        let store = resources.get::<Store>("store")?;
        store.entries.lock().unwrap().push(input.value.clone());
        if let Some(label) = &input.label {
            self.journal.record(format!("run:{}", label));
        }
        Ok(json!({ "value": input.value, "store_id": store.id }))
    }
}

/// Needs any resource with the `sql` capability
pub struct Query;

#[async_trait::async_trait]
impl Step for Query {
    type Input = Value;
    type Output = Value;

    fn schema(&self) -> StepSchema {
        StepSchema::new().output("rows").resource("db", "sql")
    }

    async fn run(&self, resources: &Resources, _input: Value) -> anyhow::Result<Value> {
        let db = resources.instance("db").map(|i| i.resource_type().to_string());
        Ok(json!({ "rows": [], "engine": db }))
    }
}

/// Always fails with "boom", optionally after a delay
pub struct Fail;

#[async_trait::async_trait]
impl Step for Fail {
    type Input = StepArgs;
    type Output = Value;

    fn schema(&self) -> StepSchema {
        StepSchema::new().output("value")
    }

    async fn run(&self, _resources: &Resources, input: StepArgs) -> anyhow::Result<Value> {
        if input.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(input.delay_ms)).await;
        }
        anyhow::bail!("boom")
    }
}

pub struct Panic;

#[async_trait::async_trait]
impl Step for Panic {
    type Input = Value;
    type Output = Value;

    async fn run(&self, _resources: &Resources, _input: Value) -> anyhow::Result<Value> {
        panic!("handler exploded")
    }
}

/// Instance of the `store` resource family
#[derive(Debug)]
pub struct Store {
    pub id: usize,
    pub label: String,
    pub entries: Mutex<Vec<Value>>,
    fail_destroy: bool,
    panic_destroy: bool,
}

#[derive(Debug, Deserialize)]
pub struct StoreArgs {
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub fail_create: bool,
    #[serde(default)]
    pub fail_destroy: bool,
    #[serde(default)]
    pub panic_destroy: bool,
}

fn default_label() -> String {
    "store".to_string()
}

pub struct StoreResource {
    journal: Arc<Journal>,
    next_id: AtomicUsize,
    capabilities: &'static [&'static str],
}

impl StoreResource {
    pub fn new(journal: Arc<Journal>, capabilities: &'static [&'static str]) -> Self {
        Self {
            journal,
            next_id: AtomicUsize::new(0),
            capabilities,
        }
    }
}

#[async_trait::async_trait]
impl Resource for StoreResource {
    type Input = StoreArgs;
    type Instance = Store;

    fn schema(&self) -> ResourceSchema {
        self.capabilities
            .iter()
            .fold(ResourceSchema::new(), |schema, tag| schema.capability(*tag))
    }

    async fn create(&self, input: StoreArgs) -> anyhow::Result<Store> {
        anyhow::ensure!(!input.fail_create, "connection refused");
        self.journal.record(format!("create:{}", input.label));
        Ok(Store {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            label: input.label,
            entries: Mutex::new(Vec::new()),
            fail_destroy: input.fail_destroy,
            panic_destroy: input.panic_destroy,
        })
    }

    async fn destroy(&self, instance: Arc<Store>) -> anyhow::Result<()> {
        self.journal.record(format!("destroy:{}", instance.label));
        if instance.panic_destroy {
            panic!("destroy exploded");
        }
        anyhow::ensure!(!instance.fail_destroy, "refused to close {}", instance.label);
        Ok(())
    }
}

/// Registry with every test handler, recording into `journal`
pub fn registry_with(journal: Arc<Journal>) -> HandlerRegistry {
    HandlerRegistry::new()
        .with_step(
            "echo",
            Echo {
                journal: journal.clone(),
            },
        )
        .with_step(
            "record",
            Record {
                journal: journal.clone(),
            },
        )
        .with_step("query", Query)
        .with_step("fail", Fail)
        .with_step("panic", Panic)
        .with_resource("store", StoreResource::new(journal.clone(), &[]))
        .with_resource("postgres", StoreResource::new(journal.clone(), &["sql"]))
        .with_resource("kv", StoreResource::new(journal, &[]))
}

pub fn registry() -> HandlerRegistry {
    registry_with(Arc::new(Journal::default()))
}
