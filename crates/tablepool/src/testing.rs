//! Shared fixtures for pool tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::ConstructionError;
use crate::event::{EventKind, PoolEvent, PoolListener, Source};
use crate::factory::ResourceFactory;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub(crate) struct Counters {
    pub attempts: AtomicUsize,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub live: AtomicUsize,
}

impl Counters {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Stand-in for an open table: counts itself open until dropped.
pub(crate) struct TestTable {
    pub id: usize,
    pub writes: AtomicUsize,
    counters: Arc<Counters>,
}

impl Drop for TestTable {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

type OpenHook = Box<dyn Fn() + Send + Sync>;

/// Clones share counters, the failure list and the open hook, so a test can
/// keep steering a factory it has handed to a pool.
#[derive(Default, Clone)]
pub(crate) struct TestFactory {
    pub counters: Arc<Counters>,
    failing: Arc<Mutex<HashSet<String>>>,
    on_open: Arc<OnceLock<OpenHook>>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    /// Run `hook` after every successful open, before the table is handed back.
    pub fn on_open(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.on_open.set(Box::new(hook));
    }
}

impl ResourceFactory for TestFactory {
    type Resource = TestTable;

    fn open(&self, name: &str) -> Result<TestTable, ConstructionError> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(name) {
            return Err(ConstructionError::new(format!("table '{name}' is corrupt")));
        }
        let id = self.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        let table = TestTable {
            id,
            writes: AtomicUsize::new(0),
            counters: Arc::clone(&self.counters),
        };
        if let Some(hook) = self.on_open.get() {
            hook();
        }
        Ok(table)
    }

    fn refresh(&self, _name: &str, _resource: &mut TestTable) {
        self.counters.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recorded {
    pub source: Source,
    pub name: Option<String>,
    pub kind: EventKind,
    pub segment: Option<u32>,
    pub slot: Option<u32>,
}

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl PoolListener for RecordingListener {
    fn on_event(&self, event: &PoolEvent<'_>) {
        self.events.lock().unwrap().push(Recorded {
            source: event.source,
            name: event.name.map(str::to_string),
            kind: event.kind,
            segment: event.segment,
            slot: event.slot,
        });
    }
}
