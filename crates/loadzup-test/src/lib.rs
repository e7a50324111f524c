//! Helpers for testing the loaders.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Loads are spawned onto the Tokio runtime, so tests need to run within one. Use
//!    `#[tokio::test]`, and `start_paused = true` when a test relies on delays.
//!
//!  - A [`TestLoader`] only knows about keys that were scripted on it. Everything else fails
//!    with [`LoadError::NotFound`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use loadzup::{
    AnyValue, Bundle, LoadError, LoadResult, Loaded, Loader, Options, Prototype, ResourceKey,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `loadzup` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("loadzup=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Keeps scripted loads pending until it is opened.
///
/// Loads that start after the gate was opened pass right through.
#[derive(Clone, Debug)]
pub struct Gate {
    sender: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Lets all pending and future loads behind this gate continue.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        receiver.wait_for(|open| *open).await.ok();
    }
}

#[derive(Clone, Default)]
struct Script {
    value: Option<Loaded>,
    delay: Duration,
    gate: Option<Gate>,
    failures: VecDeque<LoadError>,
}

#[derive(Default)]
struct State {
    scripts: BTreeMap<ResourceKey, Script>,
    invocations: BTreeMap<ResourceKey, usize>,
    last_options: BTreeMap<ResourceKey, Options>,
}

/// A [`Loader`] with scripted responses.
///
/// Every key is configured with the value it resolves to, and optionally a delay, a
/// [`Gate`], or a number of failures to return before succeeding. All invocations of
/// [`Loader::load`] are counted per key.
#[derive(Clone, Default)]
pub struct TestLoader {
    state: Arc<Mutex<State>>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, key: impl Into<ResourceKey>, f: impl FnOnce(&mut Script)) {
        let mut state = self.state.lock().unwrap();
        f(state.scripts.entry(key.into()).or_default());
    }

    /// Resolves `key` to `value`.
    pub fn with_value(self, key: impl Into<ResourceKey>, value: Loaded) -> Self {
        self.script(key, |script| script.value = Some(value));
        self
    }

    /// Resolves `key` to a bundle.
    pub fn with_bundle(self, key: impl Into<ResourceKey>, bundle: TestBundle) -> Self {
        self.with_value(key, Loaded::bundle(bundle))
    }

    /// Delays every load of `key`.
    pub fn with_delay(self, key: impl Into<ResourceKey>, delay: Duration) -> Self {
        self.script(key, |script| script.delay = delay);
        self
    }

    /// Fails the next load of `key` with `error`.
    ///
    /// Failures queue up, loads after that resolve to the scripted value again.
    pub fn with_failure(self, key: impl Into<ResourceKey>, error: LoadError) -> Self {
        self.script(key, |script| script.failures.push_back(error));
        self
    }

    /// Holds all loads of `key` until the returned gate is opened.
    pub fn gate(&self, key: impl Into<ResourceKey>) -> Gate {
        let gate = Gate::new();
        self.script(key, |script| script.gate = Some(gate.clone()));
        gate
    }

    /// The number of times `key` was requested from this loader.
    pub fn invocations(&self, key: impl Into<ResourceKey>) -> usize {
        let state = self.state.lock().unwrap();
        state.invocations.get(&key.into()).copied().unwrap_or(0)
    }

    /// The number of times any key was requested from this loader.
    pub fn total_invocations(&self) -> usize {
        self.state.lock().unwrap().invocations.values().sum()
    }

    /// The options passed with the most recent load of `key`.
    pub fn last_options(&self, key: impl Into<ResourceKey>) -> Option<Options> {
        let state = self.state.lock().unwrap();
        state.last_options.get(&key.into()).cloned()
    }
}

impl Loader for TestLoader {
    fn supports(&self, key: &ResourceKey) -> bool {
        self.state.lock().unwrap().scripts.contains_key(key)
    }

    fn load(&self, key: &ResourceKey, options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        let (script, failure) = {
            let mut state = self.state.lock().unwrap();
            *state.invocations.entry(key.clone()).or_default() += 1;
            state.last_options.insert(key.clone(), options.clone());

            match state.scripts.get_mut(key) {
                Some(script) => {
                    let failure = script.failures.pop_front();
                    (Some(script.clone()), failure)
                }
                None => (None, None),
            }
        };

        let key = key.clone();
        Box::pin(async move {
            let script = script.ok_or_else(|| LoadError::NotFound(key.clone()))?;
            if let Some(gate) = &script.gate {
                gate.wait().await;
            }
            if !script.delay.is_zero() {
                tokio::time::sleep(script.delay).await;
            }
            if let Some(error) = failure {
                return Err(error);
            }
            script.value.ok_or(LoadError::NotFound(key))
        })
    }
}

/// A [`Bundle`] that counts how often it was unloaded.
///
/// Clones share their counters, so keep one around to inspect a bundle handed to a
/// [`TestLoader`].
#[derive(Clone, Debug)]
pub struct TestBundle {
    name: Arc<str>,
    assets: Arc<BTreeMap<String, Loaded>>,
    unloads: Arc<AtomicUsize>,
}

impl TestBundle {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            assets: Default::default(),
            unloads: Default::default(),
        }
    }

    /// Adds an asset that can be loaded from this bundle.
    pub fn with_asset(mut self, asset: &str, value: Loaded) -> Self {
        Arc::make_mut(&mut self.assets).insert(asset.to_owned(), value);
        self
    }

    /// How often [`Bundle::unload`] was called.
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl Bundle for TestBundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_asset(&self, asset: &str) -> BoxFuture<'static, LoadResult<Loaded>> {
        let result = self
            .assets
            .get(asset)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(format!("{}/{asset}", self.name).into()));
        Box::pin(futures::future::ready(result))
    }

    fn unload(&self) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`Prototype`] producing consecutive numbers, starting at zero.
#[derive(Clone, Debug, Default)]
pub struct TestPrototype {
    instances: Arc<AtomicUsize>,
}

impl TestPrototype {
    /// How many instances were created so far.
    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

impl Prototype for TestPrototype {
    fn instantiate(&self) -> AnyValue {
        Arc::new(self.instances.fetch_add(1, Ordering::SeqCst))
    }
}
