use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use futures::future::{BoxFuture, join_all};
use rand::Rng;
use serde::{Deserialize, Serialize};

use loadzup::{
    Bundle, BundleLoader, BundleLocator, LoadError, LoadResult, Loaded, Loader, Options,
    ResourceKey,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// How long every underlying load takes.
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    /// The probability of an underlying load failing, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    pub bundles: Vec<BundleSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BundleSpec {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Keeps track of what happened to the bundles of a workload.
#[derive(Debug, Default)]
pub struct Counters {
    pub loaded: AtomicUsize,
    pub failed: AtomicUsize,
    pub unloaded: AtomicUsize,
}

impl Counters {
    pub fn get(&self) -> (usize, usize, usize) {
        (
            self.loaded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.unloaded.load(Ordering::Relaxed),
        )
    }
}

/// A bundle without any assets.
struct SyntheticBundle {
    name: String,
    counters: Arc<Counters>,
}

impl Bundle for SyntheticBundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn load_asset(&self, asset: &str) -> BoxFuture<'static, LoadResult<Loaded>> {
        let key = ResourceKey::new(format!("{}/{asset}", self.name));
        Box::pin(futures::future::ready(Err(LoadError::NotFound(key))))
    }

    fn unload(&self) {
        self.counters.unloaded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Simulates a slow and possibly unreliable source of bundles.
pub struct SyntheticLoader {
    names: BTreeMap<ResourceKey, String>,
    delay: Duration,
    failure_rate: f64,
    counters: Arc<Counters>,
}

impl Loader for SyntheticLoader {
    fn supports(&self, key: &ResourceKey) -> bool {
        self.names.contains_key(key)
    }

    fn load(&self, key: &ResourceKey, _options: &Options) -> BoxFuture<'static, LoadResult<Loaded>> {
        let Some(name) = self.names.get(key).cloned() else {
            return Box::pin(futures::future::ready(Err(LoadError::NotFound(key.clone()))));
        };

        let fail = rand::rng().random_bool(self.failure_rate);
        let delay = self.delay;
        let counters = Arc::clone(&self.counters);

        Box::pin(async move {
            tokio::time::sleep(delay).await;
            if fail {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(LoadError::status(503));
            }
            counters.loaded.fetch_add(1, Ordering::Relaxed);
            Ok(Loaded::bundle(SyntheticBundle { name, counters }))
        })
    }
}

/// A workload that is ready to run.
pub struct ParsedWorkload {
    pub concurrency: usize,
    pub bundles: Vec<BundleSpec>,
    pub loader: BundleLoader<SyntheticLoader>,
    pub counters: Arc<Counters>,
}

pub fn prepare_workload(
    workload: Workload,
    locator: &BundleLocator,
    load_timeout: Option<Duration>,
) -> Result<ParsedWorkload> {
    ensure!(!workload.bundles.is_empty(), "workload without bundles");
    ensure!(workload.concurrency > 0, "workload concurrency must be positive");
    ensure!(
        (0.0..=1.0).contains(&workload.failure_rate),
        "failure rate {} is not between 0 and 1",
        workload.failure_rate
    );

    let names = workload
        .bundles
        .iter()
        .flat_map(|bundle| std::iter::once(&bundle.name).chain(&bundle.dependencies))
        .map(|name| (locator.key_for(name), name.clone()))
        .collect();

    let counters = Arc::new(Counters::default());
    let loader = SyntheticLoader {
        names,
        delay: workload.delay,
        failure_rate: workload.failure_rate,
        counters: Arc::clone(&counters),
    };
    let memoized = loadzup::MemoizingLoader::new(loader).with_timeout(load_timeout);

    Ok(ParsedWorkload {
        concurrency: workload.concurrency,
        bundles: workload.bundles,
        loader: BundleLoader::with_memoized(memoized, locator.clone()),
        counters,
    })
}

/// Loads a bundle along with its dependencies, then releases all of them again.
///
/// Returns `false` if any of the loads failed.
pub async fn process_bundle(loader: &BundleLoader<SyntheticLoader>, bundle: &BundleSpec) -> bool {
    let options = Options::default();

    let root = loader.load(&bundle.name, &options);
    let dependencies = bundle
        .dependencies
        .iter()
        .map(|dependency| loader.load_dependency(dependency, &options, &bundle.name));
    let (root, dependencies) = futures::join!(root, join_all(dependencies));

    let mut success = true;

    // failed loads have already released their references
    match root {
        Ok(handle) => {
            drop(handle);
            loader.unload(&bundle.name);
        }
        Err(_) => success = false,
    }
    for (dependency, result) in bundle.dependencies.iter().zip(dependencies) {
        match result {
            Ok(handle) => {
                drop(handle);
                loader.unload_dependency(dependency, &bundle.name);
            }
            Err(_) => success = false,
        }
    }

    success
}
