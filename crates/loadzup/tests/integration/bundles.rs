use std::any::type_name;
use std::time::Duration;

use loadzup::bundles::RefCountSnapshot;
use loadzup::config::BundlesConfig;
use loadzup::{BundleLoader, BundleLocator, LoadError, Loaded, Options, ResourceKey};
use loadzup_test::{TestBundle, TestLoader, setup};

fn locator() -> BundleLocator {
    BundleLocator::new("https://cdn.example.com/bundles", "ios")
}

fn key(name: &str) -> ResourceKey {
    locator().key_for(name)
}

/// Creates a loader that knows about a [`TestBundle`] for each of `names`.
fn setup_bundles(names: &[&str]) -> (TestLoader, BundleLoader<TestLoader>, Vec<TestBundle>) {
    let mut loader = TestLoader::new();
    let mut bundles = Vec::new();
    for name in names {
        let bundle = TestBundle::new(name);
        loader = loader.with_bundle(key(name), bundle.clone());
        bundles.push(bundle);
    }

    let bundle_loader = BundleLoader::new(loader.clone(), locator());
    (loader, bundle_loader, bundles)
}

#[tokio::test]
async fn test_load_and_unload() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["hero"]);

    let handle = bundle_loader.load("hero", &Options::default()).await.unwrap();
    assert_eq!(handle.name(), "hero");
    assert_eq!(
        bundle_loader.ref_count("hero"),
        Some(RefCountSnapshot {
            root: true,
            dependents: vec![],
            loading: 1,
            has_bundle: true,
        })
    );

    drop(handle);
    assert_eq!(bundle_loader.ref_count("hero").unwrap().loading, 0);
    assert_eq!(bundles[0].unloads(), 0);

    assert!(bundle_loader.unload("hero"));
    assert_eq!(bundles[0].unloads(), 1);
    assert_eq!(bundle_loader.tracked(), 0);
    assert!(!bundle_loader.memoized().is_cached(&key("hero")));

    // a released bundle is loaded again from scratch
    bundle_loader.load("hero", &Options::default()).await.unwrap();
    assert_eq!(loader.invocations(key("hero")), 2);
}

#[tokio::test]
async fn test_handle_keeps_bundle_loaded() {
    setup();

    let (_loader, bundle_loader, bundles) = setup_bundles(&["hero"]);

    let handle = bundle_loader.load("hero", &Options::default()).await.unwrap();
    assert!(!bundle_loader.unload("hero"));
    assert_eq!(bundles[0].unloads(), 0);

    drop(handle);
    assert_eq!(bundles[0].unloads(), 1);
    assert_eq!(bundle_loader.tracked(), 0);
}

#[tokio::test]
async fn test_unload_before_load_completes() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["hero"]);
    let gate = loader.gate(key("hero"));

    let load = bundle_loader.load("hero", &Options::default());
    assert!(!bundle_loader.unload("hero"));

    let snapshot = bundle_loader.ref_count("hero").unwrap();
    assert!(!snapshot.root);
    assert_eq!(snapshot.loading, 1);

    gate.open();
    let handle = load.await.unwrap();
    assert_eq!(bundles[0].unloads(), 0);

    drop(handle);
    assert_eq!(bundles[0].unloads(), 1);
    assert_eq!(bundle_loader.tracked(), 0);
}

#[tokio::test]
async fn test_dependencies_are_coalesced() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["common"]);

    let first = bundle_loader
        .load_dependency("common", &Options::default(), "hero")
        .await
        .unwrap();
    let second = bundle_loader
        .load_dependency("common", &Options::default(), "hero")
        .await
        .unwrap();
    drop((first, second));

    let snapshot = bundle_loader.ref_count("common").unwrap();
    assert_eq!(snapshot.dependents, vec!["hero".to_owned()]);
    assert_eq!(snapshot.loading, 0);
    assert_eq!(loader.invocations(key("common")), 1);

    bundle_loader.unload_dependency("common", "hero");
    assert_eq!(bundles[0].unloads(), 1);
    assert_eq!(bundle_loader.tracked(), 0);
}

#[tokio::test]
async fn test_multiple_holders() {
    setup();

    let (_loader, bundle_loader, bundles) = setup_bundles(&["common"]);

    bundle_loader.load("common", &Options::default()).await.unwrap();
    bundle_loader
        .load_dependency("common", &Options::default(), "hero")
        .await
        .unwrap();

    assert!(!bundle_loader.unload("common"));
    assert_eq!(bundles[0].unloads(), 0);
    assert_eq!(
        bundle_loader.ref_count("common").unwrap().dependents,
        vec!["hero".to_owned()]
    );

    bundle_loader.unload_dependency("common", "hero");
    assert_eq!(bundles[0].unloads(), 1);

    // nothing left to release
    bundle_loader.unload_dependency("common", "hero");
    assert!(!bundle_loader.unload("common"));
    assert_eq!(bundles[0].unloads(), 1);
}

#[tokio::test]
async fn test_unload_root_of_dependency() {
    setup();

    let (_loader, bundle_loader, bundles) = setup_bundles(&["common"]);

    bundle_loader
        .load_dependency("common", &Options::default(), "hero")
        .await
        .unwrap();

    let before = bundle_loader.ref_count("common");
    assert!(!bundle_loader.unload("common"));
    assert_eq!(bundle_loader.ref_count("common"), before);
    assert_eq!(bundles[0].unloads(), 0);
}

#[tokio::test]
async fn test_unload_unknown() {
    setup();

    let (_loader, bundle_loader, _bundles) = setup_bundles(&["hero"]);

    assert!(!bundle_loader.unload("never-loaded"));
    bundle_loader.unload_dependency("never-loaded", "hero");
    assert_eq!(bundle_loader.ref_count("never-loaded"), None);
    assert_eq!(bundle_loader.tracked(), 0);
}

#[tokio::test]
async fn test_cancelled_load_releases_loading_reference() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["hero"]);
    let gate = loader.gate(key("hero"));

    drop(bundle_loader.load("hero", &Options::default()));
    let snapshot = bundle_loader.ref_count("hero").unwrap();
    assert!(snapshot.root);
    assert_eq!(snapshot.loading, 0);

    // the load itself keeps running and ends up in the cache
    gate.open();
    while !bundle_loader.memoized().is_cached(&key("hero")) {
        tokio::task::yield_now().await;
    }

    assert!(bundle_loader.unload("hero"));
    assert_eq!(bundles[0].unloads(), 1);
    assert!(!bundle_loader.memoized().is_cached(&key("hero")));
}

/// Waits for the running load of `name` to complete.
async fn settle(bundle_loader: &BundleLoader<TestLoader>, name: &str) {
    while bundle_loader.memoized().is_loading(&key(name)) {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_abandoned_load_is_unloaded_once_complete() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["hero"]);
    let gate = loader.gate(key("hero"));

    drop(bundle_loader.load("hero", &Options::default()));
    assert!(bundle_loader.unload("hero"));
    assert_eq!(bundle_loader.tracked(), 0);
    assert!(bundle_loader.memoized().is_loading(&key("hero")));
    assert_eq!(bundles[0].unloads(), 0);

    gate.open();
    settle(&bundle_loader, "hero").await;

    assert_eq!(bundles[0].unloads(), 1);
    assert!(!bundle_loader.memoized().is_cached(&key("hero")));
}

#[tokio::test]
async fn test_abandoned_dependency_is_unloaded_once_complete() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["common"]);
    let gate = loader.gate(key("common"));

    drop(bundle_loader.load_dependency("common", &Options::default(), "hero"));
    assert_eq!(
        bundle_loader.ref_count("common").unwrap().dependents,
        vec!["hero".to_owned()]
    );

    bundle_loader.unload_dependency("common", "hero");
    assert_eq!(bundle_loader.tracked(), 0);

    gate.open();
    settle(&bundle_loader, "common").await;

    assert_eq!(bundles[0].unloads(), 1);
    assert!(!bundle_loader.memoized().is_cached(&key("common")));
}

#[tokio::test]
async fn test_abandoned_load_is_picked_up_again() {
    setup();

    let (loader, bundle_loader, bundles) = setup_bundles(&["hero"]);
    let gate = loader.gate(key("hero"));

    drop(bundle_loader.load("hero", &Options::default()));
    assert!(bundle_loader.unload("hero"));

    // joins the load that is still running instead of starting another one
    let load = bundle_loader.load("hero", &Options::default());
    gate.open();
    let handle = load.await.unwrap();

    assert_eq!(loader.invocations(key("hero")), 1);
    assert_eq!(bundles[0].unloads(), 0);
    assert!(bundle_loader.memoized().is_cached(&key("hero")));

    drop(handle);
    assert!(bundle_loader.unload("hero"));
    assert_eq!(bundles[0].unloads(), 1);
}

#[tokio::test]
async fn test_failed_load_releases_references() {
    setup();

    let bundle = TestBundle::new("hero");
    let loader = TestLoader::new()
        .with_bundle(key("hero"), bundle.clone())
        .with_failure(key("hero"), LoadError::status(404));
    let bundle_loader = BundleLoader::new(loader, locator());

    let err = bundle_loader
        .load("hero", &Options::default())
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::status(404));
    assert_eq!(bundle_loader.tracked(), 0);
    assert_eq!(bundle.unloads(), 0);

    // the failure was not cached
    let handle = bundle_loader.load("hero", &Options::default()).await.unwrap();
    assert_eq!(handle.name(), "hero");
}

#[tokio::test]
async fn test_failed_dependency_releases_references() {
    setup();

    let (_loader, bundle_loader, _bundles) = setup_bundles(&[]);

    let err = bundle_loader
        .load_dependency("missing", &Options::default(), "hero")
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::NotFound(key("missing")));
    assert_eq!(bundle_loader.tracked(), 0);
}

#[tokio::test]
async fn test_load_asset() {
    setup();

    let bundle = TestBundle::new("hero").with_asset("sword", Loaded::shared(String::from("steel")));
    let loader = TestLoader::new().with_bundle(key("hero"), bundle);
    let bundle_loader = BundleLoader::new(loader, locator());

    let handle = bundle_loader.load("hero", &Options::default()).await.unwrap();

    let sword = handle.load_asset_as::<String>("sword").await.unwrap();
    assert_eq!(sword.as_str(), "steel");

    let err = handle.load_asset_as::<u32>("sword").await.unwrap_err();
    assert_eq!(
        err,
        LoadError::TypeMismatch {
            key: ResourceKey::new("hero/sword"),
            expected: type_name::<u32>(),
        }
    );

    let err = handle.load_asset_as::<String>("shield").await.unwrap_err();
    assert_eq!(err, LoadError::NotFound(ResourceKey::new("hero/shield")));
}

#[tokio::test]
async fn test_supports() {
    setup();

    let (_loader, bundle_loader, _bundles) = setup_bundles(&["hero"]);
    assert!(bundle_loader.supports("hero"));
    assert!(!bundle_loader.supports("villain"));
}

#[tokio::test(start_paused = true)]
async fn test_from_config_timeout() {
    setup();

    let config = BundlesConfig {
        base_uri: "https://cdn.example.com/bundles".into(),
        platform: "ios".into(),
        load_timeout: Some(Duration::from_secs(5)),
    };
    let loader = TestLoader::new()
        .with_bundle(key("hero"), TestBundle::new("hero"))
        .with_delay(key("hero"), Duration::from_secs(60));
    let bundle_loader = BundleLoader::from_config(loader, &config);

    let err = bundle_loader
        .load("hero", &Options::default())
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::Timeout(Duration::from_secs(5)));
    assert_eq!(bundle_loader.tracked(), 0);
}
