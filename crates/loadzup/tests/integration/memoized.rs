use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use loadzup::{LoadError, Loaded, Loader, MemoizingLoader, Options, ResourceKey};
use loadzup_test::{TestLoader, TestPrototype, setup};

fn key(key: &str) -> ResourceKey {
    ResourceKey::new(key)
}

#[tokio::test(start_paused = true)]
async fn test_deduplicates_concurrent_loads() {
    setup();

    let loader = TestLoader::new()
        .with_value("k1", Loaded::shared(String::from("V")))
        .with_delay("k1", Duration::from_millis(10));
    let memoized = MemoizingLoader::new(loader.clone());

    let loads = (0..5).map(|_| memoized.load::<String>(&key("k1"), &Options::default()));
    let results: Vec<_> = join_all(loads)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(loader.invocations("k1"), 1);
    for value in &results {
        assert_eq!(value.as_str(), "V");
        assert!(Arc::ptr_eq(value, &results[0]));
    }
}

#[tokio::test]
async fn test_serves_from_cache() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let memoized = MemoizingLoader::new(loader.clone());

    let first = memoized.load::<u32>(&key("k1"), &Options::default()).await.unwrap();
    assert!(memoized.is_cached(&key("k1")));
    assert!(!memoized.is_loading(&key("k1")));

    let second = memoized.load::<u32>(&key("k1"), &Options::default()).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(loader.invocations("k1"), 1);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    setup();

    let loader = TestLoader::new()
        .with_value("k1", Loaded::shared(42u32))
        .with_failure("k1", LoadError::status(503));
    let memoized = MemoizingLoader::new(loader.clone());

    let err = memoized
        .load::<u32>(&key("k1"), &Options::default())
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::status(503));
    assert!(!memoized.is_cached(&key("k1")));
    assert!(!memoized.is_loading(&key("k1")));

    let value = memoized.load::<u32>(&key("k1"), &Options::default()).await.unwrap();
    assert_eq!(*value, 42);
    assert_eq!(loader.invocations("k1"), 2);
}

#[tokio::test]
async fn test_failure_is_shared_by_waiters() {
    setup();

    let loader = TestLoader::new()
        .with_value("k1", Loaded::shared(42u32))
        .with_failure("k1", LoadError::Malformed("truncated header".into()));
    let gate = loader.gate("k1");
    let memoized = MemoizingLoader::new(loader.clone());

    let loads: Vec<_> = (0..3)
        .map(|_| memoized.load::<u32>(&key("k1"), &Options::default()))
        .collect();
    assert!(memoized.is_loading(&key("k1")));
    gate.open();

    for result in join_all(loads).await {
        assert_eq!(
            result.unwrap_err(),
            LoadError::Malformed("truncated header".into())
        );
    }
    assert_eq!(loader.invocations("k1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout() {
    setup();

    let loader = TestLoader::new()
        .with_value("slow", Loaded::shared(42u32))
        .with_delay("slow", Duration::from_secs(60));
    let memoized = MemoizingLoader::new(loader).with_timeout(Some(Duration::from_secs(1)));

    let err = memoized
        .load::<u32>(&key("slow"), &Options::default())
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::Timeout(Duration::from_secs(1)));
    assert!(!memoized.is_cached(&key("slow")));
}

#[tokio::test]
async fn test_type_mismatch() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let memoized = MemoizingLoader::new(loader.clone());

    let err = memoized
        .load::<String>(&key("k1"), &Options::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        LoadError::TypeMismatch {
            key: key("k1"),
            expected: type_name::<String>(),
        }
    );

    // the value itself loaded fine and stays cached
    let value = memoized.load::<u32>(&key("k1"), &Options::default()).await.unwrap();
    assert_eq!(*value, 42);
    assert_eq!(loader.invocations("k1"), 1);
}

#[tokio::test]
async fn test_prototype_instances() {
    setup();

    let prototype = TestPrototype::default();
    let loader = TestLoader::new().with_value("proto", Loaded::prototype(prototype.clone()));
    let memoized = MemoizingLoader::new(loader.clone());

    let first = memoized.load::<usize>(&key("proto"), &Options::default()).await.unwrap();
    let second = memoized.load::<usize>(&key("proto"), &Options::default()).await.unwrap();

    assert_eq!((*first, *second), (0, 1));
    assert_eq!(prototype.instances(), 2);
    assert_eq!(loader.invocations("proto"), 1);
}

#[tokio::test]
async fn test_loader_impl_instantiates_prototypes() {
    setup();

    let loader = TestLoader::new().with_value("proto", Loaded::prototype(TestPrototype::default()));
    let memoized = MemoizingLoader::new(loader);

    let loaded = Loader::load(&memoized, &key("proto"), &Options::default())
        .await
        .unwrap();
    assert!(matches!(loaded, Loaded::Shared(_)));

    // the shared value is pinned to one instance
    let first = loaded.downcast::<usize>(&key("proto")).unwrap();
    let second = loaded.downcast::<usize>(&key("proto")).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test]
async fn test_clear_cache_keeps_running_loads() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let gate = loader.gate("k1");
    let memoized = MemoizingLoader::new(loader.clone());

    let load = memoized.load::<u32>(&key("k1"), &Options::default());
    memoized.clear_cache();
    assert!(memoized.is_loading(&key("k1")));

    gate.open();
    assert_eq!(*load.await.unwrap(), 42);
    assert!(memoized.is_cached(&key("k1")));

    memoized.clear_cache();
    assert!(!memoized.is_cached(&key("k1")));
    memoized.load::<u32>(&key("k1"), &Options::default()).await.unwrap();
    assert_eq!(loader.invocations("k1"), 2);
}

#[tokio::test]
async fn test_dropped_waiter_keeps_load_running() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let gate = loader.gate("k1");
    let memoized = MemoizingLoader::new(loader.clone());

    drop(memoized.load::<u32>(&key("k1"), &Options::default()));
    assert!(memoized.is_loading(&key("k1")));

    let load = memoized.load::<u32>(&key("k1"), &Options::default());
    gate.open();
    assert_eq!(*load.await.unwrap(), 42);
    assert_eq!(loader.invocations("k1"), 1);
}

#[tokio::test]
async fn test_unknown_key() {
    setup();

    let memoized = MemoizingLoader::new(TestLoader::new());
    assert!(!memoized.supports(&key("missing")));

    let err = memoized
        .load::<u32>(&key("missing"), &Options::default())
        .await
        .unwrap_err();
    assert_eq!(err, LoadError::NotFound(key("missing")));
}

#[tokio::test]
async fn test_options_are_passed_through() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let memoized = MemoizingLoader::new(loader.clone());
    let options = Options::default()
        .with_content_type("application/octet-stream")
        .with_header("x-platform", "ios");

    memoized.load::<u32>(&key("k1"), &options).await.unwrap();
    assert_eq!(loader.last_options("k1"), Some(options));
}

#[test]
fn test_interrupted_by_shutdown() {
    setup();

    let loader = TestLoader::new().with_value("k1", Loaded::shared(42u32));
    let _gate = loader.gate("k1");
    let memoized = MemoizingLoader::new(loader);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let load = runtime.block_on(async { memoized.load::<u32>(&key("k1"), &Options::default()) });
    drop(runtime);

    let err = futures::executor::block_on(load).unwrap_err();
    assert_eq!(err, LoadError::Interrupted(key("k1")));
    assert!(!memoized.is_loading(&key("k1")));
}
