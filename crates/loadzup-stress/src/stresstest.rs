use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use rand::Rng;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use loadzup::BundleLocator;
use loadzup::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_bundle};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let locator = BundleLocator::from_config(&config.bundles);

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            prepare_workload(workload, &locator, config.bundles.load_timeout)
                .with_context(|| format!("invalid workload {i}"))
                .map(Arc::new)
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::info!(workloads = workloads.len(), ?duration, "Starting stresstest");

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in &workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();
                        let index = rand::rng().random_range(0..workload.bundles.len());

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            process_bundle(&workload.loader, &workload.bundles[index]).await;

                            transaction.finish();

                            if let Ok(mut task_durations) = task_durations.lock() {
                                task_durations.add(task_start.elapsed().as_secs_f64());
                            }

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            };
            task_durations
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, workload)) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let task_durations = task.context("workload panicked")?;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

        if ops > 0 {
            let quantile = |q: f64| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        let (loaded, failed, unloaded) = workload.counters.get();
        println!("  bundles loaded: {loaded}; failed: {failed}; unloaded: {unloaded}");

        // everything was released, so nothing may be left behind
        let tracked = workload.loader.tracked();
        ensure!(tracked == 0, "workload {i} leaked {tracked} bundle records");
        ensure!(
            loaded == unloaded,
            "workload {i} loaded {loaded} bundles but unloaded {unloaded}"
        );
    }

    Ok(())
}
