use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cartsync_service::actions::CartActions;
use cartsync_service::cache::CartCache;
use cartsync_service::config::Config as CartsyncConfig;
use cartsync_service::remote::HttpCartService;
use cartsync_service::session::StoredSession;
use cartsync_test::{CartResponse, CartServer, ServerLine};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_payload, process_payload};

pub async fn perform_stresstest(
    mut service_config: CartsyncConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // start the mock shop backend
    let server = CartServer::with_lines(workloads.cart.iter().map(ServerLine::from).collect());
    if let Some(latency) = workloads.read_latency {
        server.set_read(CartResponse::Delayed(latency));
    }
    service_config.remote.base_url = server.base_url();

    let remote =
        HttpCartService::new(&service_config.remote).context("failed to create HTTP client")?;
    let session = StoredSession::with_token("stresstest");
    let cache = CartCache::new(service_config.cache, remote, session);
    let actions = CartActions::new(cache.clone());
    let cart = Arc::new((cache, actions));

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            let payload = prepare_payload(workload.payload);
            (workload.concurrency, Arc::new(payload))
        })
        .collect();

    // warmup: run each workload once to make sure the cache is populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let cart = Arc::clone(&cart);
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_payload(&cart, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();
    let warmup_hits = server.all_hits();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cart = Arc::clone(&cart);
        let workload = Arc::clone(&workload);

        let task = tokio::spawn(async move {
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
                        let cart = Arc::clone(&cart);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            process_payload(&cart, &workload).await;

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

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

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            (concurrency, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut total_ops = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations) = task.context("workload task panicked")?;

        let ops = task_durations.count();
        total_ops += ops;
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let value = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(value)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!("Requests reaching the server ({total_ops} operations):");
    for (path, hits) in server.all_hits() {
        let warmup = warmup_hits
            .iter()
            .find(|(warmup_path, _)| *warmup_path == path)
            .map_or(0, |(_, hits)| *hits);
        println!("  {path}: {}", hits - warmup);
    }

    Ok(())
}
