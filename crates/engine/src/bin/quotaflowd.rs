use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use quotaflow_core::{Clock, ResourceUsage, SystemClock, TenantId, Tier};
use quotaflow_engine::{Engine, EngineConfig, SimulatedExecutor};
use quotaflow_jobs::{JobKind, JobRequest};
use quotaflow_monitor::{RequestSample, SystemSample};
use quotaflow_quota::{BillingPeriod, InMemoryTenantDirectory, TenantAccount};

const MODELS: [&str; 3] = ["legal-expert", "support-bot", "contract-review"];

fn main() -> anyhow::Result<()> {
    quotaflow_observability::init();

    let config = EngineConfig::from_env().context("loading configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let tenants = Arc::new(InMemoryTenantDirectory::new());
    let seeded: Vec<(TenantId, Tier)> = Tier::ALL
        .into_iter()
        .map(|tier| {
            let id = TenantId::new();
            tenants.upsert(TenantAccount::new(id, tier, BillingPeriod::monthly(clock.now())));
            (id, tier)
        })
        .collect();

    let simulator = Arc::new(SimulatedExecutor::new(10, Duration::from_millis(500)));
    let engine = Arc::new(
        Engine::new(config, tenants, simulator.clone(), clock).context("building engine")?,
    );
    simulator.attach(engine.registry().clone());

    for (tenant, tier) in &seeded {
        let requests = [
            JobRequest::new(*tenant, JobKind::training("legal-expert"), ResourceUsage::training_hours(1)),
            JobRequest::new(*tenant, JobKind::ingestion("contracts/"), ResourceUsage::tokens(800)).with_priority(1),
            JobRequest::new(*tenant, JobKind::ingestion("emails/"), ResourceUsage::tokens(2_000)),
        ];
        for request in requests {
            match engine.submit(request) {
                Ok(job) => info!(job_id = %job.id, tier = %tier, "demo job submitted"),
                Err(e) => warn!(tier = %tier, error = %e, "demo job rejected"),
            }
        }
    }

    let handle = engine.clone().spawn().context("starting engine driver")?;

    let running = Arc::new(AtomicBool::new(true));
    let traffic = {
        let engine = engine.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("demo-traffic".into())
            .spawn(move || {
                let mut n: u64 = 0;
                while running.load(Ordering::Relaxed) {
                    n += 1;
                    let model = MODELS[(n % MODELS.len() as u64) as usize];
                    let tier = Tier::ALL[(n % Tier::ALL.len() as u64) as usize];
                    let latency = Duration::from_millis(80 + (n * 37) % 900);
                    let sample = RequestSample::new(model, latency, true)
                        .with_tier(tier)
                        .with_tokens(50 + n % 200);
                    engine.record_request(match n % 17 {
                        0 => sample.with_error("timeout", "model did not answer in time"),
                        8 if n % 2 == 0 => sample.with_error("rate_limited", "upstream throttled"),
                        _ => sample,
                    });
                    if n % 10 == 0 {
                        engine.record_system(SystemSample {
                            cpu_percent: 30.0 + (n % 50) as f64,
                            memory_percent: 60.0 + (n % 30) as f64,
                        });
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            })
            .context("starting demo traffic")?
    };

    info!("quotaflowd running; press enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    running.store(false, Ordering::Relaxed);
    let _ = traffic.join();
    handle.shutdown();

    let (snapshot, _) = engine.take_snapshot().context("final snapshot")?;
    println!("{}", serde_json::to_string_pretty(&*snapshot)?);
    Ok(())
}
