//! Backoff command implementation.

use fleetsync_engine::BackoffConfig;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::time::Duration;

/// One planned retry.
#[derive(Debug, Serialize, PartialEq)]
pub struct PlannedRetry {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Un-jittered delay in milliseconds.
    pub base_ms: u64,
    /// Delay actually waited, in milliseconds.
    pub delay_ms: u64,
    /// Whether this failure triggers the persistent-failure notification.
    pub persistent: bool,
}

/// Computes the retry schedule for `attempts` consecutive failures.
pub fn schedule(config: &BackoffConfig, attempts: u32, seed: u64) -> Vec<PlannedRetry> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=attempts)
        .map(|attempt| {
            let base = config.delay_for_attempt(attempt);
            let delay = config.jittered(base, &mut rng);
            PlannedRetry {
                attempt,
                base_ms: base.as_millis() as u64,
                delay_ms: delay.as_millis() as u64,
                persistent: attempt == config.max_consecutive_failures,
            }
        })
        .collect()
}

/// Runs the backoff command.
pub fn run(
    base_ms: u64,
    factor: f64,
    max_ms: u64,
    attempts: u32,
    jitter: f64,
    seed: u64,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = BackoffConfig::new(
        Duration::from_millis(base_ms),
        factor,
        Duration::from_millis(max_ms),
    )
    .with_jitter(jitter);
    config.validate()?;

    let plan = schedule(&config, attempts, seed);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&plan)?),
        _ => {
            println!("attempt   base      delay");
            for retry in &plan {
                let marker = if retry.persistent { "  (persistent failure)" } else { "" };
                println!(
                    "{:>7}   {:>7}   {:>7}{}",
                    retry.attempt,
                    format_ms(retry.base_ms),
                    format_ms(retry.delay_ms),
                    marker
                );
            }
        }
    }
    Ok(())
}

fn format_ms(ms: u64) -> String {
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{:.2}s", ms as f64 / 1000.0)
    }
}
