use anyhow::Result;
use dog_jobs::prelude::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

const QUEUE_NAME: &str = "updateSubscriptions";
const ENV_PREFIX: &str = "UPDATE_SUBSCRIPTIONS";
const MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    is_pretty_true: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Subscriber {
    id: u32,
    email: String,
    username: String,
    settings: Settings,
}

fn subscribers(quantity: u32) -> Vec<Subscriber> {
    (0..quantity)
        .map(|id| Subscriber {
            id,
            email: format!("user{id}@example.com"),
            username: format!("user{id}"),
            settings: Settings { is_pretty_true: id % 2 == 0 },
        })
        .collect()
}

fn job_type_for(subscriber: &Subscriber) -> &'static str {
    if subscriber.id % 2 == 0 {
        "image"
    } else {
        "video"
    }
}

/// Subscriber `n` fails its first `n % 5` attempts, so some jobs succeed
/// straight away, some after retries and some run out of attempts.
async fn send_payload(job_type: &'static str, job: JobRecord) -> Result<Value, JobError> {
    let subscriber: Subscriber = serde_json::from_value(job.payload)
        .map_err(|e| JobError::permanent(format!("bad payload: {e}")))?;

    if job.attempts_made <= subscriber.id % 5 {
        return Err(format!("task of jobType {job_type} failed").into());
    }

    Ok(json!(format!(
        "[type:{}] {} for {} <{}>",
        job_type,
        json!(subscriber.settings),
        subscriber.username,
        subscriber.email
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = QueueConfig::from_env(ENV_PREFIX)?.with_job_types(["image", "video"]);
    if config.limiter.is_none() {
        // max one job per second
        config = config.with_limiter(1, Duration::from_millis(1000));
    }

    let queue = create_queue(QUEUE_NAME, config).await?;
    let mut events = queue.events();

    queue.process("image", |job| send_payload("image", job))?;
    queue.process("video", |job| send_payload("video", job))?;

    queue.on_completed(|job, result| {
        println!("job {} completed with {}", job.id, result);
    });
    queue.on_failed(|job, err, attempts_remaining| {
        if attempts_remaining > 0 {
            eprintln!(
                "job {} had an error: {} (attempts remaining: {})",
                job.id, err, attempts_remaining
            );
        } else {
            eprintln!("job {} permanently failed", job.id);
        }
    });

    let users = subscribers(10);
    for user in &users {
        let options = JobOptions::new().with_attempts(MAX_ATTEMPTS);
        queue.add(job_type_for(user), serde_json::to_value(user)?, options).await?;
    }
    info!(count = users.len(), "created jobs");

    let mut finished = 0;
    while finished < users.len() {
        match events.next().await {
            Some(event) if event.is_terminal() => finished += 1,
            Some(_) => {}
            None => break,
        }
    }

    let counts = queue.job_counts().await?;
    info!(completed = counts.completed, failed = counts.failed, "all jobs finished");

    queue.close().await?;
    Ok(())
}
