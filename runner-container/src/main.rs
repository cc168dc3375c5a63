use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use join_core::backend::kafka::KafkaBackend;
use join_core::config::{JoinConfig, load_config};
use join_core::driver::{JoinedGroup, stream_named};
use join_core::telemetry::{JoinMetrics, init_tracing};
use join_core::window;
use join_core::{
    DriverStep, JoinDriver, JoinEngine, JoinTree, MessageBroker, Record, StreamType, TopicMap,
};
use serde_json::Value;
use tracing::{error, info, warn};

join_core::stream_types! {
    /// Streams this runner knows about. Topics can be renamed in the config.
    enum RunnerStream {
        Left => ("left", "join-left"),
        Right => ("right", "join-right"),
        Output => ("output", "join-output"),
    }
}

/// Entry point for a long-running join on container hosting services.
///
/// Loads the config from the path given as first argument, or from the
/// `JOIN_CONFIG` environment variable, then joins until a required stream
/// ends or a shutdown signal arrives.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).await?;
    config.validate()?;
    info!("Loaded join config version {}", config.version);

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let mut worker = tokio::task::spawn_blocking(move || run_join(&config, &worker_stop));

    tokio::select! {
        result = &mut worker => result.context("Join worker panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping after the current group");
            stop.store(true, Ordering::SeqCst);
            worker.await.context("Join worker panicked")?
        }
    }
}

fn run_join(config: &JoinConfig, stop: &AtomicBool) -> Result<()> {
    let backend = KafkaBackend::connect(&config.kafka)?;
    let topics = TopicMap::<RunnerStream>::with_overrides(&config.topic_overrides())?;
    let broker = MessageBroker::new(backend, topics, config.broker_settings());
    let engine = JoinEngine::new(broker).with_skip_limit(config.timeouts.max_skipped_records);

    let tree = JoinTree::<RunnerStream>::from_config(&config.join)?;
    let output = config
        .join
        .output
        .as_deref()
        .map(stream_named::<RunnerStream>)
        .transpose()?;
    let root = tree.root;
    let root_key = tree
        .pairs
        .iter()
        .find(|pair| pair.left == root)
        .map(|pair| pair.left_key.clone())
        .unwrap_or_default();

    let processor = move |group: &JoinedGroup<RunnerStream>| -> Result<Vec<Record>> {
        Ok(vec![merge(root, &root_key, group)])
    };
    let mut driver = JoinDriver::new(engine, tree, output, processor);
    if let Some(window_config) = &config.join.window {
        info!("Grouping {} records into windows on {}", root.name(), window_config.field);
        driver = driver.with_window(window::from_config(window_config));
    }

    let mut failures = 0;
    while !stop.load(Ordering::SeqCst) {
        match driver.step() {
            Ok(DriverStep::Finished) => break,
            Ok(_) => failures = 0,
            Err(err) if err.is_retryable() && failures < config.processing.max_retries => {
                failures += 1;
                let delay = err.get_retry_delay_ms(config.processing.retry_delay_ms);
                warn!(
                    "Join step failed (attempt {}/{}), retrying in {}ms: {}",
                    failures, config.processing.max_retries, delay, err
                );
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(err) => {
                error!("Join stopped: {}", err);
                return Err(err.into());
            }
        }
    }

    info!("Join metrics: {}", metrics_json(driver.engine().metrics()));
    Ok(())
}

/// One output record per group: the join key, the root records and every
/// joined record under its stream's name.
///
/// A single root is written as an object, a window of roots as an array.
fn merge(root: RunnerStream, root_key: &str, group: &JoinedGroup<RunnerStream>) -> Record {
    let key = group
        .first_root()
        .and_then(|first| first.get(root_key))
        .cloned()
        .unwrap_or(Value::Null);
    let roots = match group.roots.as_slice() {
        [single] => Value::from(single.clone()),
        many => Value::Array(many.iter().cloned().map(Value::from).collect()),
    };
    let mut merged = Record::new().with("key", key).with(root.name(), roots);
    for stream in RunnerStream::ALL {
        let joined: Vec<Value> = group.children_of(*stream).cloned().map(Value::from).collect();
        if !joined.is_empty() {
            merged.insert(stream.name(), Value::Array(joined));
        }
    }
    merged
}

fn metrics_json(metrics: &JoinMetrics) -> String {
    serde_json::to_string(metrics).unwrap_or_else(|_| "{}".to_string())
}
