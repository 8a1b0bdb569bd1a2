use std::{env, time::Duration};

use anyhow::{Context, ensure};
use conditional_accumulator::{
    Accumulator, AccumulatorConfig, AccumulatorHandle, DType, ShapeSpec,
};
use futures::future;
use log::{info, warn};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use tokio::{signal, time};

const DEFAULT_PRODUCERS: usize = 4;
const DEFAULT_ROUNDS: i64 = 10;
const DEFAULT_DIM: usize = 4;

/// Reads a numeric environment variable, falling back to `default` if unset.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {key}: {value:?}")),
        Err(_) => Ok(default),
    }
}

/// Picks the shape of the generated gradients, filling in whatever the declared
/// shape leaves unknown.
fn gradient_shape(declared: &ShapeSpec) -> Vec<usize> {
    match declared {
        ShapeSpec::Unknown => vec![DEFAULT_DIM],
        ShapeSpec::Dims(dims) => dims.iter().map(|dim| dim.unwrap_or(DEFAULT_DIM)).collect(),
    }
}

/// Keeps contributing random gradients tagged with the global step it last saw,
/// until the accumulator is closed.
async fn produce(handle: AccumulatorHandle<f32>, shape: Vec<usize>, producer: usize) {
    let mut contributions = 0usize;

    loop {
        let local_step = handle.global_step();
        let (delay, grad) = {
            let mut rng = rand::rng();
            let delay = Duration::from_millis(rng.random_range(5..50));
            let grad =
                ArrayD::from_shape_simple_fn(IxDyn(&shape), || rng.random_range(-1.0..1.0));
            (delay, grad)
        };

        // The global step may move while the gradient is being "computed".
        time::sleep(delay).await;

        match handle.apply(&grad, local_step).await {
            Ok(()) => contributions += 1,
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                warn!("producer {producer} failed: {e}");
                break;
            }
        }
    }

    info!(producer = producer, contributions = contributions; "producer finished");
}

/// Drains `rounds` averages, moving the global step forward after each one unless
/// the accumulator already does it on its own.
async fn consume(
    handle: AccumulatorHandle<f32>,
    rounds: i64,
    required: i64,
    advance: bool,
) -> anyhow::Result<()> {
    for round in 0..rounds {
        let avg = handle.take(required).await?;
        info!("round {round}: average {avg}");

        if !advance {
            handle.set_global_step(round + 1);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => AccumulatorConfig::from_path(&path)
            .with_context(|| format!("reading accumulator config at {path}"))?,
        None => AccumulatorConfig::new("demo", Default::default()),
    };

    ensure!(
        config.dtype == DType::F32,
        "the demo only drives f32 accumulators, {:?} is configured as {}",
        config.name,
        config.dtype
    );
    let shape = gradient_shape(&config.shape);

    let producers = env_or("PRODUCERS", DEFAULT_PRODUCERS)?;
    let rounds = env_or("ROUNDS", DEFAULT_ROUNDS)?;

    let accumulator = Accumulator::<f32>::from_config(&config)
        .with_context(|| format!("building accumulator {:?}", config.name))?;
    let handle = AccumulatorHandle::new(accumulator);
    info!(
        "accumulating {shape:?} (declared {}) with {producers} producers for {rounds} rounds",
        config.shape
    );

    let tasks: Vec<_> = (0..producers)
        .map(|producer| tokio::spawn(produce(handle.clone(), shape.clone(), producer)))
        .collect();

    let consumer = consume(
        handle.clone(),
        rounds,
        producers as i64,
        config.advance_step_on_take,
    );

    tokio::select! {
        ret = consumer => {
            ret?;
            info!("wrapping up, closing the accumulator...");
        }
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
        }
    }

    handle.close();
    for ret in future::join_all(tasks).await {
        ret?;
    }

    Ok(())
}
