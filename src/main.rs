use std::rc::Rc;

use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rnnprop::dataset::{delayed_echo, load_samples_json};
use rnnprop::{
    Block, BlockSeqFunc, Bptt, DenseBlock, Gradient, Sample, SquaredError, TrainingConfig,
    save_seq_func, total_cost,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "rnnprop")]
#[command(about = "Train a dense RNN with truncated back-propagation through time")]
struct Args {
    /// JSON training config; defaults are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// JSON array of samples such as `[{"inputs": [[0.1]], "outputs": [[0.0]]}]`;
    /// a delayed-echo task is generated when omitted
    #[arg(long)]
    samples: Option<String>,

    /// Delay of the generated echo task
    #[arg(long, default_value_t = 2)]
    delay: usize,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    head_size: Option<usize>,

    #[arg(long)]
    tail_size: Option<usize>,

    /// Where to save the trained model
    #[arg(short, long)]
    save: Option<String>,
}

fn main() -> rnnprop::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = match &args.config {
        Some(path) => TrainingConfig::load_json(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    if let Some(head) = args.head_size {
        config.bptt.head_size = head;
    }
    if let Some(tail) = args.tail_size {
        config.bptt.tail_size = tail;
    }
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let samples: Vec<Sample> = match &args.samples {
        Some(path) => load_samples_json(path)?,
        None => delayed_echo(
            &mut rng,
            config.batch_size * 16,
            config.min_seq_len,
            config.max_seq_len,
            args.delay,
        ),
    };
    info!(samples = samples.len(), "Dataset ready");

    let block = Rc::new(DenseBlock::from_config(&config.block));
    let params = block.parameters()?;
    let func = BlockSeqFunc::new(block.clone());
    let bptt = Bptt::new(block, Rc::new(SquaredError), &config.bptt)?;

    for epoch in 0..config.epochs {
        for batch in samples.chunks(config.batch_size) {
            let mut g = Gradient::for_variables(&params);
            bptt.gradient(batch, &mut g)?;
            g.scale(-config.learning_rate / batch.len() as f64);
            for p in &params {
                if let Some(step) = g.get(p.id()) {
                    *p.vector_mut() += step;
                }
            }
        }

        let cost = total_cost(&func, &SquaredError, &samples) / samples.len() as f64;
        info!(epoch = epoch, cost = cost, "Training epoch completed");
        if epoch % 10 == 0 || epoch + 1 == config.epochs {
            println!("Epoch {}: Cost = {:.5}", epoch, cost);
        }
    }

    if let Some(path) = &args.save {
        save_seq_func(&func, path, Some(format!("{} epochs", config.epochs)))?;
        println!("Saved model to {}", path);
    }

    Ok(())
}
