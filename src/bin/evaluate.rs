use clap::Parser;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rnnprop::dataset::{delayed_echo, load_samples_json};
use rnnprop::{Sample, SquaredError, load_seq_func, total_cost};

#[derive(Parser, Debug)]
#[command(name = "evaluate")]
#[command(about = "Report the cost of a saved sequence function")]
struct Args {
    /// Path to a model saved by the trainer
    #[arg(short, long, default_value = "models/rnnprop.json")]
    model: String,

    /// JSON array of samples such as `[{"inputs": [[0.1]], "outputs": [[0.0]]}]`;
    /// a delayed-echo task is generated when omitted
    #[arg(long)]
    samples: Option<String>,

    #[arg(long, default_value_t = 2)]
    delay: usize,

    #[arg(long, default_value_t = 64)]
    count: usize,

    #[arg(long, default_value_t = 7)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let func = load_seq_func(&args.model)?;
    println!("Loaded {} from {}", func.seq_func_type(), &args.model);

    let samples: Vec<Sample> = match &args.samples {
        Some(path) => load_samples_json(path)?,
        None => {
            let mut rng = StdRng::seed_from_u64(args.seed);
            delayed_echo(&mut rng, args.count, 3, 12, args.delay)
        }
    };
    if samples.is_empty() {
        println!("No samples to evaluate");
        return Ok(());
    }

    let steps: usize = samples.iter().map(Sample::len).sum();
    let cost = total_cost(func.as_ref(), &SquaredError, &samples);
    println!(
        "Samples: {}  Timesteps: {}  Cost/sample: {:.5}  Cost/step: {:.5}",
        samples.len(),
        steps,
        cost / samples.len() as f64,
        cost / steps.max(1) as f64
    );
    Ok(())
}
