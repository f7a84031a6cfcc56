//! Builds a small GAN, runs one forward pass of every graph and logs the
//! resulting shapes. Pass a GAN config file to use it instead of the built-in
//! networks.

use std::error::Error;

use gangraph::config::GanConfig;
use gangraph::init::{normal_dense, uniform_dense};
use gangraph::{
    Activation, Discriminator, Dtype, ExprGraph, Gan, Generator, Init, Layer, TapeMachine,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

const BATCH_SIZE: usize = 8;
const LATENT: usize = 2;
const SAMPLE: usize = 2;

fn generator(g: &mut ExprGraph) -> Result<Generator, Box<dyn Error>> {
    let w0 = g.new_param("generator_w0", &[16, LATENT], Init::default());
    let b0 = g.new_param("generator_b0", &[1, 16], Init::Zeros);
    let w1 = g.new_param("generator_w1", &[SAMPLE, 16], Init::default());
    let b1 = g.new_param("generator_b1", &[1, SAMPLE], Init::Zeros);
    Ok(Generator::new(vec![
        Layer::linear(w0).with_bias(b0).with_activation(Activation::RELU),
        Layer::linear(w1).with_bias(b1),
    ])?)
}

fn discriminator(g: &mut ExprGraph) -> Result<Discriminator, Box<dyn Error>> {
    let w0 = g.new_param("discriminator_w0", &[32, SAMPLE], Init::default());
    let b0 = g.new_param("discriminator_b0", &[1, 32], Init::Zeros);
    let w1 = g.new_param("discriminator_w1", &[1, 32], Init::default());
    let b1 = g.new_param("discriminator_b1", &[1, 1], Init::Zeros);
    Ok(Discriminator::new(vec![
        Layer::linear(w0).with_bias(b0).with_activation(Activation::RELU),
        Layer::dropout(0.3),
        Layer::linear(w1).with_bias(b1).with_activation(Activation::SIGMOID),
    ])?)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut rng = StdRng::seed_from_u64(1337);
    let mut gan_graph = ExprGraph::with_seed(1337);
    let mut disc_graph = ExprGraph::with_seed(1338);

    let (mut gen_net, mut disc_net) = match std::env::args().nth(1) {
        Some(path) => {
            let config = GanConfig::load(&path)?;
            (
                config.generator.build_generator(&mut gan_graph)?,
                config.discriminator.build_discriminator(&mut disc_graph)?,
            )
        }
        None => (generator(&mut gan_graph)?, discriminator(&mut disc_graph)?),
    };

    let noise = gan_graph.new_input("generator_input", &[BATCH_SIZE, LATENT], Dtype::Float64);
    gen_net.fwd(&mut gan_graph, BATCH_SIZE, &[noise])?;

    // real and fake samples side by side
    let samples = disc_graph.new_input(
        "discriminator_input",
        &[2 * BATCH_SIZE, SAMPLE],
        Dtype::Float64,
    );
    disc_net.fwd(&mut disc_graph, 2 * BATCH_SIZE, &[samples])?;

    let mut gan = Gan::with_source(&mut gan_graph, &gen_net, &disc_net, &disc_graph)?;
    gan.fwd(&mut gan_graph, BATCH_SIZE)?;
    tracing::info!(
        learnables = gan.learnables().len(),
        generator_learnables = gan.generator_learnables().len(),
        "built GAN"
    );

    gan_graph.let_value(noise, normal_dense(&mut rng, BATCH_SIZE, LATENT))?;
    disc_graph.let_value(samples, uniform_dense(&mut rng, 2 * BATCH_SIZE, SAMPLE))?;

    let mut disc_tape = TapeMachine::with_seed(&disc_graph, 1)?;
    disc_tape.run_all(&mut disc_graph)?;
    gan.resync_from(&mut gan_graph, &disc_graph)?;

    let mut gan_tape = TapeMachine::with_seed(&gan_graph, 2)?;
    gan_tape.eval();
    gan_tape.run_all(&mut gan_graph)?;

    for (label, node) in [
        ("generator", gan.generator_out()),
        ("gan", gan.out()),
        ("discriminator", disc_net.out()),
    ] {
        let graph = if label == "discriminator" {
            &disc_graph
        } else {
            &gan_graph
        };
        if let Some(value) = node.and_then(|ix| graph.value(ix)) {
            tracing::info!(
                output = label,
                shape = ?value.shape(),
                mean = value.mean().unwrap_or(f64::NAN),
                "evaluated"
            );
        }
    }
    Ok(())
}
