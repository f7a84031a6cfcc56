use std::collections::HashSet;

use approx::assert_relative_eq;
use gangraph::graph::tensor;
use gangraph::kernels::{Conv2dParams, Pool2dParams};
use gangraph::recurrent::lstm;
use gangraph::{
    Activation, BuildError, Discriminator, Dtype, ExprGraph, Gan, Generator, Init, Ix, Layer,
    LayerKind, ParamMirror, TapeMachine,
};
use proptest::prelude::*;

fn linear(g: &mut ExprGraph, name: &str, inputs: usize, outputs: usize) -> Layer {
    let w = g.new_param(&format!("{}_w", name), &[outputs, inputs], Init::default());
    let init = Init::Uniform {
        low: -0.5,
        high: 0.5,
    };
    let b = g.new_param(&format!("{}_b", name), &[1, outputs], init);
    Layer::linear(w).with_bias(b)
}

#[test]
fn single_layer_networks() {
    let mut g = ExprGraph::with_seed(1);
    let mut gen = Generator::new(vec![linear(&mut g, "g", 2, 3)]).unwrap();
    let mut disc = Discriminator::new(vec![
        linear(&mut g, "d", 3, 1).with_activation(Activation::SIGMOID)
    ])
    .unwrap();

    let noise = g.new_input("noise", &[1, 2], Dtype::Float64);
    gen.fwd(&mut g, 1, &[noise]).unwrap();
    let real = g.new_input("real", &[1, 3], Dtype::Float64);
    disc.fwd(&mut g, 1, &[real]).unwrap();

    let mut gan = Gan::new(&mut g, &gen, &disc).unwrap();
    assert_eq!(gan.out(), None);
    gan.fwd(&mut g, 1).unwrap();

    let out = gan.out().unwrap();
    let mirrored_out = gan.mirrored_discriminator().out().unwrap();
    assert_eq!(out, mirrored_out);
    assert_eq!(g.shape(out).unwrap(), &[1, 1]);
    assert_eq!(g.name(out).unwrap(), "gan_discriminator_activated_0");
    assert_eq!(gan.generator_out(), gen.out());
    assert_eq!(gan.learnables().len(), 4);
    assert_eq!(gan.generator_learnables(), gen.learnables().as_slice());
    assert_eq!(&gan.learnables()[..2], gen.learnables().as_slice());
}

#[test]
fn mirrored_parameters_are_fresh_copies() {
    let mut g = ExprGraph::with_seed(5);
    let gen = Generator::new(vec![linear(&mut g, "g", 2, 4)]).unwrap();
    let disc = Discriminator::new(vec![
        linear(&mut g, "d0", 4, 8).with_activation(Activation::RELU),
        Layer::dropout(0.5),
        linear(&mut g, "d1", 8, 1),
    ])
    .unwrap();

    let gan = Gan::new(&mut g, &gen, &disc).unwrap();
    let original: HashSet<_> = disc.learnables().into_iter().collect();
    let mirrored = gan.mirrored_discriminator().learnables();
    assert_eq!(mirrored.len(), original.len());
    assert!(mirrored.iter().all(|ix| !original.contains(ix)));
    assert!(gan.learnables().iter().all(|ix| !original.contains(ix)));

    for (orig, copy) in disc.learnables().into_iter().zip(mirrored) {
        assert_eq!(gan.mirror().get(orig), Some(copy));
        assert_eq!(g.value(orig).unwrap(), g.value(copy).unwrap());
        assert_eq!(g.shape(orig).unwrap(), g.shape(copy).unwrap());
        assert_eq!(
            g.name(copy).unwrap(),
            format!("{}_gan", g.name(orig).unwrap())
        );
    }
    assert_eq!(gan.mirrored_discriminator().network().name(), "gan_discriminator");
}

/// `kind` with every node replaced by its mirrored counterpart.
fn remapped(kind: &LayerKind, mirror: &ParamMirror) -> LayerKind {
    let m = |ix: Ix| mirror.get(ix).unwrap();
    match kind.clone() {
        LayerKind::Linear { weight, activation } => LayerKind::Linear {
            weight: m(weight),
            activation,
        },
        LayerKind::Convolutional {
            weight,
            params,
            activation,
        } => LayerKind::Convolutional {
            weight: m(weight),
            params,
            activation,
        },
        LayerKind::Embedding { weight, width } => LayerKind::Embedding {
            weight: m(weight),
            width,
        },
        LayerKind::Recurrent {
            weight,
            mut options,
            activation,
        } => {
            options.hidden_weight = m(options.hidden_weight);
            options.bias = options.bias.map(m);
            options.hidden_state = m(options.hidden_state);
            options.cell_state = m(options.cell_state);
            LayerKind::Recurrent {
                weight: m(weight),
                options,
                activation,
            }
        }
        other => other,
    }
}

#[test]
fn mirror_keeps_layer_structure() {
    let mut g = ExprGraph::with_seed(12);
    let gw = g.new_param("g_w", &[16, 2], Init::default());
    let mut gen = Generator::new(vec![
        Layer::linear(gw).with_activation(Activation::TANH),
        Layer::reshape(&[1, 1, 4, 4]),
    ])
    .unwrap();

    let kernel = g.new_param("d_k", &[2, 1, 3, 3], Init::default());
    let kernel_bias = g.new_param("d_kb", &[1], Init::Constant { value: 0.1 });
    let dw = g.new_param("d_w", &[1, 8], Init::default());
    let disc = Discriminator::new(vec![
        Layer::convolutional(kernel, Conv2dParams::new([3, 3]).padding([1, 1]))
            .with_bias(kernel_bias)
            .with_activation(Activation::RELU),
        Layer::maxpool(Pool2dParams::new([2, 2]).padding([1, 0]).stride([3, 2]))
            .with_activation(Activation::Softmax { axis: Some(3) }),
        Layer::dropout(0.3),
        Layer::reshape(&[1, 8]),
        Layer::linear(dw).with_activation(Activation::SIGMOID),
    ])
    .unwrap();

    let noise = g.new_input("noise", &[1, 2], Dtype::Float64);
    gen.fwd(&mut g, 1, &[noise]).unwrap();
    let mut gan = Gan::new(&mut g, &gen, &disc).unwrap();
    gan.fwd(&mut g, 1).unwrap();
    assert_eq!(g.shape(gan.out().unwrap()).unwrap(), &[1, 1]);

    let original = disc.network().layers();
    let mirrored = gan.mirrored_discriminator().network().layers();
    assert_eq!(mirrored.len(), original.len());
    for (orig, copy) in original.iter().zip(mirrored) {
        assert_eq!(copy.variant(), orig.variant());
        assert_eq!(copy.activation(), orig.activation());
        assert_eq!(copy.kind(), &remapped(orig.kind(), gan.mirror()));
        assert_eq!(copy.bias(), orig.bias().map(|b| gan.mirror().get(b).unwrap()));
    }
    assert!(matches!(
        mirrored[2].kind(),
        LayerKind::Dropout { probability } if *probability == 0.3
    ));
}

#[test]
fn generator_must_be_built_first() {
    let mut g = ExprGraph::new();
    let gen = Generator::new(vec![linear(&mut g, "g", 2, 3)]).unwrap();
    let disc = Discriminator::new(vec![linear(&mut g, "d", 3, 1)]).unwrap();
    let mut gan = Gan::new(&mut g, &gen, &disc).unwrap();
    assert!(matches!(gan.fwd(&mut g, 1), Err(BuildError::GeneratorNotBuilt)));
}

#[test]
fn first_layer_errors_name_the_mirror() {
    let mut g = ExprGraph::new();
    let mut gen = Generator::new(vec![linear(&mut g, "g", 2, 3)]).unwrap();
    let disc = Discriminator::new(vec![linear(&mut g, "d", 5, 1)]).unwrap();
    let noise = g.new_input("noise", &[1, 2], Dtype::Float64);
    gen.fwd(&mut g, 1, &[noise]).unwrap();
    let mut gan = Gan::new(&mut g, &gen, &disc).unwrap();
    let err = gan.fwd(&mut g, 1).unwrap_err();
    let BuildError::Role { role: "gan", source } = &err else {
        panic!("unexpected error {:?}", err);
    };
    assert!(matches!(
        &**source,
        BuildError::Layer { network, index: 0, .. } if network == "gan_discriminator"
    ));
}

#[test]
fn discriminator_on_separate_graph() {
    let mut gan_graph = ExprGraph::with_seed(1);
    let mut disc_graph = ExprGraph::with_seed(2);
    let mut gen = Generator::new(vec![linear(&mut gan_graph, "g", 2, 3)]).unwrap();
    let mut disc = Discriminator::new(vec![
        linear(&mut disc_graph, "d", 3, 1).with_activation(Activation::SIGMOID)
    ])
    .unwrap();

    let noise = gan_graph.new_input("noise", &[4, 2], Dtype::Float64);
    gen.fwd(&mut gan_graph, 4, &[noise]).unwrap();
    let samples = disc_graph.new_input("samples", &[8, 3], Dtype::Float64);
    disc.fwd(&mut disc_graph, 8, &[samples]).unwrap();

    let disc_nodes = disc_graph.node_count();
    let mut gan = Gan::with_source(&mut gan_graph, &gen, &disc, &disc_graph).unwrap();
    gan.fwd(&mut gan_graph, 4).unwrap();
    assert_eq!(disc_graph.node_count(), disc_nodes);
    assert_eq!(gan_graph.shape(gan.out().unwrap()).unwrap(), &[4, 1]);

    for (orig, copy) in gan.mirror().pairs() {
        assert_eq!(disc_graph.value(*orig), gan_graph.value(*copy));
    }

    gan_graph
        .let_value(noise, tensor(&[4, 2], vec![0.5; 8]).unwrap())
        .unwrap();
    TapeMachine::new(&gan_graph)
        .unwrap()
        .run_all(&mut gan_graph)
        .unwrap();
    let scores = gan_graph.value(gan.out().unwrap()).unwrap();
    assert!(scores.iter().all(|v| *v > 0.0 && *v < 1.0));
}

#[test]
fn resync_copies_current_values() {
    let mut g = ExprGraph::with_seed(8);
    let gen = Generator::new(vec![linear(&mut g, "g", 2, 3)]).unwrap();
    let disc = Discriminator::new(vec![linear(&mut g, "d", 3, 1)]).unwrap();
    let gan = Gan::new(&mut g, &gen, &disc).unwrap();

    let w = disc.learnables()[0];
    let copy = gan.mirror().get(w).unwrap();
    let before = g.value(copy).unwrap().clone();
    g.let_value(w, tensor(&[1, 3], vec![7.0, 8.0, 9.0]).unwrap()).unwrap();
    // the mirror is a snapshot until asked to follow
    assert_eq!(g.value(copy).unwrap(), &before);

    gan.resync(&mut g).unwrap();
    let synced = g.value(copy).unwrap();
    assert_relative_eq!(synced[[0, 2]], 9.0);
    assert_eq!(g.value(w).unwrap(), synced);
}

#[test]
fn recurrent_discriminator_is_mirrored_with_states() {
    let mut g = ExprGraph::with_seed(3);
    let gw = g.new_param("g_w", &[3, 2], Init::default());
    let mut gen = Generator::new(vec![Layer::linear(gw)]).unwrap();
    let rnn = lstm(&mut g, "d_rnn", 3, 2, Init::default());
    let disc = Discriminator::new(vec![rnn]).unwrap();

    let gan_mirror_len = {
        let gan = Gan::new(&mut g, &gen, &disc).unwrap();
        // input weight, hidden weight, gate bias and two zero states
        assert_eq!(gan.mirror().len(), 5);
        assert_eq!(gan.learnables().len(), 1 + 3);
        gan.mirror().len()
    };
    assert_eq!(gan_mirror_len, 5);

    let noise = g.new_input("noise", &[6, 2], Dtype::Float64);
    gen.fwd(&mut g, 1, &[noise]).unwrap();
    let mut gan = Gan::new(&mut g, &gen, &disc).unwrap();
    gan.fwd(&mut g, 1).unwrap();
    assert_eq!(g.shape(gan.out().unwrap()).unwrap(), &[6, 2]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn learnables_are_generator_then_mirror(gen_layers in 1usize..4, disc_layers in 1usize..4) {
        let mut g = ExprGraph::with_seed(0);
        let gen = Generator::new(
            (0..gen_layers).map(|i| linear(&mut g, &format!("g{}", i), 2, 2)).collect(),
        ).unwrap();
        let disc = Discriminator::new(
            (0..disc_layers).map(|i| linear(&mut g, &format!("d{}", i), 2, 2)).collect(),
        ).unwrap();
        let gan = Gan::new(&mut g, &gen, &disc).unwrap();

        prop_assert_eq!(
            gan.learnables().len(),
            gan.generator_learnables().len() + gan.mirrored_discriminator().learnables().len()
        );
        let original: HashSet<_> = disc.learnables().into_iter().collect();
        prop_assert!(gan.learnables().iter().all(|ix| !original.contains(ix)));
        for (orig, copy) in gan.mirror().pairs() {
            prop_assert_eq!(g.value(*orig), g.value(*copy));
        }
    }
}
