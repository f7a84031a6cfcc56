use approx::assert_relative_eq;
use gangraph::graph::tensor;
use gangraph::kernels::Pool2dParams;
use gangraph::{Activation, BuildError, Dtype, ExprGraph, Init, Layer, Network, TapeMachine};
use proptest::prelude::*;

#[test]
fn single_linear_sigmoid_layer() {
    let mut g = ExprGraph::with_seed(3);
    let w = g.new_param("w", &[3, 2], Init::default());
    let b = g.new_param("b", &[1, 3], Init::Uniform { low: -1.0, high: 1.0 });
    let x = g.new_input("x", &[1, 2], Dtype::Float64);
    let mut net = Network::new(
        "net",
        vec![Layer::linear(w).with_bias(b).with_activation(Activation::SIGMOID)],
    )
    .unwrap();
    net.fwd(&mut g, 1, &[x]).unwrap();
    let out = net.out().unwrap();
    assert_eq!(g.shape(out).unwrap(), &[1, 3]);
    assert_eq!(g.name(out).unwrap(), "net_activated_0");

    g.let_value(x, tensor(&[1, 2], vec![1.0, 0.5]).unwrap()).unwrap();
    TapeMachine::new(&g).unwrap().run_all(&mut g).unwrap();
    let value = g.value(out).unwrap();
    assert_eq!(value.shape(), &[1, 3]);
    assert!(value.iter().all(|v| *v > 0.0 && *v < 1.0));
}

#[test]
fn batched_linear_matches_single_sample() {
    let weights = tensor(&[3, 2], vec![0.5, -1.0, 2.0, 0.25, -0.75, 1.5]).unwrap();
    let bias = tensor(&[1, 3], vec![0.1, 0.2, 0.3]).unwrap();
    let sample = [1.0, 0.5];

    let mut single = ExprGraph::new();
    let w = single.new_param_from("w", weights.clone());
    let b = single.new_param_from("b", bias.clone());
    let x = single.new_input("x", &[1, 2], Dtype::Float64);
    let out1 = Layer::linear(w).with_bias(b).fwd(&mut single, 1, &[x]).unwrap();
    assert_eq!(single.shape(out1).unwrap(), &[1, 3]);
    single.let_value(x, tensor(&[1, 2], sample.to_vec()).unwrap()).unwrap();
    TapeMachine::new(&single).unwrap().run_all(&mut single).unwrap();

    let n = 4;
    let mut batched = ExprGraph::new();
    let w = batched.new_param_from("w", weights);
    let b = batched.new_param_from("b", bias);
    let x = batched.new_input("x", &[n, 2], Dtype::Float64);
    let out_n = Layer::linear(w).with_bias(b).fwd(&mut batched, n, &[x]).unwrap();
    assert_eq!(batched.shape(out_n).unwrap(), &[n, 3]);
    let replicated = sample.iter().copied().cycle().take(2 * n).collect();
    batched.let_value(x, tensor(&[n, 2], replicated).unwrap()).unwrap();
    TapeMachine::new(&batched).unwrap().run_all(&mut batched).unwrap();

    let expected = single.value(out1).unwrap();
    let got = batched.value(out_n).unwrap();
    for row in 0..n {
        for col in 0..3 {
            assert_relative_eq!(got[[row, col]], expected[[0, col]], epsilon = 1e-12);
        }
    }
}

#[test]
fn later_layers_consume_previous_output() {
    let mut g = ExprGraph::with_seed(9);
    let w0 = g.new_param("w0", &[8, 4], Init::default());
    let w1 = g.new_param("w1", &[2, 8], Init::default());
    let x = g.new_input("x", &[1, 4], Dtype::Float64);
    let mut net = Network::new(
        "mlp",
        vec![
            Layer::linear(w0).with_activation(Activation::TANH),
            Layer::dropout(0.2),
            Layer::linear(w1).with_activation(Activation::Softmax { axis: None }),
        ],
    )
    .unwrap();
    net.fwd(&mut g, 1, &[x]).unwrap();
    let out = net.out().unwrap();
    assert_eq!(g.shape(out).unwrap(), &[1, 2]);

    g.let_value(x, tensor(&[1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap()).unwrap();
    let mut tape = TapeMachine::new(&g).unwrap();
    tape.eval();
    tape.run_all(&mut g).unwrap();
    assert_relative_eq!(g.value(out).unwrap().sum(), 1.0, epsilon = 1e-12);
}

#[test]
fn fwd_overwrites_output() {
    let mut g = ExprGraph::new();
    let w = g.new_param("w", &[2, 2], Init::Ones);
    let x = g.new_input("x", &[1, 2], Dtype::Float64);
    let mut net = Network::new("net", vec![Layer::linear(w)]).unwrap();
    net.fwd(&mut g, 1, &[x]).unwrap();
    let first = net.out().unwrap();
    net.fwd(&mut g, 1, &[x]).unwrap();
    assert_ne!(net.out().unwrap(), first);

    let bad = g.new_input("bad", &[1, 3], Dtype::Float64);
    assert!(net.fwd(&mut g, 1, &[bad]).is_err());
    assert_ne!(net.out(), Some(first));
}

#[test]
fn activation_errors_name_the_layer() {
    let mut g = ExprGraph::new();
    let w = g.new_param("w", &[2, 2], Init::Ones);
    let x = g.new_input("x", &[1, 2], Dtype::Float64);
    let mut net = Network::new(
        "net",
        vec![Layer::linear(w).with_activation(Activation::Softmax { axis: Some(4) })],
    )
    .unwrap();
    let err = net.fwd(&mut g, 1, &[x]).unwrap_err();
    assert!(matches!(err, BuildError::Activation { index: 0, .. }));
    assert!(err.to_string().contains("[net, layer #0]"));
}

#[derive(Debug, Clone)]
enum Planned {
    Linear { bias: bool },
    Maxpool { bias: bool },
    Flatten,
    Dropout,
}

fn planned() -> impl Strategy<Value = Planned> {
    prop_oneof![
        any::<bool>().prop_map(|bias| Planned::Linear { bias }),
        any::<bool>().prop_map(|bias| Planned::Maxpool { bias }),
        Just(Planned::Flatten),
        Just(Planned::Dropout),
    ]
}

proptest! {
    #[test]
    fn learnables_follow_layer_order(plan in prop::collection::vec(planned(), 1..8)) {
        let mut g = ExprGraph::new();
        let mut expected = vec![];
        let mut layers = vec![];
        for (i, step) in plan.iter().enumerate() {
            let layer = match step {
                Planned::Linear { bias } => {
                    let w = g.new_param(&format!("w{}", i), &[2, 2], Init::Zeros);
                    expected.push(w);
                    let layer = Layer::linear(w);
                    if *bias {
                        let b = g.new_param(&format!("b{}", i), &[1, 2], Init::Zeros);
                        expected.push(b);
                        layer.with_bias(b)
                    } else {
                        layer
                    }
                }
                Planned::Maxpool { bias } => {
                    let layer = Layer::maxpool(Pool2dParams::new([2, 2]));
                    if *bias {
                        let b = g.new_param(&format!("b{}", i), &[1], Init::Zeros);
                        expected.push(b);
                        layer.with_bias(b)
                    } else {
                        layer
                    }
                }
                Planned::Flatten => Layer::flatten(),
                Planned::Dropout => Layer::dropout(0.5),
            };
            layers.push(layer);
        }
        let net = Network::new("net", layers).unwrap();
        prop_assert_eq!(net.learnables(), expected);
    }
}
