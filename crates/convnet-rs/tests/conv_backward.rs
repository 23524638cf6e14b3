use convnet_rs::{Activation, Blob, DepthwiseConv2d, Dispatcher, Layer, NetworkState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn net_with_input(input: Blob) -> NetworkState {
    let mut net = NetworkState::new(input.numbers(), Dispatcher::new(2).unwrap());
    net.push_input(input).unwrap();
    net
}

#[test]
fn backward_before_prepare_fails_fast() {
    let mut input = Blob::new(1, 1, 4, 4);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(4, 4, 1, 1, 3, 1).unwrap();
    net.register_layer(&mut layer);
    let err = layer.backward(&mut net).unwrap_err();
    assert!(err.to_string().contains("before prepare"));
}

#[test]
fn gradient_shapes_mirror_parameters_for_any_batch() {
    for batch in [1, 3] {
        let mut input = Blob::new(batch, 2, 4, 4);
        input.fill(1.0);
        let mut net = net_with_input(input);
        let mut layer = DepthwiseConv2d::new(4, 4, 2, 4, 3, 1).unwrap();
        net.register_layer(&mut layer);
        layer.prepare(&net, &mut rand::thread_rng()).unwrap();
        layer.forward(&mut net).unwrap();
        net.diff_mut(1).fill(1.0);
        layer.backward(&mut net).unwrap();
        assert_eq!(
            layer.kernel_grad().unwrap().dims(),
            layer.kernel().unwrap().dims()
        );
        assert_eq!(
            layer.bias_grad().unwrap().dims(),
            layer.bias().unwrap().dims()
        );
    }
}

#[test]
fn incoming_error_is_chained_through_the_activation_derivative() {
    let mut rng = StdRng::seed_from_u64(31);
    let mut input = Blob::new(2, 1, 3, 3);
    input.fill_gaussian(1.0, &mut rng);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(3, 3, 1, 1, 3, 1)
        .unwrap()
        .with_activation(Activation::Sigmoid);
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();
    let z = layer.pre_activation().unwrap().clone();

    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();
    for (&d, &pre) in net.diff(1).data().iter().zip(z.data()) {
        assert_eq!(d, Activation::Sigmoid.diff_active(pre));
    }
}

#[test]
fn kernel_gradient_counts_in_bounds_taps_on_all_ones() {
    let mut input = Blob::new(1, 1, 4, 4);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(4, 4, 1, 1, 3, 1).unwrap();
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();
    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();

    // With unit input and unit error, each kernel tap accumulates the number
    // of output positions whose window keeps it in bounds: 3 or 4 per axis.
    let taps = [3.0f32, 4.0, 3.0];
    let kg = layer.kernel_grad().unwrap();
    for kh in 0..3 {
        for kw in 0..3 {
            assert_eq!(kg.get(0, 0, kh, kw), taps[kh] * taps[kw], "at ({kh},{kw})");
        }
    }
    assert_eq!(layer.bias_grad().unwrap().get(0, 0, 0, 0), 16.0);
}

#[test]
fn gradients_are_averaged_over_the_batch() {
    let mut input = Blob::new(2, 1, 4, 4);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(4, 4, 1, 1, 3, 1).unwrap();
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();

    // Error only on sample 0: the mean over two samples halves the gradient.
    net.diff_mut(1).fill(0.0);
    let row_len = net.diff(1).sample_len();
    for v in &mut net.diff_mut(1).data_mut()[..row_len] {
        *v = 1.0;
    }
    layer.backward(&mut net).unwrap();
    assert_eq!(layer.kernel_grad().unwrap().get(0, 0, 1, 1), 8.0);
    assert_eq!(layer.bias_grad().unwrap().get(0, 0, 0, 0), 8.0);
}

#[test]
fn gradients_are_recomputed_not_accumulated_across_calls() {
    let mut input = Blob::new(1, 1, 4, 4);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(4, 4, 1, 1, 3, 1).unwrap();
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();

    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();
    let first = layer.kernel_grad().unwrap().clone();
    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();
    assert_eq!(&first, layer.kernel_grad().unwrap());
}

#[test]
fn first_layer_leaves_the_predecessor_error_untouched() {
    let mut input = Blob::new(1, 1, 3, 3);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(3, 3, 1, 1, 3, 1).unwrap();
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();

    net.diff_mut(0).fill(7.5);
    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();
    assert!(net.diff(0).data().iter().all(|&v| v == 7.5));
}

#[test]
fn deeper_layers_propagate_error_to_the_predecessor_slot() {
    let mut net = NetworkState::new(1, Dispatcher::new(2).unwrap());
    net.push_input(Blob::new(1, 1, 1, 1)).unwrap();
    let mut mid = Blob::new(1, 1, 1, 1);
    mid.fill(4.0);
    net.push_input(mid).unwrap();

    let mut layer = DepthwiseConv2d::new(1, 1, 1, 1, 1, 1).unwrap();
    let id = net.register_layer(&mut layer);
    assert_eq!(id, 2);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.kernel_mut().unwrap().fill(2.0);
    layer.bias_mut().unwrap().fill(0.0);
    layer.forward(&mut net).unwrap();

    net.diff_mut(2).fill(3.0);
    layer.backward(&mut net).unwrap();
    // 1x1 kernel: the propagated error is error * kernel.
    assert_eq!(net.diff(1).get(0, 0, 0, 0), 6.0);
    assert_eq!(layer.kernel_grad().unwrap().get(0, 0, 0, 0), 12.0);
    assert_eq!(layer.bias_grad().unwrap().get(0, 0, 0, 0), 3.0);
}

#[test]
fn params_and_grads_export_matching_pairs() {
    let mut input = Blob::new(1, 1, 3, 3);
    input.fill(1.0);
    let mut net = net_with_input(input);
    let mut layer = DepthwiseConv2d::new(3, 3, 1, 2, 3, 1).unwrap();
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.forward(&mut net).unwrap();
    net.diff_mut(1).fill(1.0);
    layer.backward(&mut net).unwrap();

    let params = layer.params();
    let grads = layer.grads();
    assert_eq!(params.len(), 2);
    assert_eq!(grads.len(), 2);
    for (p, g) in params.iter().zip(&grads) {
        assert_eq!(p.dims(), g.dims());
    }
}

#[test]
fn finite_differences_validate_the_rotated_backprop_variant() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut net = NetworkState::new(1, Dispatcher::new(2).unwrap());
    net.push_input(Blob::new(1, 1, 3, 3)).unwrap();
    let mut input = Blob::new(1, 1, 3, 3);
    input.fill_gaussian(1.0, &mut rng);
    net.push_input(input).unwrap();

    let mut layer = DepthwiseConv2d::new(3, 3, 1, 2, 3, 1)
        .unwrap()
        .with_activation(Activation::Sigmoid)
        .rotate_kernel_in_backprop(true);
    net.register_layer(&mut layer);
    layer.prepare(&net, &mut rand::thread_rng()).unwrap();
    layer.kernel_mut().unwrap().fill_gaussian(0.5, &mut rng);
    layer.bias_mut().unwrap().fill(0.1);

    // Scalar loss: fixed random weighting of the layer output.
    let weights: Vec<f32> = (0..18).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    let loss = |net: &NetworkState| -> f32 {
        net.activation(2)
            .data()
            .iter()
            .zip(&weights)
            .map(|(a, w)| a * w)
            .sum()
    };

    layer.forward(&mut net).unwrap();
    net.diff_mut(2).data_mut().copy_from_slice(&weights);
    layer.backward(&mut net).unwrap();
    let input_grad = net.diff(1).data().to_vec();
    let kernel_grad = layer.kernel_grad().unwrap().data().to_vec();

    let eps = 1e-2f32;
    let close = |analytic: f32, numeric: f32| {
        (analytic - numeric).abs() <= 1e-2 * analytic.abs().max(1.0)
    };

    for i in 0..input_grad.len() {
        net.activation_mut(1).data_mut()[i] += eps;
        layer.forward(&mut net).unwrap();
        let plus = loss(&net);
        net.activation_mut(1).data_mut()[i] -= 2.0 * eps;
        layer.forward(&mut net).unwrap();
        let minus = loss(&net);
        net.activation_mut(1).data_mut()[i] += eps;
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            close(input_grad[i], numeric),
            "input grad {} analytic {} vs numeric {}",
            i,
            input_grad[i],
            numeric
        );
    }

    for i in 0..kernel_grad.len() {
        layer.kernel_mut().unwrap().data_mut()[i] += eps;
        layer.forward(&mut net).unwrap();
        let plus = loss(&net);
        layer.kernel_mut().unwrap().data_mut()[i] -= 2.0 * eps;
        layer.forward(&mut net).unwrap();
        let minus = loss(&net);
        layer.kernel_mut().unwrap().data_mut()[i] += eps;
        let numeric = (plus - minus) / (2.0 * eps);
        assert!(
            close(kernel_grad[i], numeric),
            "kernel grad {} analytic {} vs numeric {}",
            i,
            kernel_grad[i],
            numeric
        );
    }
}
