//! Feed-forward (leaky) ReLU network with a scalar output.

use lyap_core::{Bound, LyapError, Result, StateBox};
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Affine layer `z = W a + b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearLayer {
    /// Shape (out_features, in_features).
    pub weight: Array2<f64>,
    /// Shape (out_features,).
    pub bias: Array1<f64>,
}

impl LinearLayer {
    pub fn new(weight: Array2<f64>, bias: Array1<f64>) -> Result<Self> {
        if weight.nrows() != bias.len() {
            return Err(LyapError::shape_mismatch(
                vec![weight.nrows()],
                vec![bias.len()],
            ));
        }
        Ok(Self { weight, bias })
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    #[inline]
    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Which hidden neurons are on the active (identity) side of their ReLU.
///
/// One entry per hidden layer. Fixing a pattern makes the network affine in
/// its input, which is how a verifier's reported linear region is replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationPattern {
    pub active: Vec<Vec<bool>>,
}

impl ActivationPattern {
    /// Number of active neurons across all hidden layers.
    pub fn num_active(&self) -> usize {
        self.active.iter().map(|l| l.iter().filter(|&&a| a).count()).sum()
    }
}

/// Intermediate values of one forward pass.
struct ForwardTrace {
    /// Input vector of every layer (`inputs[0]` is the network input).
    inputs: Vec<Array1<f64>>,
    /// Activation slope of every hidden neuron (1 or `negative_slope`).
    slopes: Vec<Array1<f64>>,
    output: f64,
}

/// Serializable copy of a network's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    /// Layer widths, input first, ending in 1.
    pub dims: Vec<usize>,
    pub negative_slope: f64,
    /// Flattened parameters, see [`ReluNetwork::parameters`].
    pub parameters: Array1<f64>,
}

impl NetworkSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

/// Feed-forward network `ℝⁿ → ℝ` with (leaky) ReLU between affine layers.
///
/// The last layer is affine with a single output; every other layer is
/// followed by `max(z, 0) + negative_slope · min(z, 0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReluNetwork {
    layers: Vec<LinearLayer>,
    negative_slope: f64,
}

impl ReluNetwork {
    /// Create a network from its layers.
    pub fn new(layers: Vec<LinearLayer>, negative_slope: f64) -> Result<Self> {
        if layers.is_empty() {
            return Err(LyapError::InvalidConfig(
                "network needs at least one layer".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&negative_slope) {
            return Err(LyapError::InvalidConfig(format!(
                "negative slope must be in [0, 1), got {negative_slope}"
            )));
        }
        for pair in layers.windows(2) {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(LyapError::shape_mismatch(
                    vec![pair[0].out_features()],
                    vec![pair[1].in_features()],
                ));
            }
        }
        let last = layers.len() - 1;
        if layers[last].out_features() != 1 {
            return Err(LyapError::shape_mismatch(
                vec![1],
                vec![layers[last].out_features()],
            ));
        }
        Ok(Self {
            layers,
            negative_slope,
        })
    }

    /// Create a ReLU network with uniform `±1/√fan_in` initialization.
    ///
    /// `dims` lists layer widths from input to output; the last entry must be 1.
    pub fn random<R: Rng>(dims: &[usize], rng: &mut R) -> Result<Self> {
        if dims.len() < 2 {
            return Err(LyapError::InvalidConfig(format!(
                "network dims need an input and an output width, got {dims:?}"
            )));
        }
        let mut layers = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            if fan_in == 0 || fan_out == 0 {
                return Err(LyapError::InvalidConfig(format!(
                    "zero-width layer in {dims:?}"
                )));
            }
            let k = 1.0 / (fan_in as f64).sqrt();
            let weight = Array2::from_shape_fn((fan_out, fan_in), |_| rng.random_range(-k..k));
            let bias = Array1::from_shape_fn(fan_out, |_| rng.random_range(-k..k));
            layers.push(LinearLayer::new(weight, bias)?);
        }
        Self::new(layers, 0.0)
    }

    pub fn layers(&self) -> &[LinearLayer] {
        &self.layers
    }

    pub fn negative_slope(&self) -> f64 {
        self.negative_slope
    }

    pub fn input_dim(&self) -> usize {
        self.layers[0].in_features()
    }

    /// Layer widths, input first.
    pub fn dims(&self) -> Vec<usize> {
        std::iter::once(self.input_dim())
            .chain(self.layers.iter().map(LinearLayer::out_features))
            .collect()
    }

    pub fn num_hidden_layers(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(LinearLayer::num_parameters).sum()
    }

    /// All weights and biases, layer by layer, each weight matrix row-major
    /// followed by its bias.
    pub fn parameters(&self) -> Array1<f64> {
        let mut flat = Vec::with_capacity(self.num_parameters());
        for layer in &self.layers {
            flat.extend(layer.weight.iter().copied());
            flat.extend(layer.bias.iter().copied());
        }
        Array1::from(flat)
    }

    /// Overwrite all parameters from a flat vector laid out as [`Self::parameters`].
    pub fn set_parameters(&mut self, params: ArrayView1<f64>) -> Result<()> {
        if params.len() != self.num_parameters() {
            return Err(LyapError::shape_mismatch(
                vec![self.num_parameters()],
                vec![params.len()],
            ));
        }
        let mut values = params.iter().copied();
        for layer in &mut self.layers {
            for (w, v) in layer.weight.iter_mut().zip(values.by_ref()) {
                *w = v;
            }
            for (b, v) in layer.bias.iter_mut().zip(values.by_ref()) {
                *b = v;
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> NetworkSnapshot {
        NetworkSnapshot {
            dims: self.dims(),
            negative_slope: self.negative_slope,
            parameters: self.parameters(),
        }
    }

    /// Restore parameters from a snapshot of a network with the same architecture.
    pub fn restore(&mut self, snapshot: &NetworkSnapshot) -> Result<()> {
        let dims = self.dims();
        if snapshot.dims != dims {
            return Err(LyapError::shape_mismatch(dims, snapshot.dims.clone()));
        }
        debug!(
            "restoring {} parameters for dims {:?}",
            snapshot.parameters.len(),
            dims
        );
        self.negative_slope = snapshot.negative_slope;
        self.set_parameters(snapshot.parameters.view())
    }

    /// Build a zero network with the snapshot's architecture, then restore it.
    pub fn from_snapshot(snapshot: &NetworkSnapshot) -> Result<Self> {
        if snapshot.dims.len() < 2 {
            return Err(LyapError::InvalidConfig(format!(
                "snapshot dims too short: {:?}",
                snapshot.dims
            )));
        }
        let layers = snapshot
            .dims
            .windows(2)
            .map(|p| LinearLayer::new(Array2::zeros((p[1], p[0])), Array1::zeros(p[1])))
            .collect::<Result<Vec<_>>>()?;
        let mut network = Self::new(layers, snapshot.negative_slope)?;
        network.restore(snapshot)?;
        Ok(network)
    }

    fn check_input(&self, x: ArrayView1<f64>) -> Result<()> {
        if x.len() != self.input_dim() {
            return Err(LyapError::shape_mismatch(vec![self.input_dim()], vec![x.len()]));
        }
        Ok(())
    }

    fn check_pattern(&self, pattern: &ActivationPattern) -> Result<()> {
        let expected: Vec<usize> = self.layers[..self.num_hidden_layers()]
            .iter()
            .map(LinearLayer::out_features)
            .collect();
        let got: Vec<usize> = pattern.active.iter().map(Vec::len).collect();
        if expected != got {
            return Err(LyapError::shape_mismatch(expected, got));
        }
        Ok(())
    }

    fn forward_trace(
        &self,
        x: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<ForwardTrace> {
        self.check_input(x)?;
        if let Some(p) = pattern {
            self.check_pattern(p)?;
        }
        let hidden = self.num_hidden_layers();
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut slopes = Vec::with_capacity(hidden);
        inputs.push(x.to_owned());
        let mut output = 0.0;
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.weight.dot(&inputs[l]) + &layer.bias;
            if l == hidden {
                output = z[0];
                break;
            }
            let slope: Array1<f64> = match pattern {
                Some(p) => p.active[l]
                    .iter()
                    .map(|&on| if on { 1.0 } else { self.negative_slope })
                    .collect(),
                None => z
                    .iter()
                    .map(|&v| if v > 0.0 { 1.0 } else { self.negative_slope })
                    .collect(),
            };
            inputs.push(&z * &slope);
            slopes.push(slope);
        }
        Ok(ForwardTrace {
            inputs,
            slopes,
            output,
        })
    }

    /// Evaluate the network.
    pub fn forward(&self, x: ArrayView1<f64>) -> Result<f64> {
        Ok(self.forward_trace(x, None)?.output)
    }

    /// Evaluate the affine piece selected by `pattern` at `x`.
    pub fn forward_with_pattern(
        &self,
        x: ArrayView1<f64>,
        pattern: &ActivationPattern,
    ) -> Result<f64> {
        Ok(self.forward_trace(x, Some(pattern))?.output)
    }

    /// Activation pattern at `x`; ties (`z == 0`) count as inactive.
    pub fn activation_pattern(&self, x: ArrayView1<f64>) -> Result<ActivationPattern> {
        let trace = self.forward_trace(x, None)?;
        Ok(ActivationPattern {
            active: trace
                .slopes
                .iter()
                .map(|s| s.iter().map(|&v| v == 1.0).collect())
                .collect(),
        })
    }

    /// Hidden pre-activations at `x`, one array per hidden layer.
    pub fn pre_activations(&self, x: ArrayView1<f64>) -> Result<Vec<Array1<f64>>> {
        self.check_input(x)?;
        let mut a = x.to_owned();
        let mut out = Vec::with_capacity(self.num_hidden_layers());
        for layer in &self.layers[..self.num_hidden_layers()] {
            let z = layer.weight.dot(&a) + &layer.bias;
            a = z.mapv(|v| if v > 0.0 { v } else { self.negative_slope * v });
            out.push(z);
        }
        Ok(out)
    }

    fn parameter_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut acc = 0;
        for layer in &self.layers {
            offsets.push(acc);
            acc += layer.num_parameters();
        }
        offsets
    }

    /// Reverse-mode pass from the scalar output to every parameter.
    fn backprop(
        &self,
        inputs: &[Array1<f64>],
        slopes: &[Array1<f64>],
        include_bias: bool,
    ) -> Array1<f64> {
        let mut grad = Array1::zeros(self.num_parameters());
        let offsets = self.parameter_offsets();
        let mut delta = Array1::from_elem(1, 1.0);
        for l in (0..self.layers.len()).rev() {
            let layer = &self.layers[l];
            let input = &inputs[l];
            let (rows, cols) = layer.weight.dim();
            let mut off = offsets[l];
            for i in 0..rows {
                for j in 0..cols {
                    grad[off] = delta[i] * input[j];
                    off += 1;
                }
            }
            if include_bias {
                for i in 0..rows {
                    grad[off + i] = delta[i];
                }
            }
            if l > 0 {
                delta = layer.weight.t().dot(&delta) * &slopes[l - 1];
            }
        }
        grad
    }

    /// Output and its gradient with respect to [`Self::parameters`].
    ///
    /// With `pattern` set, the gradient is that of the fixed affine piece.
    pub fn gradient(
        &self,
        x: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<(f64, Array1<f64>)> {
        let trace = self.forward_trace(x, pattern)?;
        let grad = self.backprop(&trace.inputs, &trace.slopes, true);
        Ok((trace.output, grad))
    }

    /// Gradient of the output with respect to the input.
    pub fn input_gradient(
        &self,
        x: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<Array1<f64>> {
        let trace = self.forward_trace(x, pattern)?;
        let mut delta = Array1::from_elem(1, 1.0);
        for l in (0..self.layers.len()).rev() {
            delta = self.layers[l].weight.t().dot(&delta);
            if l > 0 {
                delta = delta * &trace.slopes[l - 1];
            }
        }
        Ok(delta)
    }

    /// Directional derivative `∂N/∂x(x) · v` and its parameter gradient.
    ///
    /// The activation slopes are held at those of `x` (or `pattern`), so the
    /// tangent map is linear in `v` and bias-free.
    pub fn tangent_gradient(
        &self,
        x: ArrayView1<f64>,
        v: ArrayView1<f64>,
        pattern: Option<&ActivationPattern>,
    ) -> Result<(f64, Array1<f64>)> {
        self.check_input(v)?;
        let trace = self.forward_trace(x, pattern)?;
        let hidden = self.num_hidden_layers();
        let mut tangents = Vec::with_capacity(self.layers.len());
        tangents.push(v.to_owned());
        let mut value = 0.0;
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.weight.dot(&tangents[l]);
            if l == hidden {
                value = z[0];
                break;
            }
            tangents.push(z * &trace.slopes[l]);
        }
        let grad = self.backprop(&tangents, &trace.slopes, false);
        Ok((value, grad))
    }

    /// Interval bounds of the output over a box (IBP).
    pub fn interval_bounds(&self, domain: &StateBox) -> Result<Bound> {
        if domain.dim() != self.input_dim() {
            return Err(LyapError::shape_mismatch(
                vec![self.input_dim()],
                vec![domain.dim()],
            ));
        }
        let mut lo = domain.lower();
        let mut hi = domain.upper();
        let hidden = self.num_hidden_layers();
        for (l, layer) in self.layers.iter().enumerate() {
            let center = (&lo + &hi) * 0.5;
            let radius = (&hi - &lo) * 0.5;
            let mid = layer.weight.dot(&center) + &layer.bias;
            let rad = layer.weight.mapv(f64::abs).dot(&radius);
            lo = &mid - &rad;
            hi = &mid + &rad;
            if l < hidden {
                let ns = self.negative_slope;
                let act = move |v: f64| if v > 0.0 { v } else { ns * v };
                lo.mapv_inplace(act);
                hi.mapv_inplace(act);
            }
        }
        Ok(Bound::new(lo[0], hi[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lyap_core::Bound;
    use ndarray::{arr1, arr2};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_network() -> ReluNetwork {
        let l1 = LinearLayer::new(
            arr2(&[[1.0, -0.5], [0.3, 0.8], [-1.2, 0.4]]),
            arr1(&[0.1, -0.2, 0.05]),
        )
        .unwrap();
        let l2 = LinearLayer::new(arr2(&[[0.7, -1.1, 0.5]]), arr1(&[0.3])).unwrap();
        ReluNetwork::new(vec![l1, l2], 0.0).unwrap()
    }

    fn finite_difference(net: &ReluNetwork, x: ArrayView1<f64>) -> Array1<f64> {
        let params = net.parameters();
        let h = 1e-6;
        let mut grad = Array1::zeros(params.len());
        let mut shifted = net.clone();
        for k in 0..params.len() {
            let mut p = params.clone();
            p[k] += h;
            shifted.set_parameters(p.view()).unwrap();
            let plus = shifted.forward(x).unwrap();
            p[k] -= 2.0 * h;
            shifted.set_parameters(p.view()).unwrap();
            let minus = shifted.forward(x).unwrap();
            grad[k] = (plus - minus) / (2.0 * h);
        }
        grad
    }

    #[test]
    fn test_forward_matches_manual() {
        let net = small_network();
        let x = arr1(&[0.5, 1.0]);
        // z1 = [0.1, 0.75, -0.15] -> relu [0.1, 0.75, 0]
        let expected = 0.7 * 0.1 - 1.1 * 0.75 + 0.3;
        assert!((net.forward(x.view()).unwrap() - expected).abs() < 1e-12);
        let pattern = net.activation_pattern(x.view()).unwrap();
        assert_eq!(pattern.active, vec![vec![true, true, false]]);
        assert_eq!(pattern.num_active(), 2);
    }

    #[test]
    fn test_parameter_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let net = ReluNetwork::random(&[2, 6, 4, 1], &mut rng).unwrap();
        let x = arr1(&[0.37, -0.81]);
        let (_, grad) = net.gradient(x.view(), None).unwrap();
        let fd = finite_difference(&net, x.view());
        for (a, b) in grad.iter().zip(fd.iter()) {
            assert!((a - b).abs() < 1e-5, "analytic {a} vs finite difference {b}");
        }
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(11);
        let net = ReluNetwork::random(&[3, 5, 1], &mut rng).unwrap();
        let x = arr1(&[0.2, -0.4, 0.9]);
        let g = net.input_gradient(x.view(), None).unwrap();
        let h = 1e-7;
        for i in 0..3 {
            let mut xp = x.clone();
            xp[i] += h;
            let mut xm = x.clone();
            xm[i] -= h;
            let fd = (net.forward(xp.view()).unwrap() - net.forward(xm.view()).unwrap()) / (2.0 * h);
            assert!((g[i] - fd).abs() < 1e-5);
        }
    }

    #[test]
    fn test_tangent_gradient_is_directional_derivative() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = ReluNetwork::random(&[2, 4, 1], &mut rng).unwrap();
        let x = arr1(&[0.1, 0.6]);
        let v = arr1(&[-0.3, 0.7]);
        let (value, grad) = net.tangent_gradient(x.view(), v.view(), None).unwrap();
        let expected = net.input_gradient(x.view(), None).unwrap().dot(&v);
        assert!((value - expected).abs() < 1e-12);

        // Perturb one weight and compare against the recomputed tangent value.
        let pattern = net.activation_pattern(x.view()).unwrap();
        let params = net.parameters();
        let h = 1e-6;
        let mut shifted = net.clone();
        for k in 0..params.len() {
            let mut p = params.clone();
            p[k] += h;
            shifted.set_parameters(p.view()).unwrap();
            let plus = shifted.tangent_gradient(x.view(), v.view(), Some(&pattern)).unwrap().0;
            p[k] -= 2.0 * h;
            shifted.set_parameters(p.view()).unwrap();
            let minus = shifted.tangent_gradient(x.view(), v.view(), Some(&pattern)).unwrap().0;
            assert!((grad[k] - (plus - minus) / (2.0 * h)).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fixed_pattern_extends_affine_piece() {
        let net = small_network();
        let x = arr1(&[0.5, 1.0]);
        let pattern = net.activation_pattern(x.view()).unwrap();
        // Move to a point where the third neuron would be active; the fixed
        // pattern keeps evaluating the original piece.
        let y = arr1(&[-1.0, 0.0]);
        let on_piece = net.forward_with_pattern(y.view(), &pattern).unwrap();
        let expected = 0.7 * (1.0 * -1.0 + 0.1) - 1.1 * (0.3 * -1.0 - 0.2) + 0.3;
        assert!((on_piece - expected).abs() < 1e-12);
    }

    #[test]
    fn test_set_parameters_rejects_wrong_length() {
        let mut net = small_network();
        let err = net.set_parameters(arr1(&[1.0, 2.0]).view()).unwrap_err();
        assert!(matches!(err, LyapError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_snapshot_restore_and_json() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut net = ReluNetwork::random(&[1, 4, 1], &mut rng).unwrap();
        let snap = net.snapshot();
        let original = net.parameters();
        net.set_parameters(Array1::zeros(original.len()).view()).unwrap();
        net.restore(&snap).unwrap();
        assert_eq!(net.parameters(), original);

        let json = snap.to_json().unwrap();
        let rebuilt = ReluNetwork::from_snapshot(&NetworkSnapshot::from_json(&json).unwrap()).unwrap();
        assert_eq!(rebuilt, net);

        let mut other = ReluNetwork::random(&[1, 3, 1], &mut rng).unwrap();
        assert!(other.restore(&snap).is_err());
    }

    #[test]
    fn test_rejects_non_scalar_output() {
        let l = LinearLayer::new(arr2(&[[1.0], [2.0]]), arr1(&[0.0, 0.0])).unwrap();
        assert!(ReluNetwork::new(vec![l], 0.0).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// IBP soundness: every sampled output lies within the interval bounds.
        #[test]
        fn interval_bounds_contain_samples(
            seed in 0u64..1000,
            lo0 in -2.0f64..0.0, w0 in 0.0f64..2.0,
            lo1 in -2.0f64..0.0, w1 in 0.0f64..2.0,
            t0 in 0.0f64..=1.0, t1 in 0.0f64..=1.0,
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let net = ReluNetwork::random(&[2, 5, 3, 1], &mut rng).unwrap();
            let domain = StateBox::new(vec![Bound::new(lo0, lo0 + w0), Bound::new(lo1, lo1 + w1)]);
            let bound = net.interval_bounds(&domain).unwrap();
            let x = arr1(&[lo0 + w0 * t0, lo1 + w1 * t1]);
            let y = net.forward(x.view()).unwrap();
            prop_assert!(bound.lower - 1e-9 <= y && y <= bound.upper + 1e-9,
                "{} not in [{}, {}]", y, bound.lower, bound.upper);
        }
    }
}
