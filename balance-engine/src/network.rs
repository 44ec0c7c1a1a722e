// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Small dense networks and the Adam optimizer used by the policy.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fully connected network with tanh hidden layers and a linear output layer.
///
/// Parameters live in one flat buffer, layer by layer: weights (row-major,
/// `outputs x inputs`) followed by biases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    sizes: Vec<usize>,
    params: Vec<f64>,
}

/// Layer activations recorded during a forward pass, input first.
#[derive(Debug, Clone)]
pub struct Trace {
    activations: Vec<Vec<f64>>,
}

impl Trace {
    pub fn output(&self) -> &[f64] {
        self.activations.last().map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Mlp {
    /// Uniform fan-in initialization; the output layer is scaled by `output_gain`.
    pub fn new<R: Rng + ?Sized>(
        inputs: usize,
        hidden: &[usize],
        outputs: usize,
        output_gain: f64,
        rng: &mut R,
    ) -> Self {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(inputs);
        sizes.extend_from_slice(hidden);
        sizes.push(outputs);

        let layers = sizes.len() - 1;
        let mut params = Vec::new();
        for (layer, pair) in sizes.windows(2).enumerate() {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let gain = if layer + 1 == layers { output_gain } else { 1.0 };
            let bound = gain / (fan_in as f64).sqrt();
            params.extend((0..fan_in * fan_out).map(|_| rng.random_range(-bound..=bound)));
            params.extend(std::iter::repeat_n(0.0, fan_out));
        }
        Self { sizes, params }
    }

    pub fn input_size(&self) -> usize {
        self.sizes[0]
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f64] {
        &mut self.params
    }

    pub fn forward(&self, input: &[f64]) -> Vec<f64> {
        let mut activation = input.to_vec();
        let layers = self.sizes.len() - 1;
        let mut offset = 0;
        for layer in 0..layers {
            activation = self.layer(layer, offset, &activation, layer + 1 < layers);
            offset += self.sizes[layer] * self.sizes[layer + 1] + self.sizes[layer + 1];
        }
        activation
    }

    pub fn forward_trace(&self, input: &[f64]) -> Trace {
        let layers = self.sizes.len() - 1;
        let mut activations = Vec::with_capacity(layers + 1);
        activations.push(input.to_vec());
        let mut offset = 0;
        for layer in 0..layers {
            let next = self.layer(layer, offset, &activations[layer], layer + 1 < layers);
            activations.push(next);
            offset += self.sizes[layer] * self.sizes[layer + 1] + self.sizes[layer + 1];
        }
        Trace { activations }
    }

    fn layer(&self, layer: usize, offset: usize, input: &[f64], squash: bool) -> Vec<f64> {
        let (fan_in, fan_out) = (self.sizes[layer], self.sizes[layer + 1]);
        let weights = &self.params[offset..offset + fan_in * fan_out];
        let biases = &self.params[offset + fan_in * fan_out..offset + fan_in * fan_out + fan_out];
        (0..fan_out)
            .map(|j| {
                let row = &weights[j * fan_in..(j + 1) * fan_in];
                let z = biases[j] + row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>();
                if squash { z.tanh() } else { z }
            })
            .collect()
    }

    /// Accumulates `d loss / d params` into `grads` given `d loss / d output`.
    pub fn backward(&self, trace: &Trace, output_grad: &[f64], grads: &mut [f64]) {
        let layers = self.sizes.len() - 1;
        let mut offsets = Vec::with_capacity(layers);
        let mut offset = 0;
        for layer in 0..layers {
            offsets.push(offset);
            offset += self.sizes[layer] * self.sizes[layer + 1] + self.sizes[layer + 1];
        }

        let mut delta = output_grad.to_vec();
        for layer in (0..layers).rev() {
            let (fan_in, fan_out) = (self.sizes[layer], self.sizes[layer + 1]);
            let offset = offsets[layer];
            let input = &trace.activations[layer];

            for j in 0..fan_out {
                grads[offset + fan_in * fan_out + j] += delta[j];
                let row = offset + j * fan_in;
                for i in 0..fan_in {
                    grads[row + i] += delta[j] * input[i];
                }
            }

            if layer > 0 {
                delta = (0..fan_in)
                    .map(|i| {
                        let upstream: f64 = (0..fan_out)
                            .map(|j| self.params[offset + j * fan_in + i] * delta[j])
                            .sum();
                        upstream * (1.0 - input[i] * input[i])
                    })
                    .collect();
            }
        }
    }
}

/// Adam moment estimates for one parameter buffer. The step counter survives
/// checkpoints so repeated short updates continue one schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    step: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-8;

impl Adam {
    pub fn new(len: usize) -> Self {
        Self {
            step: 0,
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn update(&mut self, params: &mut [f64], grads: &[f64], learning_rate: f64) {
        self.step += 1;
        let t = self.step as i32;
        let correction1 = 1.0 - BETA1.powi(t);
        let correction2 = 1.0 - BETA2.powi(t);
        for (((param, grad), m), v) in params
            .iter_mut()
            .zip(grads)
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            *m = BETA1 * *m + (1.0 - BETA1) * grad;
            *v = BETA2 * *v + (1.0 - BETA2) * grad * grad;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *param -= learning_rate * m_hat / (v_hat.sqrt() + EPSILON);
        }
    }
}
