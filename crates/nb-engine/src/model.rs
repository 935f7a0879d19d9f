//! CPU multilayer perceptron over embedded tabular features.
//!
//! Layout: an `nfeat × nemb` embedding scaled by each feature's value,
//! flattened to `nfield · nemb`, then `Linear + ReLU` per hidden layer and a
//! linear head with `num_labels` outputs. Weights are row-major
//! `out × in`; batches are row-major `rows × width`.
//!
//! There is no batch norm and no dropout, so training and evaluation share
//! one deterministic forward pass.

use nb_data::Batch;
use nb_types::TrainingError;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

const PAR_MIN_LEN: usize = 4096;

/// A trainable tensor with its gradient and Adam moments.
#[derive(Debug, Clone)]
struct Param {
    value: Vec<f32>,
    grad: Vec<f32>,
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Param {
    fn new(value: Vec<f32>) -> Self {
        let len = value.len();
        Self {
            value,
            grad: vec![0.0; len],
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    /// Xavier-uniform initialisation.
    fn xavier(fan_in: usize, fan_out: usize, len: usize, rng: &mut ChaCha8Rng) -> Self {
        let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
        Self::new((0..len).map(|_| rng.gen_range(-bound..bound)).collect())
    }

    fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    fn len(&self) -> usize {
        self.value.len()
    }
}

/// Adam optimiser state shared by every parameter of one model.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    step: i32,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr: lr as f32,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
        }
    }

    pub fn steps(&self) -> i32 {
        self.step
    }

    fn update(&self, param: &mut Param) {
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let correction1 = 1.0 - beta1.powi(self.step);
        let correction2 = 1.0 - beta2.powi(self.step);
        let step_size = self.lr / correction1;

        param
            .value
            .par_iter_mut()
            .zip(param.grad.par_iter())
            .zip(param.m.par_iter_mut())
            .zip(param.v.par_iter_mut())
            .with_min_len(PAR_MIN_LEN)
            .for_each(|(((w, &g), m), v)| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *w -= step_size * *m / ((*v / correction2).sqrt() + eps);
            });
    }
}

#[derive(Debug, Clone)]
struct Linear {
    in_dim: usize,
    out_dim: usize,
    weight: Param,
    bias: Param,
}

impl Linear {
    fn new(in_dim: usize, out_dim: usize, rng: &mut ChaCha8Rng) -> Self {
        Self {
            in_dim,
            out_dim,
            weight: Param::xavier(in_dim, out_dim, in_dim * out_dim, rng),
            bias: Param::zeros(out_dim),
        }
    }

    fn forward(&self, input: &[f32]) -> Vec<f32> {
        let rows = input.len() / self.in_dim;
        let mut output = vec![0.0; rows * self.out_dim];
        let (in_dim, weight, bias) = (self.in_dim, &self.weight.value, &self.bias.value);

        output
            .par_chunks_mut(self.out_dim)
            .zip(input.par_chunks(in_dim))
            .for_each(|(out, x)| {
                for (j, o) in out.iter_mut().enumerate() {
                    let w = &weight[j * in_dim..(j + 1) * in_dim];
                    *o = bias[j] + w.iter().zip(x).map(|(a, b)| a * b).sum::<f32>();
                }
            });
        output
    }

    /// Accumulate parameter gradients and return the gradient w.r.t. `input`.
    fn backward(&mut self, input: &[f32], grad_out: &[f32]) -> Vec<f32> {
        let (in_dim, out_dim) = (self.in_dim, self.out_dim);
        let rows = grad_out.len() / out_dim;

        self.weight
            .grad
            .par_chunks_mut(in_dim)
            .zip(self.bias.grad.par_iter_mut())
            .enumerate()
            .for_each(|(j, (gw, gb))| {
                for r in 0..rows {
                    let d = grad_out[r * out_dim + j];
                    if d == 0.0 {
                        continue;
                    }
                    *gb += d;
                    let x = &input[r * in_dim..(r + 1) * in_dim];
                    for (g, &xi) in gw.iter_mut().zip(x) {
                        *g += d * xi;
                    }
                }
            });

        let weight = &self.weight.value;
        let mut grad_in = vec![0.0; rows * in_dim];
        grad_in
            .par_chunks_mut(in_dim)
            .zip(grad_out.par_chunks(out_dim))
            .for_each(|(gi, go)| {
                for (j, &d) in go.iter().enumerate() {
                    if d == 0.0 {
                        continue;
                    }
                    let w = &weight[j * in_dim..(j + 1) * in_dim];
                    for (g, &wv) in gi.iter_mut().zip(w) {
                        *g += d * wv;
                    }
                }
            });
        grad_in
    }

    fn params_mut(&mut self) -> [&mut Param; 2] {
        [&mut self.weight, &mut self.bias]
    }
}

/// Activations kept from a forward pass for the backward pass.
#[derive(Debug)]
pub struct ForwardPass {
    /// Input of each linear layer: the embedding output, then every hidden
    /// activation after ReLU.
    activations: Vec<Vec<f32>>,
    pub logits: Vec<f32>,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct Mlp {
    nfeat: usize,
    nfield: usize,
    nemb: usize,
    num_labels: usize,
    embedding: Param,
    hidden: Vec<Linear>,
    head: Linear,
}

impl Mlp {
    pub fn new(
        nfeat: usize,
        nfield: usize,
        nemb: usize,
        hidden_layers: &[usize],
        num_labels: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self, TrainingError> {
        if nfeat == 0 || nfield == 0 || nemb == 0 || num_labels == 0 {
            return Err(TrainingError::InvalidModel {
                message: format!(
                    "all dimensions must be positive (nfeat={nfeat}, nfield={nfield}, nemb={nemb}, num_labels={num_labels})"
                ),
            });
        }
        if let Some(pos) = hidden_layers.iter().position(|&h| h == 0) {
            return Err(TrainingError::InvalidModel {
                message: format!("hidden layer {pos} has zero units"),
            });
        }

        let embedding = Param::xavier(nfeat, nemb, nfeat * nemb, rng);
        let mut width = nfield * nemb;
        let mut hidden = Vec::with_capacity(hidden_layers.len());
        for &units in hidden_layers {
            hidden.push(Linear::new(width, units, rng));
            width = units;
        }
        let head = Linear::new(width, num_labels, rng);

        Ok(Self {
            nfeat,
            nfield,
            nemb,
            num_labels,
            embedding,
            hidden,
            head,
        })
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    pub fn num_params(&self) -> usize {
        self.embedding.len()
            + self
                .hidden
                .iter()
                .chain(std::iter::once(&self.head))
                .map(|l| l.weight.len() + l.bias.len())
                .sum::<usize>()
    }

    fn check_batch(&self, batch: &Batch) -> Result<(), TrainingError> {
        if batch.nfield != self.nfield {
            return Err(TrainingError::InvalidModel {
                message: format!("batch has {} fields, model expects {}", batch.nfield, self.nfield),
            });
        }
        if let Some(&id) = batch.ids.iter().find(|&&id| id as usize >= self.nfeat) {
            return Err(TrainingError::InvalidModel {
                message: format!("feature id {id} exceeds nfeat={}", self.nfeat),
            });
        }
        Ok(())
    }

    pub fn forward(&self, batch: &Batch) -> Result<ForwardPass, TrainingError> {
        self.check_batch(batch)?;
        let rows = batch.size();
        let nemb = self.nemb;

        let mut embedded = vec![0.0; rows * self.nfield * nemb];
        for (slot, (&id, &value)) in batch.ids.iter().zip(&batch.values).enumerate() {
            let row = &self.embedding.value[id as usize * nemb..(id as usize + 1) * nemb];
            for (e, &w) in embedded[slot * nemb..(slot + 1) * nemb].iter_mut().zip(row) {
                *e = w * value;
            }
        }

        let mut activations = Vec::with_capacity(self.hidden.len() + 1);
        activations.push(embedded);
        for layer in &self.hidden {
            let mut h = layer.forward(activations.last().map(Vec::as_slice).unwrap_or_default());
            // NaN passes through so divergence reaches the loss.
            h.iter_mut().filter(|x| **x < 0.0).for_each(|x| *x = 0.0);
            activations.push(h);
        }
        let logits = self
            .head
            .forward(activations.last().map(Vec::as_slice).unwrap_or_default());

        Ok(ForwardPass {
            activations,
            logits,
            rows,
        })
    }

    /// Backpropagate `grad_logits` (already scaled by the batch mean).
    pub fn backward(&mut self, batch: &Batch, pass: &ForwardPass, grad_logits: &[f32]) {
        let depth = self.hidden.len();
        let mut grad = self.head.backward(&pass.activations[depth], grad_logits);

        for (i, layer) in self.hidden.iter_mut().enumerate().rev() {
            for (g, &a) in grad.iter_mut().zip(&pass.activations[i + 1]) {
                if a <= 0.0 {
                    *g = 0.0;
                }
            }
            grad = layer.backward(&pass.activations[i], &grad);
        }

        let nemb = self.nemb;
        for (slot, (&id, &value)) in batch.ids.iter().zip(&batch.values).enumerate() {
            let g_row = &mut self.embedding.grad[id as usize * nemb..(id as usize + 1) * nemb];
            for (g, &d) in g_row.iter_mut().zip(&grad[slot * nemb..(slot + 1) * nemb]) {
                *g += d * value;
            }
        }
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = vec![&mut self.embedding];
        for layer in &mut self.hidden {
            params.extend(layer.params_mut());
        }
        params.extend(self.head.params_mut());
        params
    }

    pub fn zero_grad(&mut self) {
        self.params_mut().into_iter().for_each(Param::zero_grad);
    }

    pub fn step(&mut self, adam: &mut Adam) {
        adam.step += 1;
        for param in self.params_mut() {
            adam.update(param);
        }
    }
}
