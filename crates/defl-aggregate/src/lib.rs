//! Robust aggregation over a bag of peer weight vectors.
//!
//! `Aggregator` buffers one flattened tensor list per peer (`add`), then
//! reduces the bag to a single aggregate delta (`aggregate`) according to
//! the configured [`AggregatorKind`]. The buffer is indexed `[layer][peer]`
//! rather than `[peer][layer]` so each variant can reduce one layer's
//! column of peer values at a time without re-grouping.

use thiserror::Error;

/// One model layer's weights, flattened to a single real vector.
pub type Tensor = Vec<f32>;
/// An ordered list of tensors — the wire-level "weights vector" `W`.
pub type Weights = Vec<Tensor>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("peer weights have {got} layers, expected {expected}")]
    LayerCountMismatch { expected: usize, got: usize },
    #[error("layer {layer} has {got} elements, expected {expected}")]
    LayerShapeMismatch {
        layer: usize,
        expected: usize,
        got: usize,
    },
    #[error("aggregate() called with an empty buffer")]
    EmptyBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorKind {
    /// Element-wise arithmetic mean across peers (FedAvg).
    Mean,
    /// Element-wise coordinate-wise median.
    Median,
    /// Element-wise mean after dropping the extreme values per coordinate.
    TrimmedMean,
    /// (Multi-)Krum. `m == 1` is plain Krum.
    MultiKrum { m: usize },
}

/// Stateful peer-weights buffer plus the configured reduction.
pub struct Aggregator {
    kind: AggregatorKind,
    /// `buffer[layer][peer]`.
    buffer: Vec<Vec<Tensor>>,
    num_peers: usize,
}

impl Aggregator {
    pub fn new(kind: AggregatorKind) -> Self {
        Self {
            kind,
            buffer: Vec::new(),
            num_peers: 0,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.num_peers = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.num_peers == 0
    }

    /// Append one peer's weights. The shape (layer count and per-layer
    /// element count) must match every prior call since the last `clear`.
    pub fn add(&mut self, weights: &Weights) -> Result<(), AggregateError> {
        if self.buffer.is_empty() {
            self.buffer = vec![Vec::new(); weights.len()];
        } else if weights.len() != self.buffer.len() {
            return Err(AggregateError::LayerCountMismatch {
                expected: self.buffer.len(),
                got: weights.len(),
            });
        }
        for (layer_idx, tensor) in weights.iter().enumerate() {
            if let Some(first) = self.buffer[layer_idx].first() {
                if first.len() != tensor.len() {
                    return Err(AggregateError::LayerShapeMismatch {
                        layer: layer_idx,
                        expected: first.len(),
                        got: tensor.len(),
                    });
                }
            }
        }
        for (layer_idx, tensor) in weights.iter().enumerate() {
            self.buffer[layer_idx].push(tensor.clone());
        }
        self.num_peers += 1;
        Ok(())
    }

    /// Reduce the buffered peer weights to a single aggregate delta for
    /// the declared number of Byzantine peers `f`, then clear the buffer.
    pub fn aggregate(&mut self, num_byzantine: usize) -> Result<Weights, AggregateError> {
        if self.num_peers == 0 {
            return Err(AggregateError::EmptyBuffer);
        }
        let result = match self.kind {
            AggregatorKind::Mean => mean(&self.buffer),
            AggregatorKind::Median => median(&self.buffer),
            AggregatorKind::TrimmedMean => trimmed_mean(&self.buffer, num_byzantine),
            AggregatorKind::MultiKrum { m } => multi_krum(&self.buffer, num_byzantine, m),
        };
        self.clear();
        Ok(result)
    }
}

fn mean(buffer: &[Vec<Tensor>]) -> Weights {
    buffer
        .iter()
        .map(|layer| {
            let n = layer.len() as f32;
            let width = layer[0].len();
            (0..width)
                .map(|i| layer.iter().map(|peer| peer[i]).sum::<f32>() / n)
                .collect()
        })
        .collect()
}

fn median(buffer: &[Vec<Tensor>]) -> Weights {
    buffer
        .iter()
        .map(|layer| {
            let width = layer[0].len();
            (0..width)
                .map(|i| {
                    let mut col: Vec<f32> = layer.iter().map(|peer| peer[i]).collect();
                    col.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    median_of_sorted(&col)
                })
                .collect()
        })
        .collect()
}

fn median_of_sorted(sorted: &[f32]) -> f32 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

fn trimmed_mean(buffer: &[Vec<Tensor>], num_byzantine: usize) -> Weights {
    let num_clients = buffer[0].len();
    let beta = num_byzantine as f64 / num_clients as f64;
    let exclusions = (2.0 * beta * num_clients as f64).round() as usize;
    let low = exclusions / 2;
    let mut high = num_clients - (exclusions / 2 + exclusions % 2);
    if low == high {
        high = std::cmp::min(num_clients, high + 1);
    }

    buffer
        .iter()
        .map(|layer| {
            let width = layer[0].len();
            (0..width)
                .map(|i| {
                    let mut col: Vec<f32> = layer.iter().map(|peer| peer[i]).collect();
                    col.sort_by(|a, b| a.partial_cmp(b).unwrap());
                    let survivors = &col[low..high];
                    survivors.iter().sum::<f32>() / survivors.len() as f32
                })
                .collect()
        })
        .collect()
}

fn multi_krum(buffer: &[Vec<Tensor>], num_byzantine: usize, m: usize) -> Weights {
    let num_clients = buffer[0].len();
    let k = std::cmp::max(1, num_clients.saturating_sub(num_byzantine).saturating_sub(2));

    let flattened: Vec<Vec<f32>> = (0..num_clients)
        .map(|peer| {
            buffer
                .iter()
                .flat_map(|layer| layer[peer].iter().copied())
                .collect()
        })
        .collect();

    let mut distances = vec![vec![0.0f32; num_clients]; num_clients];
    for i in 0..num_clients {
        for j in (i + 1)..num_clients {
            let d: f32 = flattened[i]
                .iter()
                .zip(&flattened[j])
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            distances[i][j] = d;
            distances[j][i] = d;
        }
    }

    let scores: Vec<f32> = (0..num_clients)
        .map(|client| {
            let mut col: Vec<f32> = (0..num_clients).map(|other| distances[other][client]).collect();
            col.sort_by(|a, b| a.partial_cmp(b).unwrap());
            col[..=k.min(num_clients - 1)].iter().sum()
        })
        .collect();

    let mut order: Vec<usize> = (0..num_clients).collect();
    order.sort_by(|&a, &b| scores[a].partial_cmp(&scores[b]).unwrap().then(a.cmp(&b)));
    let chosen = &order[..m.min(num_clients)];

    buffer
        .iter()
        .map(|layer| {
            let width = layer[0].len();
            (0..width)
                .map(|i| chosen.iter().map(|&peer| layer[peer][i]).sum::<f32>() / chosen.len() as f32)
                .collect()
        })
        .collect()
}
