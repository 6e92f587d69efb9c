//! The model-runtime boundary the epoch loop drives.
//!
//! The dataset loader and real training backend live outside this
//! workspace; this crate gives the epoch loop something concrete to call
//! against — a [`ModelRuntime`] trait plus [`VecModel`], a flat-`Vec<f32>`
//! stand-in with no real gradient descent, used by default and by every
//! test that doesn't wire in a real training backend. The poisoner hooks
//! live here too since they wrap a training step.

use std::path::Path;

use defl_aggregate::Weights;
use rand_distr::Distribution;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("weights shape mismatch: expected {expected} layers, got {got}")]
    ShapeMismatch { expected: usize, got: usize },
    #[error("checkpoint write failed: {0}")]
    Checkpoint(#[from] std::io::Error),
    #[error("failed to deserialize weights: {0}")]
    Decode(#[from] bincode::Error),
    #[error("poisoner failed: {0}")]
    Poisoner(String),
}

/// The contract the epoch loop needs from an external training backend.
///
/// Everything else about training — dataset loading, optimiser, loss —
/// belongs to that external backend; this trait only exposes the seam
/// the epoch loop must call.
pub trait ModelRuntime {
    /// Current trainable weights, one flattened tensor per layer.
    fn get_weights(&self) -> Weights;

    /// Install `weights` as the model's current trainable weights.
    /// Shape must match the model's own layer count; callers that
    /// violate this get a fatal [`ModelError::ShapeMismatch`].
    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError>;

    /// Run `steps` local optimisation steps against the locally-held
    /// dataset, honoring the active poisoner hook around the update.
    fn local_train(&mut self, steps: u32, poisoner: &dyn Poisoner) -> Result<(), ModelError>;

    /// Serialized form of the current weights for the wire
    /// (`ClientRequest::weights` / `WeightsResponse::w_last` entries).
    fn serialized_weights(&self) -> Result<Vec<u8>, ModelError> {
        Ok(bincode::serialize(&self.get_weights()).expect("Vec<Tensor> is always serializable"))
    }

    /// Decode a peer's serialized weights into the in-memory form the
    /// aggregator consumes.
    fn decode_weights(&self, bytes: &[u8]) -> Result<Weights, ModelError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Persist a checkpoint to `path`. Called every `save_freq` rounds
    /// when checkpointing is enabled.
    fn checkpoint(&self, path: &Path) -> Result<(), ModelError>;

    /// Whether the dataset loader should apply the label-flip transform
    /// (`attack = "label"`). This model runtime boundary has no
    /// training-path effect from the flag itself — it is informational
    /// plumbing for the external loader.
    fn label_flip_hint(&self) -> bool {
        false
    }
}

/// Reference `ModelRuntime`: plain `Vec<f32>` tensors, local "training"
/// is a fixed small perturbation rather than real gradient descent.
/// Used as the default runtime and by every test in this workspace.
pub struct VecModel {
    weights: Weights,
    label_flip: bool,
}

impl VecModel {
    pub fn new(init_weights: Weights) -> Self {
        Self {
            weights: init_weights,
            label_flip: false,
        }
    }

    pub fn with_label_flip(mut self, label_flip: bool) -> Self {
        self.label_flip = label_flip;
        self
    }
}

impl ModelRuntime for VecModel {
    fn get_weights(&self) -> Weights {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: Weights) -> Result<(), ModelError> {
        if weights.len() != self.weights.len() {
            return Err(ModelError::ShapeMismatch {
                expected: self.weights.len(),
                got: weights.len(),
            });
        }
        self.weights = weights;
        Ok(())
    }

    fn local_train(&mut self, steps: u32, poisoner: &dyn Poisoner) -> Result<(), ModelError> {
        tracing::debug!(steps, "local training");
        let before = self.weights.clone();
        // Stand-in "training": nudge every element toward zero by a tiny
        // fixed step per requested local-train step. Not a real learner —
        // the external model runtime owns that; this only needs to produce
        // a deterministic, non-trivial delta for the poisoner to wrap.
        const STEP: f32 = 1e-3;
        for _ in 0..steps {
            for layer in &mut self.weights {
                for w in layer.iter_mut() {
                    *w -= STEP * w.signum();
                }
            }
        }
        let after = self.weights.clone();
        let mut delta: Weights = after
            .iter()
            .zip(&before)
            .map(|(a, b)| a.iter().zip(b).map(|(x, y)| x - y).collect())
            .collect();
        poisoner
            .poison(&mut delta)
            .map_err(ModelError::Poisoner)?;
        self.weights = before
            .iter()
            .zip(&delta)
            .map(|(b, d)| b.iter().zip(d).map(|(x, y)| x + y).collect())
            .collect();
        Ok(())
    }

    fn checkpoint(&self, path: &Path) -> Result<(), ModelError> {
        let bytes = bincode::serialize(&self.weights).expect("Vec<Tensor> is always serializable");
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn label_flip_hint(&self) -> bool {
        self.label_flip
    }
}

/// Pre/post hook wrapped around a training step: capture weights before,
/// capture after, compute the delta, apply the transform, install
/// `before + delta'`. This trait is the transform itself;
/// `VecModel::local_train` does the capture/install.
pub trait Poisoner: Send + Sync {
    /// Perturb `delta` (one tensor per layer) in place.
    fn poison(&self, delta: &mut Weights) -> Result<(), String>;
}

/// Identity hook — leaves the delta untouched. Default when
/// `attack = "none"`.
pub struct NoPoisoner;

impl Poisoner for NoPoisoner {
    fn poison(&self, _delta: &mut Weights) -> Result<(), String> {
        Ok(())
    }
}

/// Adds `N(0, sigma^2)` noise to every element of the delta.
pub struct GaussianNoise {
    pub sigma: f32,
}

impl Poisoner for GaussianNoise {
    fn poison(&self, delta: &mut Weights) -> Result<(), String> {
        if self.sigma < 0.0 {
            return Err(format!("gaussian sigma must be >= 0, got {}", self.sigma));
        }
        let normal = rand_distr::Normal::new(0.0f32, self.sigma)
            .map_err(|e| format!("invalid gaussian distribution: {e}"))?;
        let mut rng = rand::thread_rng();
        for layer in delta.iter_mut() {
            for w in layer.iter_mut() {
                *w += normal.sample(&mut rng);
            }
        }
        Ok(())
    }
}

/// Multiplies the whole delta by a (typically negative) scalar.
pub struct SignFlip {
    pub rho: f32,
}

impl Poisoner for SignFlip {
    fn poison(&self, delta: &mut Weights) -> Result<(), String> {
        for layer in delta.iter_mut() {
            for w in layer.iter_mut() {
                *w *= self.rho;
            }
        }
        Ok(())
    }
}

/// Replaces every element of the delta with a fixed value.
pub struct SameValue {
    pub value: f32,
}

impl Poisoner for SameValue {
    fn poison(&self, delta: &mut Weights) -> Result<(), String> {
        for layer in delta.iter_mut() {
            for w in layer.iter_mut() {
                *w = self.value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(values: &[f32]) -> Weights {
        vec![values.to_vec()]
    }

    #[test]
    fn no_poisoner_leaves_delta_untouched() {
        let mut with_hook = w(&[0.1, -0.2, 0.3]);
        let mut without_hook = with_hook.clone();
        NoPoisoner.poison(&mut with_hook).unwrap();
        assert_eq!(with_hook, without_hook);

        // Run it through local_train both ways and confirm bit-identical
        // output — testable property 7.
        let mut model_a = VecModel::new(w(&[1.0, 2.0, 3.0]));
        let mut model_b = VecModel::new(w(&[1.0, 2.0, 3.0]));
        model_a.local_train(3, &NoPoisoner).unwrap();
        model_b.local_train(3, &NoPoisoner).unwrap();
        assert_eq!(model_a.get_weights(), model_b.get_weights());
        assert_eq!(with_hook, without_hook);
    }

    #[test]
    fn sign_flip_negates_and_scales() {
        let mut delta = w(&[1.0, -2.0, 4.0]);
        SignFlip { rho: -1.0 }.poison(&mut delta).unwrap();
        assert_eq!(delta, w(&[-1.0, 2.0, -4.0]));
    }

    #[test]
    fn same_value_replaces_every_element() {
        let mut delta = w(&[1.0, -2.0, 4.0]);
        SameValue { value: 9.0 }.poison(&mut delta).unwrap();
        assert_eq!(delta, w(&[9.0, 9.0, 9.0]));
    }

    #[test]
    fn gaussian_noise_perturbs_but_preserves_shape() {
        let mut delta = w(&[0.0, 0.0, 0.0]);
        GaussianNoise { sigma: 1.0 }.poison(&mut delta).unwrap();
        assert_eq!(delta[0].len(), 3);
    }

    #[test]
    fn set_weights_rejects_layer_count_mismatch() {
        let mut model = VecModel::new(w(&[1.0, 2.0]));
        let err = model.set_weights(vec![vec![1.0], vec![2.0]]).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { expected: 1, got: 2 }));
    }

    #[test]
    fn serialized_weights_round_trip_through_decode() {
        let model = VecModel::new(w(&[1.0, 2.0, 3.0]));
        let bytes = model.serialized_weights().unwrap();
        let decoded = model.decode_weights(&bytes).unwrap();
        assert_eq!(decoded, w(&[1.0, 2.0, 3.0]));
    }

    #[test]
    fn checkpoint_writes_decodable_bytes() {
        let model = VecModel::new(w(&[1.0, 2.0]));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.bin");
        model.checkpoint(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let decoded: Weights = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, w(&[1.0, 2.0]));
    }

    #[test]
    fn label_flip_hint_reflects_config() {
        let model = VecModel::new(w(&[1.0])).with_label_flip(true);
        assert!(model.label_flip_hint());
        let model = VecModel::new(w(&[1.0]));
        assert!(!model.label_flip_hint());
    }
}
