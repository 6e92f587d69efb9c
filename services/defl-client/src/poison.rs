//! Maps the configured `attack` onto a [`Poisoner`] hook.

use defl_model::{GaussianNoise, NoPoisoner, Poisoner, SameValue, SignFlip};

use crate::config::{Attack, ClientConfig};

/// Builds the poisoner hook named by `config.attack`. `Attack::Label` is
/// not a weight-poisoning hook at all — it's plumbed through as
/// `ModelRuntime::label_flip_hint` instead, so it gets the identity hook
/// here.
pub fn from_config(config: &ClientConfig) -> Box<dyn Poisoner> {
    match config.attack {
        Attack::None | Attack::Label => Box::new(NoPoisoner),
        Attack::Gaussian => Box::new(GaussianNoise {
            sigma: config.gaussian_attack_factor.expect("validated at config load"),
        }),
        Attack::Sign => Box::new(SignFlip {
            rho: config.signflip_attack_factor.expect("validated at config load"),
        }),
    }
}

/// `SameValue` isn't reachable from configuration — the `attack` enum has
/// no corresponding value — but it's kept constructible for direct use
/// by adversary-simulation callers and tests.
pub fn same_value(value: f32) -> Box<dyn Poisoner> {
    Box::new(SameValue { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Task;
    use defl_aggregate::AggregatorKind;
    use std::collections::HashMap;

    fn base_config() -> ClientConfig {
        ClientConfig {
            server_host: "127.0.0.1".into(),
            consensus_port: 1,
            obsido_port: 2,
            task: Task::Cifar10,
            batch_size: 1,
            local_train_steps: 1,
            aggregator: AggregatorKind::Mean,
            num_byzantine: 0,
            attack: Attack::None,
            gaussian_attack_factor: None,
            signflip_attack_factor: None,
            fetch_ms: 1,
            gst_ms: 1,
            save_freq: 0,
            init_model_path: None,
            data_config: serde_json::Value::Null,
            env: HashMap::new(),
            client_name: None,
        }
    }

    #[test]
    fn none_attack_yields_identity_hook() {
        let mut delta = vec![vec![1.0, 2.0]];
        let before = delta.clone();
        from_config(&base_config()).poison(&mut delta).unwrap();
        assert_eq!(delta, before);
    }

    #[test]
    fn gaussian_attack_requires_factor_to_build() {
        let mut cfg = base_config();
        cfg.attack = Attack::Gaussian;
        cfg.gaussian_attack_factor = Some(0.5);
        let mut delta = vec![vec![0.0, 0.0]];
        from_config(&cfg).poison(&mut delta).unwrap();
    }

    #[test]
    fn sign_attack_flips_sign() {
        let mut cfg = base_config();
        cfg.attack = Attack::Sign;
        cfg.signflip_attack_factor = Some(-4.0);
        let mut delta = vec![vec![1.0, 2.0]];
        from_config(&cfg).poison(&mut delta).unwrap();
        assert_eq!(delta, vec![vec![-4.0, -8.0]]);
    }

    #[test]
    fn label_attack_yields_identity_hook_for_weights() {
        let mut cfg = base_config();
        cfg.attack = Attack::Label;
        let mut delta = vec![vec![1.0]];
        from_config(&cfg).poison(&mut delta).unwrap();
        assert_eq!(delta, vec![vec![1.0]]);
    }
}
