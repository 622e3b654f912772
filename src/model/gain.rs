//! Baseline separator: a learned gain and bias per source applied to the
//! centre of the mixture window.

use crate::config::{Config, RecordLayout};
use crate::model::{ParamMap, ParamTensor, SeparatorModel};
use crate::tensor::Tensor;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const GAIN: &str = "separator.gain";
pub const BIAS: &str = "separator.bias";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainSeparatorConfig {
    /// Starting gain; `1 / num_sources` when unset
    pub init_gain: Option<f32>,
    pub init_jitter: f32,
}

impl Default for GainSeparatorConfig {
    fn default() -> Self {
        Self {
            init_gain: None,
            init_jitter: 0.01,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GainSeparator {
    layout: RecordLayout,
    config: GainSeparatorConfig,
}

impl GainSeparator {
    pub fn new(layout: RecordLayout, config: GainSeparatorConfig) -> Self {
        Self { layout, config }
    }

    /// Build from the run configuration; the `model` section is optional.
    pub fn from_config(config: &Config) -> Result<Self> {
        let model_config = if config.model.is_null() {
            GainSeparatorConfig::default()
        } else {
            serde_json::from_value(config.model.clone())
                .context("Invalid model section for the gain separator")?
        };
        Ok(Self::new(config.data.layout(), model_config))
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    fn crop_offset(&self) -> usize {
        self.layout.mix_len.saturating_sub(self.layout.num_samples) / 2
    }

    fn batch_of(&self, mixture: &Tensor) -> Result<usize> {
        if self.layout.mix_len < self.layout.num_samples {
            anyhow::bail!(
                "mixture window {} is shorter than the {} source samples",
                self.layout.mix_len,
                self.layout.num_samples
            );
        }
        let expected = self.layout.mixture_shape();
        let shape = mixture.shape();
        if shape.len() != 3 || shape[1..] != expected[..] {
            anyhow::bail!(
                "mixture has shape {:?}, expected [B, {}, {}]",
                shape,
                expected[0],
                expected[1]
            );
        }
        Ok(shape[0])
    }

    /// Centre crop of row `b` of a flattened `[B, P, C]` mixture.
    fn window<'a>(&self, x: &'a [f32], b: usize) -> Result<&'a [f32]> {
        let RecordLayout {
            mix_len,
            num_samples,
            channels,
            ..
        } = self.layout;
        let start = (b * mix_len + self.crop_offset()) * channels;
        x.get(start..start + num_samples * channels)
            .with_context(|| format!("mixture row {} is too short for the source window", b))
    }

    fn param<'a>(&self, params: &'a ParamMap, name: &str) -> Result<&'a [f32]> {
        let param = params
            .get(name)
            .with_context(|| format!("Missing parameter {}", name))?;
        if param.len() != self.layout.num_sources {
            anyhow::bail!(
                "Parameter {} has {} values, expected {}",
                name,
                param.len(),
                self.layout.num_sources
            );
        }
        Ok(&param.data)
    }
}

impl SeparatorModel for GainSeparator {
    fn num_sources(&self) -> usize {
        self.layout.num_sources
    }

    fn init_parameters(&self, seed: u64) -> ParamMap {
        let sources = self.layout.num_sources;
        let base = self
            .config
            .init_gain
            .unwrap_or(1.0 / sources.max(1) as f32);
        let jitter = self.config.init_jitter.abs();
        let mut rng = StdRng::seed_from_u64(seed);

        let gain: Vec<f32> = (0..sources)
            .map(|_| {
                if jitter > 0.0 {
                    base + rng.gen_range(-jitter..jitter)
                } else {
                    base
                }
            })
            .collect();

        let mut params = ParamMap::new();
        params.insert(
            GAIN.to_string(),
            ParamTensor {
                data: gain,
                shape: vec![sources],
            },
        );
        params.insert(
            BIAS.to_string(),
            ParamTensor {
                data: vec![0.0; sources],
                shape: vec![sources],
            },
        );
        params
    }

    fn predict(&self, params: &ParamMap, mixture: &Tensor, _training: bool) -> Result<Vec<Tensor>> {
        let batch = self.batch_of(mixture)?;
        let gain = self.param(params, GAIN)?;
        let bias = self.param(params, BIAS)?;
        let RecordLayout {
            num_samples,
            channels,
            ..
        } = self.layout;
        let inner = num_samples * channels;
        let x = mixture.to_f32_vec();

        gain.iter()
            .zip(bias)
            .map(|(g, c)| {
                let mut out = Vec::with_capacity(batch * inner);
                for b in 0..batch {
                    out.extend(self.window(&x, b)?.iter().map(|v| g * v + c));
                }
                Ok(Tensor::from_f32(out, vec![batch, num_samples, channels])?)
            })
            .collect()
    }

    fn backward(
        &self,
        params: &ParamMap,
        mixture: &Tensor,
        output_grads: &[Vec<f32>],
    ) -> Result<ParamMap> {
        let batch = self.batch_of(mixture)?;
        let RecordLayout {
            num_sources,
            num_samples,
            channels,
            ..
        } = self.layout;
        let inner = num_samples * channels;
        if output_grads.len() != num_sources {
            anyhow::bail!(
                "Got {} output gradients for {} sources",
                output_grads.len(),
                num_sources
            );
        }
        // Validates presence and size of both parameters.
        self.param(params, GAIN)?;
        self.param(params, BIAS)?;

        let x = mixture.to_f32_vec();
        let mut d_gain = vec![0.0f32; num_sources];
        let mut d_bias = vec![0.0f32; num_sources];

        for (s, grad) in output_grads.iter().enumerate() {
            if grad.len() != batch * inner {
                anyhow::bail!(
                    "Output gradient for source {} has {} values, expected {}",
                    s,
                    grad.len(),
                    batch * inner
                );
            }
            for b in 0..batch {
                let window = self.window(&x, b)?;
                for (g, v) in grad[b * inner..][..inner].iter().zip(window) {
                    d_gain[s] += g * v;
                    d_bias[s] += g;
                }
            }
        }

        let mut grads = ParamMap::new();
        grads.insert(GAIN.to_string(), ParamTensor::new(d_gain, vec![num_sources])?);
        grads.insert(BIAS.to_string(), ParamTensor::new(d_bias, vec![num_sources])?);
        Ok(grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::separation_loss::separation_loss_with_grad;
    use approx::assert_abs_diff_eq;

    fn layout() -> RecordLayout {
        RecordLayout {
            mix_len: 8,
            num_sources: 2,
            num_samples: 4,
            channels: 1,
            sample_rate: 22050,
        }
    }

    fn model() -> GainSeparator {
        GainSeparator::new(
            layout(),
            GainSeparatorConfig {
                init_gain: Some(0.5),
                init_jitter: 0.0,
            },
        )
    }

    fn mixture(batch: usize) -> Tensor {
        let values = (0..batch * 8).map(|i| i as f32 * 0.1).collect();
        Tensor::from_f32(values, vec![batch, 8, 1]).unwrap()
    }

    #[test]
    fn test_predict_crops_centre_window() {
        let model = model();
        let params = model.init_parameters(0);
        let out = model.predict(&params, &mixture(2), false).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].shape(), &[2, 4, 1]);
        // offset (8 - 4) / 2 = 2, gain 0.5
        let first = out[0].as_f32().unwrap();
        assert_abs_diff_eq!(first[0], 0.1, epsilon = 1e-6);
        // second batch row starts at mixture index 8 + 2
        assert_abs_diff_eq!(first[4], 0.5, epsilon = 1e-6);
        assert_eq!(out[1].as_f32().unwrap(), first);
    }

    #[test]
    fn test_rejects_wrong_mixture_length() {
        let model = model();
        let params = model.init_parameters(0);
        let short = Tensor::from_f32(vec![0.0; 6], vec![1, 6, 1]).unwrap();
        assert!(model.predict(&params, &short, false).is_err());
    }

    #[test]
    fn test_window_longer_than_mixture_is_an_error() {
        let short_mix = RecordLayout {
            mix_len: 2,
            num_samples: 3,
            ..layout()
        };
        let model = GainSeparator::new(short_mix, GainSeparatorConfig::default());
        let params = model.init_parameters(0);
        let mixture = Tensor::from_f32(vec![0.5; 4], vec![2, 2, 1]).unwrap();
        assert!(model.predict(&params, &mixture, true).is_err());
        assert!(model
            .backward(&params, &mixture, &[vec![0.0; 6], vec![0.0; 6]])
            .is_err());
    }

    #[test]
    fn test_init_is_seeded() {
        let model = GainSeparator::new(layout(), GainSeparatorConfig::default());
        assert_eq!(model.init_parameters(7), model.init_parameters(7));
        assert_ne!(model.init_parameters(7), model.init_parameters(8));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let model = model();
        let params = model.init_parameters(0);
        let mix = mixture(2);
        let target = Tensor::from_f32(vec![0.3; 16], vec![2, 2, 4, 1]).unwrap();

        let loss_at = |p: &ParamMap| {
            let est = model.predict(p, &mix, true).unwrap();
            separation_loss_with_grad(&est, &target).unwrap()
        };
        let base = loss_at(&params);
        let grads = model.backward(&params, &mix, &base.grads).unwrap();

        let eps = 1e-3;
        for name in [GAIN, BIAS] {
            let mut bumped = params.clone();
            bumped.get_mut(name).unwrap().data[1] += eps;
            let numeric = (loss_at(&bumped).loss - base.loss) / eps;
            assert_abs_diff_eq!(grads[name].data[1], numeric, epsilon = 1e-2);
        }
    }
}
