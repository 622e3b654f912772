//! Adam, applied to flat f32 parameters

use crate::config::TrainingConfig;
use crate::model::{ParamMap, ParamTensor};
use crate::training::state::AdamState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Adam {
    pub fn from_config(config: &TrainingConfig, learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            epsilon: config.adam_epsilon,
        }
    }

    /// Checks that `grads` matches `params` name for name and length for
    /// length. Returns the first offending parameter name.
    pub fn check_compatible(&self, params: &ParamMap, grads: &ParamMap) -> Result<(), String> {
        if params.len() != grads.len() {
            return Err(format!(
                "{} gradients for {} parameters",
                grads.len(),
                params.len()
            ));
        }
        for (name, param) in params {
            match grads.get(name) {
                Some(grad) if grad.shape == param.shape => {}
                Some(grad) => {
                    return Err(format!(
                        "{}: gradient shape {:?}, parameter shape {:?}",
                        name, grad.shape, param.shape
                    ))
                }
                None => return Err(format!("{}: missing gradient", name)),
            }
        }
        Ok(())
    }

    /// One bias-corrected update. `grads` must already have passed
    /// [`Adam::check_compatible`].
    pub fn apply(&self, params: &mut ParamMap, state: &mut AdamState, grads: &ParamMap) {
        state.step += 1;
        let t = state.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        for (name, param) in params.iter_mut() {
            let Some(grad) = grads.get(name) else {
                continue;
            };
            let m = moment(&mut state.exp_avg, name, param);
            let v = moment(&mut state.exp_avg_sq, name, param);

            for i in 0..param.data.len() {
                let g = grad.data[i];
                m.data[i] = self.beta1 * m.data[i] + (1.0 - self.beta1) * g;
                v.data[i] = self.beta2 * v.data[i] + (1.0 - self.beta2) * g * g;

                let m_hat = m.data[i] / bias_correction1;
                let v_hat = v.data[i] / bias_correction2;
                param.data[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }
}

/// Moment buffer for `name`, reset to zeros if absent or mis-sized.
fn moment<'a>(moments: &'a mut ParamMap, name: &str, param: &ParamTensor) -> &'a mut ParamTensor {
    let entry = moments
        .entry(name.to_string())
        .or_insert_with(|| ParamTensor::zeros_like(param));
    if entry.data.len() != param.data.len() {
        *entry = ParamTensor::zeros_like(param);
    }
    entry
}
