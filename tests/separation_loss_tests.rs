use approx::assert_relative_eq;
use stemsep_rs::separation_loss::{per_source_mse, SeparationLossError};
use stemsep_rs::tensor::Tensor;
use stemsep_rs::{separation_loss, separation_loss_with_grad};

/// `[2, 3, 4, 1]` references with distinct values per source
fn references() -> Tensor {
    let values = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
    Tensor::from_f32(values, vec![2, 3, 4, 1]).unwrap()
}

/// Per-source estimates offset from the references by `offsets[s]`
fn estimates_with_offsets(offsets: &[f32]) -> Vec<Tensor> {
    let reference = references().to_f32_vec();
    offsets
        .iter()
        .enumerate()
        .map(|(s, offset)| {
            let mut values = Vec::with_capacity(8);
            for b in 0..2 {
                let start = (b * 3 + s) * 4;
                values.extend(reference[start..start + 4].iter().map(|v| v + offset));
            }
            Tensor::from_f32(values, vec![2, 4, 1]).unwrap()
        })
        .collect()
}

#[test]
fn test_constant_offsets_give_squared_offsets() {
    let estimates = estimates_with_offsets(&[0.0, 0.5, 2.0]);
    let per_source = per_source_mse(&estimates, &references()).unwrap();
    assert_relative_eq!(per_source[0], 0.0);
    assert_relative_eq!(per_source[1], 0.25, epsilon = 1e-6);
    assert_relative_eq!(per_source[2], 4.0, epsilon = 1e-5);

    let loss = separation_loss(&estimates, &references()).unwrap();
    assert_relative_eq!(loss, (0.0 + 0.25 + 4.0) / 3.0, epsilon = 1e-5);
}

#[test]
fn test_loss_is_non_negative_and_finite() {
    for offsets in [[0.0, 0.0, 0.0], [-1.0, 3.0, 0.1], [1e3, -1e3, 7.0]] {
        let loss = separation_loss(&estimates_with_offsets(&offsets), &references()).unwrap();
        assert!(loss.is_finite());
        assert!(loss >= 0.0);
    }
}

#[test]
fn test_gradient_matches_finite_difference() {
    let estimates = estimates_with_offsets(&[0.3, -0.2, 0.7]);
    let sources = references();
    let analytic = separation_loss_with_grad(&estimates, &sources).unwrap();

    let h = 1e-2f32;
    for (s, index) in [(0usize, 0usize), (1, 5), (2, 7)] {
        let nudge = |delta: f32| {
            let mut moved = estimates.clone();
            let mut values = moved[s].to_f32_vec();
            values[index] += delta;
            moved[s] = Tensor::from_f32(values, vec![2, 4, 1]).unwrap();
            separation_loss(&moved, &sources).unwrap()
        };
        let numeric = (nudge(h) - nudge(-h)) / (2.0 * h);
        assert_relative_eq!(analytic.grads[s][index], numeric, epsilon = 1e-3);
    }
}

#[test]
fn test_mismatched_inputs_are_rejected() {
    let sources = references();

    let two = estimates_with_offsets(&[0.0, 0.0]);
    assert_eq!(
        separation_loss(&two, &sources),
        Err(SeparationLossError::SourceCountMismatch {
            estimates: 2,
            sources: 3
        })
    );

    let mut wrong_length = estimates_with_offsets(&[0.0, 0.0, 0.0]);
    wrong_length[1] = Tensor::zeros(vec![2, 5, 1]);
    assert!(matches!(
        separation_loss(&wrong_length, &sources),
        Err(SeparationLossError::ShapeMismatch { source_index: 1, .. })
    ));

    let flat = Tensor::zeros(vec![24]);
    assert_eq!(
        separation_loss(&[], &flat),
        Err(SeparationLossError::InvalidRank(1))
    );
}
