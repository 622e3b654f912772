use std::path::PathBuf;
use stemsep_rs::training::{ControllerState, EarlyStoppingController, EpochOutcome, Transition};

fn outcome(epoch: u64, phase: usize, loss: f32) -> EpochOutcome {
    EpochOutcome {
        epoch_index: epoch,
        phase,
        global_step: (epoch + 1) * 2000,
        validation_loss: loss,
        checkpoint_path: PathBuf::from(format!("checkpoints/{}.safetensors", epoch)),
    }
}

/// Feeds `losses` to the controller, tagging each epoch with the phase the
/// controller was in when it ran.
fn drive(controller: &mut EarlyStoppingController, losses: &[f32]) -> Vec<Transition> {
    let start = controller.history().len() as u64;
    losses
        .iter()
        .enumerate()
        .map(|(i, &loss)| {
            let phase = controller.phase().unwrap_or(usize::MAX);
            controller.observe(outcome(start + i as u64, phase, loss))
        })
        .collect()
}

#[test]
fn test_phase_advances_on_twentieth_worse_epoch() {
    let mut controller = EarlyStoppingController::new(2, 20);
    let mut losses = vec![5.0, 4.0];
    losses.extend(std::iter::repeat(4.0).take(20));

    let transitions = drive(&mut controller, &losses);
    assert_eq!(transitions[0], Transition::Improved);
    assert_eq!(transitions[1], Transition::Improved);
    for (i, transition) in transitions[2..21].iter().enumerate() {
        assert_eq!(
            *transition,
            Transition::NotImproved {
                worse_epochs: i + 1
            }
        );
    }
    assert_eq!(transitions[21], Transition::PhaseAdvanced { from: 0, to: 1 });
    assert_eq!(controller.state(), ControllerState::Running { phase: 1 });
    assert_eq!(controller.worse_epochs(), 0);

    // Best result carries into the next phase
    assert_eq!(controller.best_loss(), 4.0);
    assert_eq!(
        controller.best_checkpoint(),
        Some(PathBuf::from("checkpoints/1.safetensors").as_path())
    );
}

#[test]
fn test_improvement_resets_patience() {
    let mut controller = EarlyStoppingController::new(2, 3);
    let transitions = drive(&mut controller, &[3.0, 3.5, 3.5, 2.0, 2.5, 2.5]);
    assert_eq!(transitions[3], Transition::Improved);
    assert_eq!(transitions[5], Transition::NotImproved { worse_epochs: 2 });
    assert_eq!(controller.phase(), Some(0));
}

#[test]
fn test_best_loss_never_increases() {
    let mut controller = EarlyStoppingController::new(3, 2);
    let losses = [9.0, 7.0, 8.0, 6.5, 10.0, f32::NAN, 6.0, 6.0, 6.0, 5.0, 7.0, 7.0];
    let mut previous = f32::INFINITY;
    for (i, &loss) in losses.iter().enumerate() {
        let phase = controller.phase().unwrap_or(0);
        controller.observe(outcome(i as u64, phase, loss));
        assert!(controller.best_loss() <= previous);
        previous = controller.best_loss();
    }
    assert_eq!(controller.best_loss(), 5.0);
}

#[test]
fn test_done_after_final_phase() {
    let mut controller = EarlyStoppingController::new(2, 1);
    let transitions = drive(&mut controller, &[1.0, 1.0, 1.0]);
    assert_eq!(
        transitions,
        vec![
            Transition::Improved,
            Transition::PhaseAdvanced { from: 0, to: 1 },
            Transition::Finished,
        ]
    );
    assert!(controller.is_done());
    assert_eq!(controller.phase(), None);

    let history = controller.history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[1].phase, 0);
    assert_eq!(history[2].phase, 1);
}

#[test]
fn test_resumed_controller_starts_in_given_phase() {
    let controller = EarlyStoppingController::starting_at(2, 5, 1);
    assert_eq!(controller.phase(), Some(1));
    assert_eq!(controller.best_loss(), f32::INFINITY);

    let out_of_range = EarlyStoppingController::starting_at(2, 5, 7);
    assert_eq!(out_of_range.phase(), Some(0));
}

#[test]
fn test_nan_history_survives_save_and_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("controller.json");
    let mut controller = EarlyStoppingController::new(2, 3);
    drive(&mut controller, &[2.0, f32::NAN]);
    controller.save(&path).unwrap();

    let restored = EarlyStoppingController::load(&path).unwrap();
    assert_eq!(restored.worse_epochs(), 1);
    assert_eq!(restored.best_loss(), 2.0);
    assert!(restored.history()[1].validation_loss.is_nan());
}

#[test]
fn test_save_replaces_state_without_leftovers() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("controller.json");
    std::fs::write(&path, b"{ half written").unwrap();

    let mut controller = EarlyStoppingController::new(2, 3);
    drive(&mut controller, &[3.0, 2.0]);
    controller.save(&path).unwrap();

    let restored = EarlyStoppingController::load(&path).unwrap();
    assert_eq!(restored.best_loss(), 2.0);
    assert_eq!(restored.history().len(), 2);
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names, vec![std::ffi::OsString::from("controller.json")]);
}
