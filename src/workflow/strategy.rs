use crate::locator::TargetRef;
use crate::workflow::{ResolvedStep, StepAction};

/// Execution tiers decide whether a step needs capture, location and
/// verification. Deterministic steps run back-to-back without screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecTier {
    /// Run, no capture, no verification (launch_app, call, open_url,
    /// go_home, wait, most key presses).
    FireAndForget,
    /// Small delay only (swipe).
    QuickVerify,
    /// Capture + pixel locate + action (tap/input with a reference image).
    LocateAndExecute,
    /// Capture + remote-model locate and verification (dynamic targets).
    FullAi,
}

/// How the outcome of a step is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyTier {
    Skip,
    /// Only check that no error dialog appeared.
    Lenient,
    /// Capture and expect the screen to have changed / match expectation.
    Standard,
    /// Reference-match or model-verified predicate from the step itself.
    Precise,
}

#[derive(Debug, Clone, Copy)]
pub struct StepStrategy {
    pub tier: ExecTier,
    pub need_capture: bool,
    pub verify: VerifyTier,
    pub wait_after_ms: u64,
}

/// Actions that execute deterministically through the shell bridge.
pub fn is_fire_and_forget(action: StepAction) -> bool {
    matches!(
        action,
        StepAction::LaunchApp
            | StepAction::Call
            | StepAction::OpenUrl
            | StepAction::GoHome
            | StepAction::Wait
            | StepAction::PressKey
            | StepAction::Keyevent
    )
}

pub fn step_strategy(step: &ResolvedStep) -> StepStrategy {
    let dynamic_target = matches!(step.target, Some(TargetRef::ByDescription(_)));
    let has_precise = step.params.contains_key("verify_ref")
        || step.params.contains_key("success_condition");

    if is_fire_and_forget(step.action) {
        let wait_after_ms = match step.action {
            StepAction::LaunchApp => 500,
            StepAction::OpenUrl => 2500,
            StepAction::Call => 1000,
            StepAction::GoHome => 300,
            _ => 100,
        };
        let verify = if has_precise {
            VerifyTier::Precise
        } else if matches!(
            step.action,
            StepAction::LaunchApp | StepAction::OpenUrl | StepAction::Call
        ) {
            VerifyTier::Lenient
        } else {
            VerifyTier::Skip
        };
        return StepStrategy {
            tier: ExecTier::FireAndForget,
            need_capture: false,
            verify,
            wait_after_ms,
        };
    }

    match step.action {
        StepAction::Swipe => StepStrategy {
            tier: ExecTier::QuickVerify,
            need_capture: false,
            verify: if has_precise {
                VerifyTier::Precise
            } else {
                VerifyTier::Standard
            },
            wait_after_ms: 200,
        },
        StepAction::Tap | StepAction::LongPress | StepAction::InputText | StepAction::InputUrl
        | StepAction::FindOrSearch => {
            if dynamic_target {
                StepStrategy {
                    tier: ExecTier::FullAi,
                    need_capture: true,
                    verify: if has_precise {
                        VerifyTier::Precise
                    } else {
                        VerifyTier::Standard
                    },
                    wait_after_ms: 1000,
                }
            } else {
                StepStrategy {
                    tier: ExecTier::LocateAndExecute,
                    need_capture: true,
                    verify: if has_precise {
                        VerifyTier::Precise
                    } else {
                        VerifyTier::Standard
                    },
                    wait_after_ms: 300,
                }
            }
        }
        // Control steps carry their own capture/verification logic.
        _ => StepStrategy {
            tier: ExecTier::QuickVerify,
            need_capture: false,
            verify: VerifyTier::Skip,
            wait_after_ms: 100,
        },
    }
}

/// Group consecutive fire-and-forget steps so the executor runs each batch
/// back-to-back with zero screenshots in between. Author order is kept.
pub fn batch_indices(actions: &[StepAction]) -> Vec<Vec<usize>> {
    let mut batches: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for (i, action) in actions.iter().enumerate() {
        if is_fire_and_forget(*action) {
            current.push(i);
        } else {
            if !current.is_empty() {
                batches.push(std::mem::take(&mut current));
            }
            batches.push(vec![i]);
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NavStep, Params};

    fn resolved(step: NavStep) -> ResolvedStep {
        step.resolve(&Params::new()).unwrap()
    }

    #[test]
    fn reference_tap_locates_without_ai() {
        let s = step_strategy(&resolved(NavStep::tap("wechat_chat_send", "tap send")));
        assert_eq!(s.tier, ExecTier::LocateAndExecute);
        assert!(s.need_capture);
        assert_eq!(s.verify, VerifyTier::Standard);
    }

    #[test]
    fn dynamic_tap_is_full_ai() {
        let s = step_strategy(&resolved(NavStep::tap("dynamic:取消按钮", "tap cancel")));
        assert_eq!(s.tier, ExecTier::FullAi);
        assert!(s.wait_after_ms >= 1000);
    }

    #[test]
    fn wait_and_keys_skip_verification() {
        let s = step_strategy(&resolved(NavStep::wait(500, "wait")));
        assert_eq!(s.tier, ExecTier::FireAndForget);
        assert_eq!(s.verify, VerifyTier::Skip);
        assert!(!s.need_capture);

        let s = step_strategy(&resolved(NavStep::press_key(4, "back")));
        assert_eq!(s.verify, VerifyTier::Skip);
    }

    #[test]
    fn launch_gets_lenient_verification_and_longer_wait() {
        let s = step_strategy(&resolved(
            NavStep::new(StepAction::LaunchApp, "launch")
                .with_param("package", serde_json::json!("com.tencent.mm")),
        ));
        assert_eq!(s.tier, ExecTier::FireAndForget);
        assert_eq!(s.verify, VerifyTier::Lenient);
        assert!(s.wait_after_ms >= 500);
    }

    #[test]
    fn explicit_verify_ref_upgrades_to_precise() {
        let s = step_strategy(&resolved(
            NavStep::tap("wechat_moments_publish", "publish")
                .with_param("verify_ref", serde_json::json!("system/wechat_moments_page")),
        ));
        assert_eq!(s.verify, VerifyTier::Precise);
    }

    #[test]
    fn consecutive_deterministic_steps_batch() {
        let actions = vec![
            StepAction::LaunchApp,
            StepAction::Wait,
            StepAction::PressKey,
            StepAction::Tap,
            StepAction::Wait,
            StepAction::Wait,
        ];
        let batches = batch_indices(&actions);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3], vec![4, 5]]);
    }
}
