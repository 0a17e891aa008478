//! AFE offset search. Every stage sweeps its positive offset upward
//! from zero: a window of CDC samples decides whether the baseline
//! reached the target band, then a burst of trigger checks confirms the
//! pad stays quiet before the offset locks with a safety margin. The
//! target band adapts to the spread observed on each pad, so noisy
//! environments demand more headroom than quiet ones.

use fixed::types::I16F16;
use heapless::Vec;
use statig::blocking::IntoStateMachineExt as _;
use statig::prelude::*;

use super::{afe_offset_word, AfeSide, STAGE_SLOTS};

const AFE_SWEEP_END: u8 = 127;
const CDC_SCAN_SAMPLES: u16 = 50;
const TRIGGER_CHECK_SAMPLES: u16 = 50;
const LOCK_MARGIN: u8 = 2;

const CDC_TARGET: i32 = 14_000;
const SENS_TARGET_STEP: i32 = 8;
/// Spreads at or below this count as a quiet pad, at or above the upper
/// bound as a noisy one; between the two the factor decays smoothly.
const SPREAD_QUIET: i32 = 16;
const SPREAD_NOISY: i32 = 128;
const QUIET_GAIN: i32 = 4;
const NOISY_SHRINK: i32 = 2;

type Fx = I16F16;

/// Running CDC window: integer running average plus the observed range.
#[derive(Clone, Copy, Default)]
struct CdcWindow {
    average: u16,
    min: u16,
    max: u16,
    count: u16,
}

impl CdcWindow {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn push(&mut self, value: u16) -> bool {
        if self.count == 0 {
            self.average = value;
            self.min = value;
            self.max = value;
        } else {
            let total = u32::from(self.average) * u32::from(self.count) + u32::from(value);
            self.average = (total / (u32::from(self.count) + 1)) as u16;
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.count >= CDC_SCAN_SAMPLES
    }

    fn spread(&self) -> u16 {
        self.max - self.min
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StagePhase {
    /// Accumulating the CDC window at the current offset.
    Scan,
    /// Baseline reached the band; counting trigger checks.
    Verify,
    Settled,
    Failed,
}

#[derive(Clone, Copy)]
struct StageSearch {
    phase: StagePhase,
    offset: u8,
    best_offset: u8,
    window: CdcWindow,
    max_spread: u16,
    fires: u16,
    checks: u16,
}

impl StageSearch {
    fn settled() -> Self {
        Self {
            phase: StagePhase::Settled,
            offset: AFE_SWEEP_END,
            best_offset: 0,
            window: CdcWindow::default(),
            max_spread: 0,
            fires: 0,
            checks: 0,
        }
    }

    fn begin(&mut self) {
        *self = Self {
            phase: StagePhase::Scan,
            offset: 0,
            ..Self::settled()
        };
    }
}

#[derive(Clone, Copy, Debug)]
pub(super) enum SearchEvent {
    Start {
        stage_count: u8,
        targets: [u8; STAGE_SLOTS],
    },
    Sample {
        fired: u16,
        cdc: [u16; STAGE_SLOTS],
    },
    Abort,
}

/// Register writes requested by one dispatch; the driver owns the bus
/// and applies them after the machine returns.
#[derive(Default)]
pub(super) struct SearchContext {
    pub(super) writes: Vec<(u8, u16), STAGE_SLOTS>,
    pub(super) locks: Vec<(u8, u16), STAGE_SLOTS>,
    pub(super) failed_stages: u16,
    pub(super) finished: bool,
}

pub(super) struct AfeSearch {
    stages: [StageSearch; STAGE_SLOTS],
    stage_count: u8,
    targets: [u8; STAGE_SLOTS],
}

#[state_machine(initial = "State::idle()")]
impl AfeSearch {
    #[state]
    fn idle(&mut self, context: &mut SearchContext, event: &SearchEvent) -> Outcome<State> {
        let _ = context;
        match event {
            SearchEvent::Start {
                stage_count,
                targets,
            } => {
                self.stage_count = (*stage_count).min(STAGE_SLOTS as u8);
                self.targets = *targets;
                for stage in &mut self.stages[..self.stage_count as usize] {
                    stage.begin();
                }
                Transition(State::searching())
            }
            _ => Handled,
        }
    }

    #[state]
    fn searching(&mut self, context: &mut SearchContext, event: &SearchEvent) -> Outcome<State> {
        match event {
            SearchEvent::Sample { fired, cdc } => {
                self.step(context, *fired, cdc);
                if self.all_terminal() {
                    context.finished = true;
                    Transition(State::idle())
                } else {
                    Handled
                }
            }
            SearchEvent::Abort => {
                // Drop the in-flight stages so the search reads as done.
                self.stage_count = 0;
                context.finished = true;
                Transition(State::idle())
            }
            SearchEvent::Start { .. } => Handled,
        }
    }
}

impl AfeSearch {
    fn new() -> Self {
        Self {
            stages: [StageSearch::settled(); STAGE_SLOTS],
            stage_count: 0,
            targets: [0; STAGE_SLOTS],
        }
    }

    fn step(&mut self, context: &mut SearchContext, fired: u16, cdc: &[u16; STAGE_SLOTS]) {
        for slot in 0..self.stage_count as usize {
            let target_sens = self.targets[slot];
            let stage = &mut self.stages[slot];
            match stage.phase {
                StagePhase::Settled | StagePhase::Failed => {}
                StagePhase::Scan => {
                    if stage.window.push(cdc[slot]) {
                        stage.max_spread = stage.max_spread.max(stage.window.spread());
                        let factor = fluctuation_factor(stage.max_spread, target_sens);
                        let threshold = adjusted_target(factor, target_sens);
                        if i32::from(stage.window.average) >= threshold {
                            stage.best_offset = stage.offset;
                            stage.fires = 0;
                            stage.checks = 0;
                            stage.phase = StagePhase::Verify;
                        } else {
                            advance_offset(stage, slot, context);
                        }
                    }
                }
                StagePhase::Verify => {
                    if fired & (1 << slot) != 0 {
                        stage.fires += 1;
                    }
                    stage.checks += 1;
                    if stage.checks >= TRIGGER_CHECK_SAMPLES {
                        if stage.fires == 0 {
                            let locked =
                                stage.best_offset.saturating_add(LOCK_MARGIN).min(AFE_SWEEP_END);
                            stage.offset = locked;
                            stage.phase = StagePhase::Settled;
                            let word = afe_offset_word(AfeSide::Positive, locked);
                            let _ = context.locks.push((slot as u8, word));
                        } else {
                            advance_offset(stage, slot, context);
                        }
                    }
                }
            }
        }
    }

    fn all_terminal(&self) -> bool {
        self.stages[..self.stage_count as usize]
            .iter()
            .all(|stage| matches!(stage.phase, StagePhase::Settled | StagePhase::Failed))
    }

    fn active(&self) -> bool {
        self.stages[..self.stage_count as usize]
            .iter()
            .any(|stage| matches!(stage.phase, StagePhase::Scan | StagePhase::Verify))
    }

    /// Mean of the per-stage sweep positions projected onto 0..=255;
    /// settled and failed stages count as done.
    fn progress(&self) -> u8 {
        if self.stage_count == 0 {
            return 255;
        }
        let mut total = 0u32;
        for stage in &self.stages[..self.stage_count as usize] {
            total += match stage.phase {
                StagePhase::Settled | StagePhase::Failed => 255,
                _ => u32::from(stage.offset) * 255 / u32::from(AFE_SWEEP_END),
            };
        }
        (total / u32::from(self.stage_count)) as u8
    }
}

fn advance_offset(stage: &mut StageSearch, slot: usize, context: &mut SearchContext) {
    if stage.offset >= AFE_SWEEP_END {
        stage.phase = StagePhase::Failed;
        context.failed_stages |= 1 << slot;
        return;
    }
    stage.offset += 1;
    stage.window.clear();
    stage.phase = StagePhase::Scan;
    let word = afe_offset_word(AfeSide::Positive, stage.offset);
    let _ = context.writes.push((slot as u8, word));
}

/// Headroom demanded of the baseline, derived from the worst spread this
/// pad has shown. Quiet pads amplify their spread, noisy pads shrink it,
/// and the band between decays exponentially with the sensitivity target
/// steepening the curve.
fn fluctuation_factor(max_spread: u16, target_sens: u8) -> i32 {
    let spread = i32::from(max_spread);
    if spread <= SPREAD_QUIET {
        return spread * QUIET_GAIN;
    }
    if spread >= SPREAD_NOISY {
        return spread / NOISY_SHRINK;
    }
    let position = Fx::from_num(spread - SPREAD_QUIET) / (SPREAD_NOISY - SPREAD_QUIET);
    let steepness = Fx::ONE + Fx::from_num(3 * i32::from(target_sens)) / 99;
    let decay = exp_neg(steepness * position);
    let blended = (Fx::from_num(spread * QUIET_GAIN) * decay).to_num::<i32>();
    blended.clamp(spread / NOISY_SHRINK, spread * QUIET_GAIN)
}

fn adjusted_target(factor: i32, target_sens: u8) -> i32 {
    CDC_TARGET + factor - SENS_TARGET_STEP * (i32::from(target_sens.max(1)) - 2)
}

/// e^-t by fourth-order series after range halving; fixed point keeps
/// the sweep deterministic on targets without an FPU.
fn exp_neg(t: Fx) -> Fx {
    let mut t = t.clamp(Fx::ZERO, Fx::from_num(4));
    let mut halvings = 0;
    while t > Fx::ONE {
        t = t / 2;
        halvings += 1;
    }
    let t2 = t * t;
    let t3 = t2 * t;
    let t4 = t3 * t;
    let mut value = Fx::ONE - t + t2 / 2 - t3 / 6 + t4 / 24;
    if value < Fx::ZERO {
        value = Fx::ZERO;
    }
    for _ in 0..halvings {
        value = value * value;
    }
    value
}

pub(super) struct AfeEngine {
    machine: statig::blocking::StateMachine<AfeSearch>,
}

impl AfeEngine {
    pub(super) fn new() -> Self {
        Self {
            machine: AfeSearch::new().state_machine(),
        }
    }

    pub(super) fn start(&mut self, stage_count: u8, targets: [u8; STAGE_SLOTS]) {
        let _ = self.apply(&SearchEvent::Start {
            stage_count,
            targets,
        });
    }

    pub(super) fn step(&mut self, fired: u16, cdc: [u16; STAGE_SLOTS]) -> SearchContext {
        self.apply(&SearchEvent::Sample { fired, cdc })
    }

    pub(super) fn abort(&mut self) -> SearchContext {
        self.apply(&SearchEvent::Abort)
    }

    pub(super) fn active(&self) -> bool {
        self.machine.inner().active()
    }

    pub(super) fn progress(&self) -> u8 {
        self.machine.inner().progress()
    }

    fn apply(&mut self, event: &SearchEvent) -> SearchContext {
        let mut context = SearchContext::default();
        self.machine.handle_with_context(event, &mut context);
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_spread_amplifies_and_noisy_spread_shrinks() {
        assert_eq!(fluctuation_factor(10, 49), 40);
        assert_eq!(fluctuation_factor(16, 49), 64);
        assert_eq!(fluctuation_factor(200, 49), 100);
    }

    #[test]
    fn blended_spread_lands_between_the_bounds() {
        let factor = fluctuation_factor(30, 49);
        assert!(factor > 30 / NOISY_SHRINK);
        assert!(factor < 30 * QUIET_GAIN);
        // Steeper sensitivity targets decay harder.
        assert!(fluctuation_factor(30, 99) < fluctuation_factor(30, 0));
    }

    #[test]
    fn decay_matches_reference_points() {
        assert_eq!(exp_neg(Fx::ZERO), Fx::ONE);
        let at_one = exp_neg(Fx::ONE);
        assert!(at_one > Fx::from_num(0.35) && at_one < Fx::from_num(0.38));
        let at_two = exp_neg(Fx::from_num(2));
        assert!(at_two > Fx::from_num(0.11) && at_two < Fx::from_num(0.16));
        assert!(exp_neg(Fx::from_num(4)) < at_two);
    }

    #[test]
    fn target_shifts_with_sensitivity() {
        assert_eq!(adjusted_target(0, 49), CDC_TARGET - 376);
        assert_eq!(adjusted_target(100, 2), CDC_TARGET + 100);
        // Zero clamps to one before the shift.
        assert_eq!(adjusted_target(0, 0), CDC_TARGET + 8);
    }

    #[test]
    fn fresh_engine_is_idle_and_done() {
        let engine = AfeEngine::new();
        assert!(!engine.active());
        assert_eq!(engine.progress(), 255);
    }

    #[test]
    fn abort_finishes_the_search() {
        let mut engine = AfeEngine::new();
        engine.start(2, [49; STAGE_SLOTS]);
        assert!(engine.active());
        assert_eq!(engine.progress(), 0);
        let outcome = engine.abort();
        assert!(outcome.finished);
        assert!(!engine.active());
    }

    #[test]
    fn sweep_exhaustion_fails_the_stage() {
        let mut engine = AfeEngine::new();
        engine.start(1, [49; STAGE_SLOTS]);
        let mut failed = 0;
        // CDC pinned far below the band; the offset must run out.
        for _ in 0..((AFE_SWEEP_END as u32 + 1) * CDC_SCAN_SAMPLES as u32 + 1) {
            let outcome = engine.step(0, [100; STAGE_SLOTS]);
            failed |= outcome.failed_stages;
            if outcome.finished {
                break;
            }
        }
        assert_eq!(failed, 0b1);
        assert!(!engine.active());
        assert_eq!(engine.progress(), 255);
    }
}
