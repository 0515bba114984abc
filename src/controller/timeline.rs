use crate::model::TileId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ease {
    Linear,
    InCubic,
    OutQuad,
}

impl Ease {
    pub fn apply(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Ease::Linear => t,
            Ease::InCubic => t * t * t,
            Ease::OutQuad => t * (2.0 - t),
        }
    }
}

/// What a tween writes to. At most one tween runs per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TweenTarget {
    /// Heightmap generation blend.
    Progression,
    TileBuild(TileId),
    PopulationFade { tile: TileId, slot: usize },
}

/// Run once when a tween reaches its end value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishAction {
    None,
    ReleasePopulation { tile: TileId, slot: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Tween {
    target: TweenTarget,
    from: f32,
    to: f32,
    duration: f32,
    elapsed: f32,
    ease: Ease,
    on_finish: FinishAction,
}

impl Tween {
    fn value(&self) -> f32 {
        let t = if self.duration > 0.0 { self.elapsed / self.duration } else { 1.0 };
        self.from + (self.to - self.from) * self.ease.apply(t)
    }

    fn finished(&self) -> bool {
        self.elapsed >= self.duration
    }
}

/// Values produced by one `Timeline::update`.
#[derive(Debug, Default)]
pub struct TimelineStep {
    pub values: Vec<(TweenTarget, f32)>,
    pub finished: Vec<FinishAction>,
}

/// Eased scalar animations keyed by target.
#[derive(Debug, Default)]
pub struct Timeline {
    tweens: Vec<Tween>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a tween, replacing any running tween on the same target.
    /// The replaced tween's finish action is dropped.
    pub fn apply(
        &mut self,
        target: TweenTarget,
        from: f32,
        to: f32,
        duration: f32,
        ease: Ease,
        on_finish: FinishAction,
    ) {
        self.tweens.retain(|t| t.target != target);
        self.tweens.push(Tween { target, from, to, duration, elapsed: 0.0, ease, on_finish });
    }

    pub fn is_running(&self, target: TweenTarget) -> bool {
        self.tweens.iter().any(|t| t.target == target)
    }

    pub fn is_empty(&self) -> bool {
        self.tweens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tweens.clear();
    }

    /// Drops every tween whose target matches, finish actions included.
    pub fn cancel(&mut self, mut matches: impl FnMut(TweenTarget) -> bool) {
        self.tweens.retain(|t| !matches(t.target));
    }

    /// Advances every tween by `dt` seconds.
    pub fn update(&mut self, dt: f32) -> TimelineStep {
        let mut step = TimelineStep::default();
        for tween in &mut self.tweens {
            tween.elapsed = (tween.elapsed + dt.max(0.0)).min(tween.duration);
            step.values.push((tween.target, tween.value()));
            if tween.finished() && tween.on_finish != FinishAction::None {
                step.finished.push(tween.on_finish);
            }
        }
        self.tweens.retain(|t| !t.finished());
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eases_hit_their_endpoints() {
        for ease in [Ease::Linear, Ease::InCubic, Ease::OutQuad] {
            assert_eq!(ease.apply(0.0), 0.0);
            assert_eq!(ease.apply(1.0), 1.0);
        }
        assert!(Ease::InCubic.apply(0.5) < 0.5);
        assert!(Ease::OutQuad.apply(0.5) > 0.5);
    }

    #[test]
    fn tween_reaches_target_and_fires_once() {
        let mut timeline = Timeline::new();
        let release = FinishAction::ReleasePopulation { tile: 3, slot: 1 };
        timeline.apply(TweenTarget::PopulationFade { tile: 3, slot: 1 }, 1.0, 0.0, 1.0, Ease::Linear, release);

        let step = timeline.update(0.5);
        assert_eq!(step.values.len(), 1);
        assert!((step.values[0].1 - 0.5).abs() < 1e-6);
        assert!(step.finished.is_empty());

        let step = timeline.update(0.75);
        assert_eq!(step.values[0].1, 0.0);
        assert_eq!(step.finished, vec![release]);
        assert!(timeline.is_empty());
        assert!(timeline.update(1.0).values.is_empty());
    }

    #[test]
    fn reapplying_a_target_replaces_the_tween() {
        let mut timeline = Timeline::new();
        let release = FinishAction::ReleasePopulation { tile: 0, slot: 0 };
        let target = TweenTarget::PopulationFade { tile: 0, slot: 0 };
        timeline.apply(target, 1.0, 0.0, 1.0, Ease::Linear, release);
        timeline.apply(target, 0.0, 1.0, 1.0, Ease::OutQuad, FinishAction::None);
        let step = timeline.update(2.0);
        assert_eq!(step.values, vec![(target, 1.0)]);
        assert!(step.finished.is_empty());
    }

    #[test]
    fn cancelled_tweens_never_fire() {
        let mut timeline = Timeline::new();
        let release = FinishAction::ReleasePopulation { tile: 2, slot: 0 };
        timeline.apply(TweenTarget::PopulationFade { tile: 2, slot: 0 }, 1.0, 0.0, 1.0, Ease::Linear, release);
        timeline.apply(TweenTarget::Progression, 0.0, 1.0, 1.0, Ease::InCubic, FinishAction::None);
        timeline.cancel(|target| target != TweenTarget::Progression);
        assert!(timeline.is_running(TweenTarget::Progression));
        let step = timeline.update(2.0);
        assert_eq!(step.values, vec![(TweenTarget::Progression, 1.0)]);
        assert!(step.finished.is_empty());
    }
}
