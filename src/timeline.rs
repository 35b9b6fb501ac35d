//! Cyclic lifecycle: appear → live → fade → repeat.
//!
//! A card's cycle is `appear + live + fade` ticks long (`play = appear +
//! live`). Status is a sticky two-state value: alive (1) or dissolving (2).
//! The automatic rule enters dissolving when the cyclic age reaches `play`;
//! it leaves it only by completing the fade, which wraps the card into a
//! fresh alive cycle. Scripts may assign status explicitly, which pins it
//! until their source stops assigning.
//!
//! While dissolving, the externally visible "effective age" is remapped to
//! `play + dissolve_ticks`, advancing one step per evaluated frame, so fade
//! curves see each age value beyond `play` exactly once regardless of how
//! the host's frame clock jumps.

use serde::Serialize;

use crate::card::CycleConfig;

/// Lifecycle status codes, as exposed to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Alive = 1,
    Dissolving = 2,
}

impl Status {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Status::Alive),
            2 => Some(Status::Dissolving),
            _ => None,
        }
    }
}

/// A resolved cycle with safe bounds applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cycle {
    pub appear: i64,
    pub live: i64,
    pub fade: i64,
}

impl Cycle {
    pub fn play(&self) -> i64 {
        self.appear + self.live
    }

    pub fn total(&self) -> i64 {
        self.play() + self.fade
    }
}

/// Resolve an authored cycle config. `growth_ticks`, when known, is the
/// number of ticks the card's growth needs to complete; `appear` is derived
/// from it and clamped to `[1, play]` so growth always has room, with the
/// configured play length held fixed.
pub fn resolve_cycle(cfg: &CycleConfig, growth_ticks: Option<i64>) -> Cycle {
    let play_cfg = (cfg.appear.max(0) + cfg.live.max(0)).max(1);
    let appear = growth_ticks.unwrap_or(cfg.appear).clamp(1, play_cfg);
    Cycle {
        appear,
        live: play_cfg - appear,
        fade: cfg.fade.max(0),
    }
}

/// Cyclic age of a card at `elapsed` global ticks.
pub fn cyclic_age(elapsed: i64, birth_offset: i64, total: i64) -> i64 {
    let total = total.max(1);
    ((elapsed - birth_offset) % total + total) % total
}

/// Per-evaluation-context lifecycle state.
#[derive(Debug, Clone)]
pub struct LifecycleState {
    pub status: Status,
    /// The tick at which dissolving began, if dissolving.
    pub dissolve_start: Option<i64>,
    /// Evaluated frames spent dissolving; drives the extended age.
    dissolve_ticks: i64,
    /// Set while a script explicitly assigns status; skips the auto rule.
    manual: bool,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            status: Status::Alive,
            dissolve_start: None,
            dissolve_ticks: 0,
            manual: false,
        }
    }
}

impl LifecycleState {
    /// Advance the status for one evaluated frame.
    pub fn observe(&mut self, cycle_age: i64, cycle: &Cycle, now: i64) {
        if self.manual {
            if self.status == Status::Dissolving {
                self.dissolve_ticks += 1;
            }
            return;
        }

        match self.status {
            Status::Alive => {
                if cycle_age >= cycle.play() {
                    self.status = Status::Dissolving;
                    self.dissolve_start = Some(now);
                    self.dissolve_ticks = 0;
                }
            }
            Status::Dissolving => {
                self.dissolve_ticks += 1;
                if self.dissolve_ticks >= cycle.fade.max(1) {
                    // Fade complete: wrap into a fresh alive cycle.
                    self.clear();
                }
            }
        }
    }

    /// Explicit script assignment; pins the status until released.
    pub fn set_manual(&mut self, status: Status, now: i64) {
        if status == Status::Dissolving && self.status != Status::Dissolving {
            self.dissolve_start = Some(now);
            self.dissolve_ticks = 0;
        }
        if status == Status::Alive {
            self.dissolve_start = None;
            self.dissolve_ticks = 0;
        }
        self.status = status;
        self.manual = true;
    }

    /// The script source stopped assigning status; the auto rule resumes on
    /// the next observe. The current status itself stays (sticky).
    pub fn release_manual(&mut self) {
        self.manual = false;
    }

    /// Drop back to alive, forgetting the dissolve transition.
    pub fn clear(&mut self) {
        self.status = Status::Alive;
        self.dissolve_start = None;
        self.dissolve_ticks = 0;
    }

    /// The age value scripts and fade curves see.
    pub fn effective_age(&self, cycle_age: i64, cycle: &Cycle) -> i64 {
        match self.status {
            Status::Alive => cycle_age,
            Status::Dissolving => cycle.play() + self.dissolve_ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(appear: i64, live: i64, fade: i64) -> Cycle {
        resolve_cycle(
            &CycleConfig { appear, live, fade },
            None,
        )
    }

    #[test]
    fn test_cyclic_age_wraps_and_handles_offsets() {
        assert_eq!(cyclic_age(14, 0, 18), 14);
        assert_eq!(cyclic_age(20, 0, 18), 2);
        assert_eq!(cyclic_age(3, 5, 18), 16); // before birth wraps backwards
    }

    #[test]
    fn test_resolve_cycle_clamps() {
        let c = resolve_cycle(
            &CycleConfig {
                appear: 0,
                live: 0,
                fade: -2,
            },
            None,
        );
        assert_eq!(c.play(), 1);
        assert_eq!(c.fade, 0);
        assert!(c.appear >= 1);
    }

    #[test]
    fn test_appear_derived_from_growth() {
        let c = resolve_cycle(
            &CycleConfig {
                appear: 5,
                live: 10,
                fade: 0,
            },
            Some(12),
        );
        assert_eq!(c.appear, 12);
        assert_eq!(c.play(), 15); // play length held fixed
        assert_eq!(c.live, 3);

        // Growth larger than play clamps to play.
        let c = resolve_cycle(
            &CycleConfig {
                appear: 5,
                live: 10,
                fade: 0,
            },
            Some(40),
        );
        assert_eq!(c.appear, 15);
        assert_eq!(c.live, 0);
    }

    #[test]
    fn test_dissolve_scenario() {
        // appear=5 live=10 fade=3 → play=15 total=18, frames at 14/16/18/20.
        let c = cycle(5, 10, 3);
        assert_eq!(c.play(), 15);
        assert_eq!(c.total(), 18);

        let mut lc = LifecycleState::default();

        let age14 = cyclic_age(14, 0, c.total());
        lc.observe(age14, &c, 14);
        assert_eq!(lc.status, Status::Alive);
        assert_eq!(lc.effective_age(age14, &c), 14);

        let age16 = cyclic_age(16, 0, c.total());
        lc.observe(age16, &c, 16);
        assert_eq!(lc.status, Status::Dissolving);
        assert_eq!(lc.dissolve_start, Some(16));
        assert_eq!(lc.effective_age(age16, &c), 15);

        let age18 = cyclic_age(18, 0, c.total());
        lc.observe(age18, &c, 18);
        assert_eq!(lc.status, Status::Dissolving);
        assert_eq!(lc.effective_age(age18, &c), 16);

        let age20 = cyclic_age(20, 0, c.total());
        lc.observe(age20, &c, 20);
        assert_eq!(lc.status, Status::Dissolving);
        assert_eq!(lc.effective_age(age20, &c), 17);
    }

    #[test]
    fn test_fade_completion_wraps_to_alive() {
        let c = cycle(5, 10, 3);
        let mut lc = LifecycleState::default();

        lc.observe(15, &c, 15);
        assert_eq!(lc.status, Status::Dissolving);
        for now in 16..=18 {
            lc.observe(cyclic_age(now, 0, c.total()), &c, now);
        }
        assert_eq!(lc.status, Status::Alive);
        assert_eq!(lc.dissolve_start, None);
    }

    #[test]
    fn test_manual_override_pins_status() {
        let c = cycle(5, 10, 3);
        let mut lc = LifecycleState::default();

        // Script forces a dissolve mid-life.
        lc.set_manual(Status::Dissolving, 4);
        assert_eq!(lc.dissolve_start, Some(4));
        assert_eq!(lc.effective_age(4, &c), 15);

        // Auto rule is skipped while pinned; extended age keeps growing.
        lc.observe(5, &c, 5);
        assert_eq!(lc.status, Status::Dissolving);
        assert_eq!(lc.effective_age(5, &c), 16);

        // Source stops assigning: sticky until the auto rule acts again.
        lc.release_manual();
        lc.observe(6, &c, 6);
        assert_eq!(lc.status, Status::Dissolving);

        // Clearing back to alive drops the transition tick.
        lc.clear();
        assert_eq!(lc.status, Status::Alive);
        assert_eq!(lc.dissolve_start, None);
        assert_eq!(lc.effective_age(6, &c), 6);
    }
}
