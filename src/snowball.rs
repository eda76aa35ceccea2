//! Snowball: the repeated-sampling finalizer.
//!
//! Instantiated per decision. Each call to `tick` feeds the majority
//! candidate of one vote batch; a `None` tick is a discarded batch and
//! leaves the state untouched. Decision is reached when the preferred
//! candidate holds a `beta2`-long consecutive streak, or a `beta1`-long one
//! when no rival candidate has ever been ticked.

use std::collections::HashMap;

/// Anything with a 32-byte identity can be voted on.
pub trait Identifiable {
    fn ident(&self) -> [u8; 32];
}

impl Identifiable for bool {
    fn ident(&self) -> [u8; 32] {
        [u8::from(*self); 32]
    }
}

impl Identifiable for crate::identity::RoundId {
    fn ident(&self) -> [u8; 32] {
        self.0
    }
}

impl Identifiable for crate::round::Round {
    fn ident(&self) -> [u8; 32] {
        self.id.0
    }
}

/// Stake-weighted repeated-sampling consensus state for one decision.
pub struct Snowball<T> {
    beta1: u32,
    beta2: u32,
    /// Confidence per candidate identity.
    counts: HashMap<[u8; 32], u32>,
    preferred: Option<T>,
    streak: u32,
    decided: bool,
}

impl<T: Identifiable + Clone> Snowball<T> {
    pub fn new(beta1: u32, beta2: u32) -> Self {
        Snowball {
            beta1,
            beta2,
            counts: HashMap::new(),
            preferred: None,
            streak: 0,
            decided: false,
        }
    }

    /// Feed one batch majority. `None` (no majority emerged) is a no-op.
    pub fn tick(&mut self, candidate: Option<&T>) {
        if self.decided {
            return;
        }
        let Some(candidate) = candidate else {
            return;
        };

        let ident = candidate.ident();
        let count = {
            let entry = self.counts.entry(ident).or_insert(0);
            *entry += 1;
            *entry
        };

        match &self.preferred {
            None => {
                self.preferred = Some(candidate.clone());
                self.streak = 1;
            }
            Some(preferred) if preferred.ident() == ident => {
                self.streak += 1;
            }
            Some(preferred) => {
                // A challenger: switch only once its confidence overtakes
                // the incumbent's; either way the stability streak breaks.
                let preferred_count = self.counts.get(&preferred.ident()).copied().unwrap_or(0);
                if count > preferred_count {
                    self.preferred = Some(candidate.clone());
                    self.streak = 1;
                } else {
                    self.streak = 0;
                }
            }
        }

        if self.streak >= self.beta2 || (self.counts.len() == 1 && self.streak >= self.beta1) {
            self.decided = true;
        }
    }

    pub fn decided(&self) -> bool {
        self.decided
    }

    pub fn preferred(&self) -> Option<&T> {
        self.preferred.as_ref()
    }

    /// Current stability streak (exposed for telemetry).
    pub fn progress(&self) -> u32 {
        self.streak
    }

    /// Clear all state for the next decision.
    pub fn reset(&mut self) {
        self.counts.clear();
        self.preferred = None;
        self.streak = 0;
        self.decided = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RoundId;

    #[test]
    fn unchallenged_candidate_decides_at_beta1() {
        let mut snowball: Snowball<bool> = Snowball::new(3, 100);
        for _ in 0..2 {
            snowball.tick(Some(&true));
            assert!(!snowball.decided());
        }
        snowball.tick(Some(&true));
        assert!(snowball.decided());
        assert_eq!(snowball.preferred(), Some(&true));
    }

    #[test]
    fn challenged_candidate_needs_beta2() {
        let mut snowball: Snowball<bool> = Snowball::new(2, 4);
        snowball.tick(Some(&false)); // a rival disables the beta1 path
        // Tick 1 only ties confidence (streak 0); ticks 2-4 build streak 3.
        for _ in 0..4 {
            snowball.tick(Some(&true));
        }
        assert!(!snowball.decided());
        snowball.tick(Some(&true));
        assert!(snowball.decided());
        assert_eq!(snowball.preferred(), Some(&true));
    }

    #[test]
    fn none_tick_is_a_no_op() {
        let mut snowball: Snowball<bool> = Snowball::new(2, 10);
        snowball.tick(Some(&true));
        let streak = snowball.progress();
        snowball.tick(None);
        assert_eq!(snowball.progress(), streak);
        assert!(!snowball.decided());
    }

    /// S5: a better-tallied challenger takes over and decides.
    #[test]
    fn challenger_overtakes_then_decides() {
        let r1 = RoundId([1; 32]);
        let r2 = RoundId([2; 32]);

        let mut snowball: Snowball<RoundId> = Snowball::new(10, 3);
        snowball.tick(Some(&r1));
        assert_eq!(snowball.preferred(), Some(&r1));

        // First r2 tick only ties the confidence; the incumbent holds.
        snowball.tick(Some(&r2));
        assert_eq!(snowball.preferred(), Some(&r1));
        assert_eq!(snowball.progress(), 0);

        // Second r2 tick overtakes.
        snowball.tick(Some(&r2));
        assert_eq!(snowball.preferred(), Some(&r2));

        snowball.tick(Some(&r2));
        snowball.tick(Some(&r2));
        assert!(snowball.decided());
        assert_eq!(snowball.preferred(), Some(&r2));
    }

    #[test]
    fn decided_state_is_sticky() {
        let mut snowball: Snowball<bool> = Snowball::new(1, 1);
        snowball.tick(Some(&true));
        assert!(snowball.decided());
        snowball.tick(Some(&false));
        assert_eq!(snowball.preferred(), Some(&true));

        snowball.reset();
        assert!(!snowball.decided());
        assert!(snowball.preferred().is_none());
    }
}
