use crate::{EngineError, Result};
use nix_bisect_protocol::{Revision, Verdict, STATE_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A named group of skipped revisions.
///
/// Every revision between the lowest and the highest observation is assumed
/// to skip for the same reason, so the whole span leaves the search until an
/// unbreak commit resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipRange {
    pub name: String,
    /// History positions that skipped with this name.
    pub observed: BTreeSet<usize>,
    /// No applicable unbreak commit was found.
    #[serde(default)]
    pub unresolvable: bool,
}

impl SkipRange {
    fn new(name: String, idx: usize) -> Self {
        Self {
            name,
            observed: BTreeSet::from([idx]),
            unresolvable: false,
        }
    }

    pub fn lo(&self) -> Option<usize> {
        self.observed.first().copied()
    }

    pub fn hi(&self) -> Option<usize> {
        self.observed.last().copied()
    }

    pub fn contains(&self, idx: usize) -> bool {
        matches!((self.lo(), self.hi()), (Some(lo), Some(hi)) if lo <= idx && idx <= hi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Searching,
    /// Every remaining candidate skips with `range`. `present` is the last
    /// revision that skipped with it, `absent` the first one above that did
    /// not; the unbreak commit is `history[absent]`.
    ResolvingSkipRange {
        range: String,
        present: usize,
        absent: usize,
    },
    Converged {
        first_bad: Revision,
    },
    /// Only skipped revisions remain; the first bad is one of `suspects`.
    Exhausted {
        suspects: Vec<Revision>,
    },
    Aborted {
        reason: String,
        resume: Box<Phase>,
    },
}

/// What the runner has to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Test(Revision),
    /// Cherry-pick `unbreak` onto `onto` to see whether it applies.
    ProposePatch {
        range: String,
        onto: Revision,
        unbreak: Revision,
    },
    Done(Conclusion),
    Halted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "conclusion", rename_all = "snake_case")]
pub enum Conclusion {
    FirstBad { revision: Revision },
    Suspects { revisions: Vec<Revision> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    pub event: String,
}

/// The extended bisection over `history[good..=bad]`.
///
/// `history` is the linearized ancestry path, oldest first. `history[good]`
/// is known good and `history[bad]` known bad; the first bad revision lies in
/// `(good, bad]`. Every mutation goes through [`record`](Self::record),
/// [`unbreak_outcome`](Self::unbreak_outcome), [`abort`](Self::abort) or
/// [`resume`](Self::resume), and leaves the phase settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BisectState {
    pub schema_version: u32,
    pub target_key: String,
    pub history: Vec<Revision>,
    pub good: usize,
    pub bad: usize,
    /// Unnamed skips, position to reason.
    #[serde(default)]
    pub skips: BTreeMap<usize, String>,
    #[serde(default)]
    pub ranges: Vec<SkipRange>,
    /// Unbreak commits accepted so far.
    #[serde(default)]
    pub picked: Vec<Revision>,
    pub phase: Phase,
    #[serde(default)]
    pub log: Vec<Transition>,
}

impl BisectState {
    pub fn new(target_key: impl Into<String>, history: Vec<Revision>) -> Result<Self> {
        if history.len() < 2 {
            return Err(EngineError::Inconsistent(
                "the good revision must be a proper ancestor of the bad one".into(),
            ));
        }
        let bad = history.len() - 1;
        let mut state = Self {
            schema_version: STATE_SCHEMA_VERSION,
            target_key: target_key.into(),
            good: 0,
            bad,
            skips: BTreeMap::new(),
            ranges: Vec::new(),
            picked: Vec::new(),
            phase: Phase::Searching,
            log: Vec::new(),
            history,
        };
        let event = format!(
            "start: good {} bad {}",
            state.history[0].short(),
            state.history[bad].short()
        );
        state.push_log(None, event);
        state.settle();
        Ok(state)
    }

    pub fn good_revision(&self) -> &Revision {
        &self.history[self.good]
    }

    pub fn bad_revision(&self) -> &Revision {
        &self.history[self.bad]
    }

    pub fn index_of(&self, rev: &Revision) -> Option<usize> {
        self.history.iter().position(|r| r == rev)
    }

    fn covered(&self, idx: usize) -> bool {
        self.skips.contains_key(&idx) || self.ranges.iter().any(|r| r.contains(idx))
    }

    /// Untested positions strictly between the boundaries.
    pub fn candidates(&self) -> Vec<usize> {
        (self.good + 1..self.bad)
            .filter(|&idx| !self.covered(idx))
            .collect()
    }

    /// Candidate closest to the middle of `(good, bad)`; ties go to the older one.
    fn midpoint(&self) -> Option<usize> {
        let center = self.good + self.bad;
        self.candidates()
            .into_iter()
            .min_by_key(|&idx| ((2 * idx).abs_diff(center), idx))
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self.phase,
            Phase::Converged { .. } | Phase::Exhausted { .. }
        )
    }

    pub fn next_step(&self) -> Step {
        match &self.phase {
            Phase::Searching => match self.midpoint() {
                Some(idx) => Step::Test(self.history[idx].clone()),
                None => Step::Halted {
                    reason: "no candidate left".into(),
                },
            },
            Phase::ResolvingSkipRange {
                range,
                present,
                absent,
            } => Step::ProposePatch {
                range: range.clone(),
                onto: self.history[*present].clone(),
                unbreak: self.history[*absent].clone(),
            },
            Phase::Converged { first_bad } => Step::Done(Conclusion::FirstBad {
                revision: first_bad.clone(),
            }),
            Phase::Exhausted { suspects } => Step::Done(Conclusion::Suspects {
                revisions: suspects.clone(),
            }),
            Phase::Aborted { reason, .. } => Step::Halted {
                reason: reason.clone(),
            },
        }
    }

    /// Feed back the verdict for `rev`.
    ///
    /// Verdicts for revisions already outside `(good, bad)` that agree with
    /// the boundaries are ignored. A good revision at or above the bad
    /// boundary, or a bad one at or below the good boundary, is an error.
    pub fn record(&mut self, rev: &Revision, verdict: &Verdict) -> Result<()> {
        if let Verdict::Abort { reason } = verdict {
            self.abort(reason.clone());
            return Ok(());
        }
        let idx = self
            .index_of(rev)
            .ok_or_else(|| EngineError::Inconsistent(format!("{rev} is not in the bisected history")))?;
        if let Phase::Aborted { .. } = self.phase {
            self.resume();
        }

        match verdict {
            Verdict::Good if idx >= self.bad => {
                return Err(EngineError::Inconsistent(format!(
                    "{} is good but its ancestor {} is bad",
                    rev.short(),
                    self.bad_revision().short()
                )));
            }
            Verdict::Bad if idx <= self.good => {
                return Err(EngineError::Inconsistent(format!(
                    "{} is bad but its descendant {} is good",
                    rev.short(),
                    self.good_revision().short()
                )));
            }
            _ if idx <= self.good || idx >= self.bad => {
                log::debug!("ignoring {verdict} for {}: outside the range", rev.short());
                return Ok(());
            }
            Verdict::Good => {
                self.good = idx;
                self.prune();
            }
            Verdict::Bad => {
                self.bad = idx;
                self.prune();
            }
            Verdict::Skip {
                range: Some(name), ..
            } => {
                self.skips.remove(&idx);
                match self.ranges.iter_mut().find(|r| &r.name == name) {
                    Some(range) => {
                        range.observed.insert(idx);
                    }
                    None => self.ranges.push(SkipRange::new(name.clone(), idx)),
                }
            }
            Verdict::Skip {
                range: None,
                reason,
            } => {
                self.skips.insert(idx, reason.clone());
            }
            Verdict::Abort { .. } => {}
        }
        self.push_log(Some(rev.clone()), verdict.to_string());
        self.settle();
        Ok(())
    }

    /// Result of probing the proposed unbreak commit.
    pub fn unbreak_outcome(&mut self, applied: bool) -> Result<()> {
        let Phase::ResolvingSkipRange { range, absent, .. } = &self.phase else {
            return Err(EngineError::Inconsistent(
                "no skip range is being resolved".into(),
            ));
        };
        let (range, unbreak) = (range.clone(), self.history[*absent].clone());
        if applied && !self.picked.contains(&unbreak) {
            self.ranges.retain(|r| r.name != range);
            self.picked.push(unbreak.clone());
            self.push_log(Some(unbreak), format!("unbreak [{range}]: picked"));
        } else {
            if let Some(r) = self.ranges.iter_mut().find(|r| r.name == range) {
                r.unresolvable = true;
            }
            self.push_log(Some(unbreak), format!("unbreak [{range}]: unresolvable"));
        }
        self.settle();
        Ok(())
    }

    /// Stop without touching the range. [`resume`](Self::resume) continues.
    pub fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Phase::Aborted { .. } = self.phase {
            return;
        }
        let resume = Box::new(std::mem::replace(&mut self.phase, Phase::Searching));
        self.push_log(None, format!("abort: {reason}"));
        self.phase = Phase::Aborted { reason, resume };
    }

    pub fn resume(&mut self) {
        let resumed = match &mut self.phase {
            Phase::Aborted { resume, .. } => std::mem::replace(resume.as_mut(), Phase::Searching),
            _ => return,
        };
        self.phase = resumed;
        self.push_log(None, "resume".to_string());
        self.settle();
    }

    fn prune(&mut self) {
        let (good, bad) = (self.good, self.bad);
        self.skips.retain(|&idx, _| good < idx && idx < bad);
        for range in &mut self.ranges {
            range.observed.retain(|&idx| good < idx && idx < bad);
        }
        self.ranges.retain(|r| !r.observed.is_empty());
    }

    fn push_log(&mut self, revision: Option<Revision>, event: String) {
        log::debug!("transition: {event}");
        self.log.push(Transition { revision, event });
    }

    fn settle(&mut self) {
        if let Phase::Aborted { .. } = self.phase {
            return;
        }
        self.phase = if self.bad == self.good + 1 {
            Phase::Converged {
                first_bad: self.bad_revision().clone(),
            }
        } else if !self.candidates().is_empty() {
            Phase::Searching
        } else {
            let below = self.bad - 1;
            match self
                .ranges
                .iter()
                .find(|r| !r.unresolvable && r.contains(below))
            {
                Some(range) => Phase::ResolvingSkipRange {
                    range: range.name.clone(),
                    present: below,
                    absent: self.bad,
                },
                None => Phase::Exhausted {
                    suspects: self.history[self.good + 1..=self.bad].to_vec(),
                },
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn history(n: usize) -> Vec<Revision> {
        (0..n).map(|i| Revision::new(format!("c{i}"))).collect()
    }

    fn rev(i: usize) -> Revision {
        Revision::new(format!("c{i}"))
    }

    fn tested(state: &BisectState) -> Revision {
        match state.next_step() {
            Step::Test(rev) => rev,
            other => panic!("expected a test step, got {other:?}"),
        }
    }

    #[test]
    fn midpoint_prefers_the_older_revision_on_ties() {
        let state = BisectState::new("t", history(4)).unwrap();
        assert_eq!(tested(&state), rev(1));
        let state = BisectState::new("t", history(5)).unwrap();
        assert_eq!(tested(&state), rev(2));
    }

    #[test]
    fn adjacent_boundaries_converge_immediately() {
        let state = BisectState::new("t", history(2)).unwrap();
        assert_eq!(
            state.next_step(),
            Step::Done(Conclusion::FirstBad { revision: rev(1) })
        );
        assert!(BisectState::new("t", history(1)).is_err());
    }

    #[test]
    fn contradicting_verdicts_are_rejected() {
        let mut state = BisectState::new("t", history(6)).unwrap();
        state.record(&rev(3), &Verdict::Bad).unwrap();
        assert!(state.record(&rev(4), &Verdict::Good).is_err());
        state.record(&rev(1), &Verdict::Good).unwrap();
        assert!(state.record(&rev(0), &Verdict::Bad).is_err());
        // Already implied by the boundaries.
        state.record(&rev(0), &Verdict::Good).unwrap();
        state.record(&rev(5), &Verdict::Bad).unwrap();
        assert_eq!((state.good, state.bad), (1, 3));
        assert!(state.record(&Revision::new("elsewhere"), &Verdict::Good).is_err());
    }

    #[test]
    fn plain_skips_leave_suspects_when_nothing_else_remains() {
        let mut state = BisectState::new("t", history(4)).unwrap();
        state.record(&rev(1), &Verdict::skip("flaky")).unwrap();
        state.record(&rev(2), &Verdict::skip("flaky")).unwrap();
        assert_eq!(
            state.phase,
            Phase::Exhausted {
                suspects: vec![rev(1), rev(2), rev(3)]
            }
        );
    }

    #[test]
    fn named_skips_cover_the_span_between_them() {
        let mut state = BisectState::new("t", history(10)).unwrap();
        state
            .record(&rev(3), &Verdict::skip_range("dependency:zlib", "zlib broke"))
            .unwrap();
        state
            .record(&rev(6), &Verdict::skip_range("dependency:zlib", "zlib broke"))
            .unwrap();
        assert_eq!(state.candidates(), vec![1, 2, 7, 8]);
        state.record(&rev(4), &Verdict::Good).unwrap();
        assert_eq!(state.ranges[0].observed, BTreeSet::from([6]));
    }

    #[test]
    fn exhausted_range_proposes_its_unbreak_commit() {
        let mut state = BisectState::new("t", history(5)).unwrap();
        for i in [1, 2, 3] {
            state
                .record(&rev(i), &Verdict::skip_range("dependency:zlib", "zlib broke"))
                .unwrap();
        }
        assert_eq!(
            state.next_step(),
            Step::ProposePatch {
                range: "dependency:zlib".into(),
                onto: rev(3),
                unbreak: rev(4),
            }
        );

        state.unbreak_outcome(true).unwrap();
        assert!(state.ranges.is_empty());
        assert_eq!(state.picked, vec![rev(4)]);
        assert_eq!(state.phase, Phase::Searching);
        assert_eq!(state.candidates(), vec![1, 2, 3]);
    }

    #[test]
    fn unappliable_unbreak_marks_the_range_unresolvable() {
        let mut state = BisectState::new("t", history(3)).unwrap();
        state
            .record(&rev(1), &Verdict::skip_range("instantiation-failure", "eval"))
            .unwrap();
        state.unbreak_outcome(false).unwrap();
        assert!(state.ranges[0].unresolvable);
        assert_eq!(
            state.phase,
            Phase::Exhausted {
                suspects: vec![rev(1), rev(2)]
            }
        );
        assert!(state.unbreak_outcome(true).is_err());
    }

    #[test]
    fn a_picked_unbreak_is_not_picked_twice() {
        let mut state = BisectState::new("t", history(3)).unwrap();
        let skip = Verdict::skip_range("dependency:zlib", "zlib broke");
        state.record(&rev(1), &skip).unwrap();
        state.unbreak_outcome(true).unwrap();
        state.record(&rev(1), &skip).unwrap();
        state.unbreak_outcome(true).unwrap();
        assert_eq!(state.picked, vec![rev(2)]);
        assert!(state.ranges[0].unresolvable);
    }

    #[test]
    fn abort_keeps_the_range_and_resume_restores_the_phase() {
        let mut state = BisectState::new("t", history(8)).unwrap();
        state.record(&rev(4), &Verdict::Good).unwrap();
        let before = (state.good, state.bad, state.phase.clone());

        state.record(&rev(5), &Verdict::abort("interrupted")).unwrap();
        assert!(matches!(state.next_step(), Step::Halted { .. }));
        assert_eq!((state.good, state.bad), (before.0, before.1));

        state.resume();
        assert_eq!(state.phase, before.2);
        assert_eq!(tested(&state), rev(5));
    }

    #[test]
    fn state_survives_json() {
        let mut state = BisectState::new("t", history(6)).unwrap();
        state
            .record(&rev(2), &Verdict::skip_range("dependency:zlib", "zlib broke"))
            .unwrap();
        state.record(&rev(4), &Verdict::skip("flaky")).unwrap();
        state.abort("interrupted");
        let json = serde_json::to_string(&state).unwrap();
        let back: BisectState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
