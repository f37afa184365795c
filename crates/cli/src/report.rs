use console::style;
use nix_bisect_engine::{
    BisectState, Conclusion, Judgement, Phase, Progress, RunEnd, RunSummary, SkipRange, Step,
};
use nix_bisect_protocol::{BuildOutcome, Revision, Verdict};
use serde::Serialize;

/// `bisect: good` and friends, colored when stdout is a terminal.
pub fn verdict_banner(verdict: &Verdict) -> String {
    let label = format!("bisect: {}", verdict.label());
    let label = match verdict {
        Verdict::Good => style(label).green().bold(),
        Verdict::Bad => style(label).red().bold(),
        Verdict::Skip { .. } => style(label).yellow().bold(),
        Verdict::Abort { .. } => style(label).magenta().bold(),
    };
    match verdict {
        Verdict::Good | Verdict::Bad => label.to_string(),
        Verdict::Skip {
            range: Some(range),
            reason,
        } => format!("{label} [{range}] {reason}"),
        Verdict::Skip { range: None, reason } | Verdict::Abort { reason } => {
            format!("{label} {reason}")
        }
    }
}

pub fn render_step(step: &Step) -> String {
    match step {
        Step::Test(rev) => format!("next: {}", rev.short()),
        Step::ProposePatch {
            range,
            onto,
            unbreak,
        } => format!(
            "next: try {} as unbreak commit for [{range}] onto {}",
            unbreak.short(),
            onto.short()
        ),
        Step::Done(conclusion) => render_conclusion(conclusion),
        Step::Halted { reason } => format!("stopped: {reason} (`nix-bisect run` resumes)"),
    }
}

pub fn render_conclusion(conclusion: &Conclusion) -> String {
    match conclusion {
        Conclusion::FirstBad { revision } => {
            format!("{} is the first bad commit", style(revision).bold())
        }
        Conclusion::Suspects { revisions } => {
            let mut out = format!(
                "the first bad commit could be any of {} skipped commits:",
                revisions.len()
            );
            for rev in revisions {
                out.push_str("\n  ");
                out.push_str(rev.as_str());
            }
            out
        }
    }
}

pub fn render_end(end: &RunEnd) -> String {
    match end {
        RunEnd::Concluded(conclusion) => render_conclusion(conclusion),
        RunEnd::Aborted { reason } => {
            format!("stopped: {reason} (`nix-bisect run` resumes)")
        }
    }
}

/// Machine-readable view of a bisection for `status --json`.
#[derive(Debug, Serialize)]
pub struct StatusReport<'a> {
    pub target_key: &'a str,
    pub good: &'a Revision,
    pub bad: &'a Revision,
    pub candidates: usize,
    pub phase: &'a Phase,
    pub next: Option<&'a Revision>,
    pub skips: Vec<&'a Revision>,
    pub ranges: Vec<RangeReport<'a>>,
    pub picked: &'a [Revision],
}

#[derive(Debug, Serialize)]
pub struct RangeReport<'a> {
    pub name: &'a str,
    pub lo: Option<&'a Revision>,
    pub hi: Option<&'a Revision>,
    pub unresolvable: bool,
}

impl<'a> StatusReport<'a> {
    pub fn new(state: &'a BisectState, next: Option<&'a Revision>) -> Self {
        let range = |range: &'a SkipRange| RangeReport {
            name: &range.name,
            lo: range.lo().map(|idx| &state.history[idx]),
            hi: range.hi().map(|idx| &state.history[idx]),
            unresolvable: range.unresolvable,
        };
        Self {
            target_key: &state.target_key,
            good: state.good_revision(),
            bad: state.bad_revision(),
            candidates: state.candidates().len(),
            phase: &state.phase,
            next,
            skips: state.skips.keys().map(|&idx| &state.history[idx]).collect(),
            ranges: state.ranges.iter().map(range).collect(),
            picked: &state.picked,
        }
    }
}

pub fn render_status(state: &BisectState) -> String {
    let mut out = format!(
        "good {}  bad {}  ({} candidates left)",
        state.good_revision().short(),
        state.bad_revision().short(),
        state.candidates().len()
    );
    if !state.skips.is_empty() {
        out.push_str(&format!("\nskipped: {}", state.skips.len()));
    }
    for range in &state.ranges {
        let bound = |idx: Option<usize>| idx.map_or("?", |idx| state.history[idx].short());
        out.push_str(&format!(
            "\nskip range [{}]: {}..{}{}",
            range.name,
            bound(range.lo()),
            bound(range.hi()),
            if range.unresolvable {
                " (unresolvable)"
            } else {
                ""
            }
        ));
    }
    if !state.picked.is_empty() {
        let picked: Vec<&str> = state.picked.iter().map(Revision::short).collect();
        out.push_str(&format!("\npicked: {}", picked.join(", ")));
    }
    out.push('\n');
    out.push_str(&render_step(&state.next_step()));
    out
}

#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub tested: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conclusion: Option<&'a Conclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<&'a str>,
}

impl<'a> RunReport<'a> {
    pub fn new(summary: &'a RunSummary) -> Self {
        let (conclusion, stopped) = match &summary.end {
            RunEnd::Concluded(conclusion) => (Some(conclusion), None),
            RunEnd::Aborted { reason } => (None, Some(reason.as_str())),
        };
        Self {
            tested: summary.tested,
            conclusion,
            stopped,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BuildStatusReport<'a> {
    pub revision: &'a Revision,
    pub outcome: &'a BuildOutcome,
    pub verdict: &'a Verdict,
    pub cached: bool,
    pub exit_code: i32,
}

/// Prints a banner per judged candidate unless stdout carries JSON.
pub struct ConsoleProgress {
    pub quiet: bool,
}

impl Progress for ConsoleProgress {
    fn tested(&self, revision: &Revision, judgement: &Judgement) {
        if self.quiet {
            return;
        }
        let cached = if judgement.cached { " (cached)" } else { "" };
        println!(
            "{}: {}{cached}",
            revision.short(),
            verdict_banner(&judgement.verdict)
        );
    }

    fn unbreak(&self, range: &str, unbreak: &Revision, applied: bool) {
        if self.quiet {
            return;
        }
        if applied {
            println!("picked {} to unbreak [{range}]", unbreak.short());
        } else {
            println!("{} does not apply; [{range}] stays skipped", unbreak.short());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banners_name_the_verdict_and_reason() {
        console::set_colors_enabled(false);
        assert_eq!(verdict_banner(&Verdict::Good), "bisect: good");
        assert_eq!(
            verdict_banner(&Verdict::skip_range("dependency:zlib-1.3", "zlib failed")),
            "bisect: skip [dependency:zlib-1.3] zlib failed"
        );
        assert_eq!(
            verdict_banner(&Verdict::abort("interrupted")),
            "bisect: abort interrupted"
        );
    }

    #[test]
    fn status_lists_ranges_and_the_next_step() {
        console::set_colors_enabled(false);
        let history: Vec<Revision> = (0..6).map(|i| Revision::new(format!("c{i}"))).collect();
        let mut state = BisectState::new("hello", history).unwrap();
        state
            .record(&Revision::new("c2"), &Verdict::skip_range("dependency:zlib", "x"))
            .unwrap();
        let status = render_status(&state);
        assert!(status.contains("skip range [dependency:zlib]: c2..c2"), "{status}");
        assert!(status.ends_with("next: c3"), "{status}");

        let report = serde_json::to_value(StatusReport::new(&state, None)).unwrap();
        assert_eq!(report["candidates"], 3);
        assert_eq!(report["phase"]["phase"], "searching");
        assert_eq!(report["ranges"][0]["lo"], "c2");
    }
}
