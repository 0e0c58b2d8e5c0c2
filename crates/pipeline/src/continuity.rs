//! Continuity chaining and the partial-batch success policy shared by the
//! stage agents.

use crate::agents::StageError;

/// Threads one unit's terminal output into the next unit's request.
///
/// The reference only moves forward on success: when a unit fails, the
/// chain keeps pointing at the last unit that worked, so downstream units
/// degrade gracefully instead of losing continuity entirely.
#[derive(Debug, Clone, Default)]
pub struct ContinuityChain {
    last_output: Option<String>,
}

impl ContinuityChain {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            last_output: initial,
        }
    }

    pub fn advance(&mut self, output_url: impl Into<String>) {
        self.last_output = Some(output_url.into());
    }

    pub fn current(&self) -> Option<&str> {
        self.last_output.as_deref()
    }

    /// Reference list for a request: the fixed base references followed by
    /// the chained output, when one exists.
    pub fn reference_urls(&self, base: &[&str]) -> Vec<String> {
        let mut refs: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        if let Some(last) = &self.last_output {
            if !refs.iter().any(|r| r == last) {
                refs.push(last.clone());
            }
        }
        refs
    }
}

/// Per-stage tally of unit outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// The batch outcome rule: a stage fails iff every unit failed. Any
    /// single success is a (possibly degraded) stage completion.
    pub fn into_result(self) -> Result<BatchReport, StageError> {
        if self.succeeded == 0 && self.failed > 0 {
            Err(StageError::BatchFailed { total: self.failed })
        } else {
            Ok(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_outcome_rule() {
        for successes in 0..=4usize {
            let report = BatchReport {
                succeeded: successes,
                failed: 4 - successes,
            };
            let result = report.into_result();
            if successes == 0 {
                assert!(matches!(
                    result,
                    Err(StageError::BatchFailed { total: 4 })
                ));
            } else {
                let report = result.expect("k >= 1 completes the stage");
                assert_eq!(report.succeeded, successes);
                assert_eq!(report.failed, 4 - successes);
            }
        }
    }

    #[test]
    fn test_empty_batch_is_not_a_failure() {
        assert!(BatchReport::default().into_result().is_ok());
    }

    #[test]
    fn test_chain_survives_unit_failure() {
        let mut chain = ContinuityChain::new(Some("portrait.png".into()));

        // unit 0 succeeds
        chain.advance("segment_0_end.png");
        // unit 1 fails: the chain is untouched
        assert_eq!(chain.current(), Some("segment_0_end.png"));
        // unit 2 therefore still sees unit 0's output
        let refs = chain.reference_urls(&["portrait.png"]);
        assert_eq!(refs, vec!["portrait.png", "segment_0_end.png"]);
    }

    #[test]
    fn test_reference_urls_deduplicates_base() {
        let chain = ContinuityChain::new(Some("portrait.png".into()));
        assert_eq!(chain.reference_urls(&["portrait.png"]), vec!["portrait.png"]);
    }
}
