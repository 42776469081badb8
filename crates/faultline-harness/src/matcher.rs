//! Outcome matching: observed completion versus declared hypotheses.
//!
//! A case declares up to [`MAX_HYPOTHESES`](faultline_types::MAX_HYPOTHESES)
//! complete sets of counter expectations because retry/failover timing in the
//! target is racy. The first hypothesis whose every counter passes wins; if
//! none does, the verdict carries one attempt per hypothesis so the report
//! can show exactly which counters diverged.

use std::fmt::Write as _;

use faultline_types::{
    CounterFamily, ErrorCounters, ExpectedCount, IoCompletion, IoStatus, OutcomeHypothesis,
    ScenarioCase, StatusPair,
};
use serde::Serialize;
use tracing::{debug, warn};

/// Target-dependent values symbolic expectations resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchContext {
    pub element_size: u32,
    /// Retryable errors that fail one device (K).
    pub single_fail_threshold: u32,
}

impl MatchContext {
    #[must_use]
    pub const fn new(element_size: u32, single_fail_threshold: u32) -> Self {
        Self {
            element_size,
            single_fail_threshold,
        }
    }
}

/// Whether `actual` satisfies `expected` for counter `family`.
#[must_use]
pub fn counter_matches(
    expected: ExpectedCount,
    actual: u32,
    family: CounterFamily,
    ctx: &MatchContext,
) -> bool {
    let k = i64::from(ctx.single_fail_threshold);
    let actual_wide = i64::from(actual);
    match expected {
        ExpectedCount::Any => true,
        ExpectedCount::MatchesElementSize => actual == ctx.element_size,
        ExpectedCount::NonZero => actual != 0,
        ExpectedCount::RangeAroundSingleFail => (actual_wide - k).abs() <= 1,
        ExpectedCount::RangeAroundDoubleFail => (actual_wide - 2 * k).abs() <= 2,
        ExpectedCount::Exact(n) => exact_matches(n, actual, family),
    }
}

/// Retry accounting may record one extra error when a retry races the
/// completion; no other counter gets that slack.
fn exact_matches(expected: u32, actual: u32, family: CounterFamily) -> bool {
    match family {
        CounterFamily::Retryable | CounterFamily::NonRetryable => {
            actual == expected || Some(actual) == expected.checked_add(1)
        }
        _ => actual == expected,
    }
}

/// One counter that failed its expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterMismatch {
    pub family: CounterFamily,
    pub expected: ExpectedCount,
    pub actual: u32,
}

/// Result of testing one hypothesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HypothesisAttempt {
    pub index: usize,
    pub mismatches: Vec<CounterMismatch>,
}

impl HypothesisAttempt {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Status / error-count check, independent of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCheck {
    pub observed: StatusPair,
    pub acceptable: Vec<StatusPair>,
    pub observed_error_count: u32,
    pub expected_error_count: u32,
    pub status_ok: bool,
    pub error_count_ok: bool,
}

impl StatusCheck {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status_ok && self.error_count_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeVerdict {
    pub status: StatusCheck,
    /// Attempts in hypothesis order, stopping at the first pass.
    pub attempts: Vec<HypothesisAttempt>,
    pub matched: Option<usize>,
    pub counters: ErrorCounters,
    pub context: MatchContext,
}

impl OutcomeVerdict {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status.passed() && self.matched.is_some()
    }

    /// Actual-vs-expected table covering every hypothesis that was tried.
    #[must_use]
    pub fn render(&self, case: &ScenarioCase) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "status {} (acceptable: {}) {}",
            self.status.observed,
            join_pairs(&self.status.acceptable),
            if self.status.status_ok { "ok" } else { "MISMATCH" },
        );
        let _ = writeln!(
            out,
            "io errors {} (expected {}) {}",
            self.status.observed_error_count,
            self.status.expected_error_count,
            if self.status.error_count_ok { "ok" } else { "MISMATCH" },
        );
        let _ = writeln!(
            out,
            "element_size={} single_fail_threshold={}",
            self.context.element_size, self.context.single_fail_threshold
        );

        let _ = write!(out, "{:<14}{:>8}", "counter", "actual");
        for attempt in &self.attempts {
            let _ = write!(out, "{:>8}", format!("h{}", attempt.index));
        }
        out.push('\n');

        for family in CounterFamily::ALL {
            let _ = write!(out, "{:<14}{:>8}", family.label(), self.counters.get(family));
            for attempt in &self.attempts {
                let expected = case
                    .hypotheses
                    .get(attempt.index)
                    .map_or(ExpectedCount::Any, |h| h.get(family));
                let marker = if attempt.mismatches.iter().any(|m| m.family == family) {
                    "*"
                } else {
                    ""
                };
                let _ = write!(out, "{:>8}", format!("{expected}{marker}"));
            }
            out.push('\n');
        }

        match self.matched {
            Some(index) => {
                let _ = writeln!(out, "matched hypothesis h{index}");
            }
            None => out.push_str("no hypothesis matched (* marks a failing counter)\n"),
        }
        out
    }
}

fn join_pairs(pairs: &[StatusPair]) -> String {
    pairs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn check_status(case: &ScenarioCase, observed: &IoCompletion) -> StatusCheck {
    let pair = StatusPair::new(observed.status, observed.qualifier);
    let status_ok = case.acceptable.contains(&pair);
    let expected = case.expected_io_error_count;
    // A clean completion can still race one recorded error, but only when the
    // case declares both the success pair and an error pair after it.
    let success_then_error = match case.acceptable.as_slice() {
        [first, rest @ ..] => {
            first.status == IoStatus::Success && rest.iter().any(|p| p.status != IoStatus::Success)
        }
        [] => false,
    };
    let error_count_ok = observed.error_count == expected
        || (expected == 0 && success_then_error && observed.error_count == 1);
    StatusCheck {
        observed: pair,
        acceptable: case.acceptable.clone(),
        observed_error_count: observed.error_count,
        expected_error_count: expected,
        status_ok,
        error_count_ok,
    }
}

fn attempt(
    index: usize,
    hypothesis: &OutcomeHypothesis,
    counters: &ErrorCounters,
    ctx: &MatchContext,
) -> HypothesisAttempt {
    let mismatches = CounterFamily::ALL
        .into_iter()
        .filter_map(|family| {
            let expected = hypothesis.get(family);
            let actual = counters.get(family);
            (!counter_matches(expected, actual, family, ctx)).then_some(CounterMismatch {
                family,
                expected,
                actual,
            })
        })
        .collect();
    HypothesisAttempt { index, mismatches }
}

/// Compare one completion against a case's declared outcomes.
#[must_use]
pub fn evaluate(
    case: &ScenarioCase,
    observed: &IoCompletion,
    ctx: &MatchContext,
) -> OutcomeVerdict {
    let status = check_status(case, observed);
    let mut attempts = Vec::with_capacity(case.hypothesis_count());
    let mut matched = None;
    for (index, hypothesis) in case.hypotheses.iter().enumerate() {
        let result = attempt(index, hypothesis, &observed.counters, ctx);
        let passed = result.passed();
        attempts.push(result);
        if passed {
            matched = Some(index);
            break;
        }
    }

    if let Some(index) = matched {
        debug!(case = %case.source_tag, hypothesis = index, "counters matched");
    } else {
        warn!(
            case = %case.source_tag,
            hypotheses = case.hypothesis_count(),
            "no hypothesis matched observed counters"
        );
    }

    OutcomeVerdict {
        status,
        attempts,
        matched,
        counters: observed.counters,
        context: *ctx,
    }
}

/// Convenience wrapper over [`evaluate`].
#[must_use]
pub fn matches(case: &ScenarioCase, observed: &IoCompletion, ctx: &MatchContext) -> bool {
    evaluate(case, observed, ctx).passed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use faultline_types::{DeviceOpcode, FaultDefinition, IoOperation, IoQualifier};
    use proptest::prelude::*;

    const CTX: MatchContext = MatchContext::new(128, 12);

    fn completion(status: StatusPair, error_count: u32, counters: ErrorCounters) -> IoCompletion {
        IoCompletion {
            status: status.status,
            qualifier: status.qualifier,
            error_count,
            counters,
        }
    }

    fn retry_case() -> ScenarioCase {
        ScenarioCase::new("m-001", "retryable read", IoOperation::ReadCheck, 0, 0x80)
            .fault(FaultDefinition::retryable(DeviceOpcode::Read, 3, 0))
            .hypothesis(OutcomeHypothesis::zero().retryable(3))
    }

    fn any_family() -> impl Strategy<Value = CounterFamily> {
        prop::sample::select(CounterFamily::ALL.to_vec())
    }

    fn non_retry_families() -> impl Strategy<Value = CounterFamily> {
        prop::sample::select(
            CounterFamily::ALL
                .into_iter()
                .filter(|f| !matches!(f, CounterFamily::Retryable | CounterFamily::NonRetryable))
                .collect::<Vec<_>>(),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn any_accepts_everything(actual in any::<u32>(), family in any_family()) {
            prop_assert!(counter_matches(ExpectedCount::Any, actual, family, &CTX));
        }

        #[test]
        fn nonzero_rejects_only_zero(actual in any::<u32>(), family in any_family()) {
            prop_assert_eq!(
                counter_matches(ExpectedCount::NonZero, actual, family, &CTX),
                actual != 0
            );
        }

        #[test]
        fn single_fail_range_is_k_plus_minus_one(k in 1_u32..200, actual in 0_u32..500) {
            let ctx = MatchContext::new(128, k);
            let inside = actual + 1 >= k && actual <= k + 1;
            prop_assert_eq!(
                counter_matches(
                    ExpectedCount::RangeAroundSingleFail,
                    actual,
                    CounterFamily::Retryable,
                    &ctx
                ),
                inside,
                "k={} actual={}", k, actual
            );
        }

        #[test]
        fn double_fail_range_is_two_k_plus_minus_two(k in 1_u32..200, actual in 0_u32..800) {
            let ctx = MatchContext::new(128, k);
            let inside = actual + 2 >= 2 * k && actual <= 2 * k + 2;
            prop_assert_eq!(
                counter_matches(
                    ExpectedCount::RangeAroundDoubleFail,
                    actual,
                    CounterFamily::Retryable,
                    &ctx
                ),
                inside,
                "k={} actual={}", k, actual
            );
        }

        #[test]
        fn exact_off_by_one_only_for_retry_families(
            n in 0_u32..1000,
            family in non_retry_families(),
        ) {
            let exact = ExpectedCount::Exact(n);
            prop_assert!(counter_matches(exact, n, family, &CTX));
            prop_assert!(!counter_matches(exact, n + 1, family, &CTX), "family={}", family);
            prop_assert!(counter_matches(exact, n + 1, CounterFamily::Retryable, &CTX));
            prop_assert!(counter_matches(exact, n + 1, CounterFamily::NonRetryable, &CTX));
            prop_assert!(!counter_matches(exact, n + 2, CounterFamily::Retryable, &CTX));
        }
    }

    #[test]
    fn element_size_wildcard_tracks_context() {
        assert!(counter_matches(
            ExpectedCount::MatchesElementSize,
            128,
            CounterFamily::CorrectableMedia,
            &CTX
        ));
        assert!(!counter_matches(
            ExpectedCount::MatchesElementSize,
            64,
            CounterFamily::CorrectableMedia,
            &CTX
        ));
    }

    #[test]
    fn exact_tolerance_does_not_go_below() {
        assert!(!counter_matches(ExpectedCount::Exact(3), 2, CounterFamily::Retryable, &CTX));
        assert!(!counter_matches(
            ExpectedCount::Exact(u32::MAX),
            0,
            CounterFamily::Retryable,
            &CTX
        ));
    }

    #[test]
    fn first_matching_hypothesis_wins() {
        let case = retry_case()
            .hypothesis(OutcomeHypothesis::zero().retryable(ExpectedCount::Any))
            .hypothesis(OutcomeHypothesis::zero().retryable(4));
        let counters = ErrorCounters {
            retryable: 4,
            ..ErrorCounters::default()
        };
        let verdict = evaluate(&case, &completion(StatusPair::SUCCESS, 0, counters), &CTX);
        // h0 (exact 3) accepts 4 through the retry slack.
        assert_eq!(verdict.matched, Some(0));
        assert_eq!(verdict.attempts.len(), 1);
        assert!(verdict.passed());
    }

    #[test]
    fn later_hypothesis_matches_after_earlier_fail() {
        let case = retry_case().hypothesis(OutcomeHypothesis::zero().retryable(9).shutdown(1));
        let counters = ErrorCounters {
            retryable: 10,
            shutdown: 1,
            ..ErrorCounters::default()
        };
        let verdict = evaluate(&case, &completion(StatusPair::SUCCESS, 0, counters), &CTX);
        assert_eq!(verdict.matched, Some(1));
        assert_eq!(verdict.attempts.len(), 2);
        assert!(!verdict.attempts[0].passed());
    }

    #[test]
    fn no_match_reports_every_hypothesis() {
        let case = retry_case()
            .hypothesis(OutcomeHypothesis::zero().retryable(5))
            .hypothesis(OutcomeHypothesis::zero().retryable(7));
        let counters = ErrorCounters {
            retryable: 20,
            coherency: 1,
            ..ErrorCounters::default()
        };
        let verdict = evaluate(&case, &completion(StatusPair::SUCCESS, 0, counters), &CTX);
        assert_eq!(verdict.matched, None);
        assert_eq!(verdict.attempts.len(), case.hypothesis_count());
        assert!(!verdict.passed());
        for attempt in &verdict.attempts {
            assert!(attempt.mismatches.iter().any(|m| m.family == CounterFamily::Retryable));
            assert!(attempt.mismatches.iter().any(|m| m.family == CounterFamily::Coherency));
        }
        let report = verdict.render(&case);
        assert!(report.contains("no hypothesis matched"), "report={report}");
        assert!(report.contains("h2"), "report={report}");
        assert!(report.contains("coherency"), "report={report}");
    }

    #[test]
    fn status_must_be_declared() {
        let case = retry_case();
        let verdict = evaluate(
            &case,
            &completion(StatusPair::NOT_RETRYABLE, 1, ErrorCounters {
                retryable: 3,
                ..ErrorCounters::default()
            }),
            &CTX,
        );
        assert!(!verdict.status.status_ok);
        assert!(!verdict.status.error_count_ok);
        assert_eq!(verdict.matched, Some(0));
        assert!(!verdict.passed());
    }

    #[test]
    fn zero_error_count_tolerates_one_when_error_pair_declared() {
        let case = retry_case().expecting(0, &[StatusPair::SUCCESS, StatusPair::SHUTDOWN]);
        let counters = ErrorCounters {
            retryable: 3,
            ..ErrorCounters::default()
        };
        let verdict = evaluate(&case, &completion(StatusPair::SHUTDOWN, 1, counters), &CTX);
        assert!(verdict.status.passed(), "{:?}", verdict.status);

        let single = retry_case();
        let verdict = evaluate(
            &single,
            &IoCompletion {
                status: IoStatus::Success,
                qualifier: IoQualifier::None,
                error_count: 1,
                counters,
            },
            &CTX,
        );
        assert!(!verdict.status.error_count_ok);
    }

    #[test]
    fn zero_error_count_is_strict_without_a_success_pair() {
        let case = retry_case().expecting(0, &[StatusPair::SHUTDOWN, StatusPair::NOT_RETRYABLE]);
        let counters = ErrorCounters {
            retryable: 3,
            ..ErrorCounters::default()
        };
        let verdict = evaluate(&case, &completion(StatusPair::NOT_RETRYABLE, 1, counters), &CTX);
        assert!(verdict.status.status_ok);
        assert!(!verdict.status.error_count_ok, "{:?}", verdict.status);
        assert!(!verdict.passed());

        let success_only = retry_case().expecting(0, &[StatusPair::SUCCESS]);
        let verdict = evaluate(&success_only, &completion(StatusPair::SUCCESS, 1, counters), &CTX);
        assert!(!verdict.status.error_count_ok);
    }

    #[test]
    fn lost_last_copy_matches_shutdown_hypothesis() {
        let case = ScenarioCase::new(
            "m-002",
            "retryable reads fail the drive",
            IoOperation::ReadCheck,
            0,
            0x80,
        )
        .fault(FaultDefinition::retryable(DeviceOpcode::Read, 20, 0))
        .expecting(1, &[StatusPair::SHUTDOWN])
        .hypothesis(
            OutcomeHypothesis::zero()
                .retryable(ExpectedCount::Any)
                .non_retryable(ExpectedCount::Any)
                .shutdown(1),
        )
        .hypothesis(OutcomeHypothesis::zero().shutdown(0));
        let counters = ErrorCounters {
            retryable: 17,
            non_retryable: 0,
            shutdown: 1,
            ..ErrorCounters::default()
        };

        let verdict = evaluate(&case, &completion(StatusPair::SHUTDOWN, 1, counters), &CTX);
        assert_eq!(verdict.matched, Some(0));
        assert_eq!(verdict.attempts.len(), 1);
        assert!(verdict.passed(), "{}", verdict.render(&case));
    }
}
