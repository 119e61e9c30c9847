//! Classifier output parsing
//!
//! The classifier prints free-form log lines; the only ones that matter look
//! like `Prediction: smoke (92.5%)`. Everything else is chatter.

use std::sync::OnceLock;

use regex::Regex;

use ew_protocol::{is_verdict_candidate, VERDICT_MARKER};

use crate::constants::debounce;

/// Outcome of one classifier verdict line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerdictLabel {
    Smoke,
    NoSmoke,
    Unparsable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierVerdict {
    pub label: VerdictLabel,
    /// 0.0-1.0; always 0.0 for `Unparsable`
    pub confidence: f64,
}

impl ClassifierVerdict {
    pub fn unparsable() -> Self {
        Self {
            label: VerdictLabel::Unparsable,
            confidence: 0.0,
        }
    }

    /// Counts toward the debounce run
    pub fn is_qualifying_smoke(&self) -> bool {
        self.label == VerdictLabel::Smoke && self.confidence >= debounce::CONFIDENCE_CUTOFF
    }
}

fn verdict_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // Label is everything up to the first '(' and the percentage is
        // whatever sits between that '(' and "%)".
        Regex::new(&format!(
            r"{}\s*([^(]*?)\s*\(([^)]*?)%\)",
            regex::escape(VERDICT_MARKER)
        ))
        .ok()
    })
    .as_ref()
}

/// Parse one line of classifier output.
///
/// Returns `None` for lines that are not verdicts at all.
pub fn parse_verdict(line: &str) -> Option<ClassifierVerdict> {
    if !is_verdict_candidate(line) {
        return None;
    }

    let Some(caps) = verdict_regex().and_then(|re| re.captures(line)) else {
        return Some(ClassifierVerdict::unparsable());
    };
    let label = caps.get(1).map_or("", |m| m.as_str().trim());
    let raw_pct = caps.get(2).map_or("", |m| m.as_str().trim());

    let percent = match raw_pct.parse::<f64>() {
        Ok(p) if p.is_finite() && (0.0..=100.0).contains(&p) => p,
        _ => return Some(ClassifierVerdict::unparsable()),
    };
    let confidence = percent / 100.0;

    let label = if label == "smoke" && confidence >= debounce::CONFIDENCE_CUTOFF {
        VerdictLabel::Smoke
    } else {
        VerdictLabel::NoSmoke
    };

    Some(ClassifierVerdict { label, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(line: &str) -> ClassifierVerdict {
        parse_verdict(line).expect("line should be a verdict")
    }

    #[test]
    fn test_confident_smoke() {
        let v = parsed("Prediction: smoke (92.5%)");
        assert_eq!(v.label, VerdictLabel::Smoke);
        assert!((v.confidence - 0.925).abs() < 1e-9);
        assert!(v.is_qualifying_smoke());
    }

    #[test]
    fn test_low_confidence_smoke_is_negative() {
        let v = parsed("Prediction: smoke (50%)");
        assert_eq!(v.label, VerdictLabel::NoSmoke);
        assert!((v.confidence - 0.5).abs() < 1e-9);
        assert!(!v.is_qualifying_smoke());
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        assert_eq!(parsed("Prediction: smoke (80%)").label, VerdictLabel::Smoke);
        assert_eq!(parsed("Prediction: smoke (79.99%)").label, VerdictLabel::NoSmoke);
    }

    #[test]
    fn test_other_labels_are_negative() {
        let v = parsed("Prediction: no_smoke (99%)");
        assert_eq!(v.label, VerdictLabel::NoSmoke);
        assert_eq!(parsed("Prediction: Smoke (99%)").label, VerdictLabel::NoSmoke);
        assert_eq!(parsed("Prediction: smoke detected (99%)").label, VerdictLabel::NoSmoke);
    }

    #[test]
    fn test_noise_is_not_a_verdict() {
        assert_eq!(parse_verdict("some log noise"), None);
        assert_eq!(parse_verdict(""), None);
        assert_eq!(parse_verdict("Loading model weights (45%)"), None);
    }

    #[test]
    fn test_malformed_numbers_are_unparsable() {
        assert_eq!(parsed("Prediction: smoke (abc%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (NaN%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (inf%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (150%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (-5%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (%)").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction: smoke (abc%)").confidence, 0.0);
    }

    #[test]
    fn test_marker_without_percentage_is_unparsable() {
        assert_eq!(parsed("Prediction: smoke").label, VerdictLabel::Unparsable);
        assert_eq!(parsed("Prediction:").label, VerdictLabel::Unparsable);
    }

    #[test]
    fn test_surrounding_text_and_spacing() {
        let v = parsed("[12:00:01] Prediction:   smoke   ( 91 %) frame=42");
        assert_eq!(v.label, VerdictLabel::Smoke);
        assert!((v.confidence - 0.91).abs() < 1e-9);

        let tight = parsed("Prediction:smoke(100%)");
        assert_eq!(tight.label, VerdictLabel::Smoke);
        assert_eq!(tight.confidence, 1.0);
    }
}
