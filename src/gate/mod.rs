// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 gantry contributors

//! Gate evaluation
//!
//! Turns a stage's findings into a pass, advisory or blocking verdict.
//! Policies are per stage, so one scan can block while another only
//! reports.

use serde::{Deserialize, Deserializer, Serialize};

use crate::executors::StageResult;

/// Finding severity, ordered from most to least severe
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

// Scanners disagree on casing and naming ("HIGH", "moderate", "negligible")
impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Info => write!(f, "info"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" | "moderate" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" | "negligible" | "unknown" => Ok(Self::Info),
            other => Err(format!("Unknown severity: {}", other)),
        }
    }
}

/// A single scanner finding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub id: String,
}

impl Finding {
    pub fn new(severity: Severity, id: impl Into<String>) -> Self {
        Self {
            severity,
            id: id.into(),
        }
    }
}

/// Threshold set for one stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GatePolicy {
    /// Severities that count toward the blocking threshold.
    ///
    /// Accepts a list or a pipe-separated string such as `"critical|high"`.
    #[serde(deserialize_with = "deserialize_severities")]
    pub block_on: Vec<Severity>,

    /// Blocking findings tolerated before the gate turns fatal
    #[serde(default)]
    pub max_count: usize,
}

impl GatePolicy {
    pub fn new(block_on: Vec<Severity>, max_count: usize) -> Self {
        Self { block_on, max_count }
    }

    /// Policy that never blocks and only records findings
    pub fn advisory() -> Self {
        Self {
            block_on: Vec::new(),
            max_count: 0,
        }
    }
}

fn deserialize_severities<'de, D>(deserializer: D) -> Result<Vec<Severity>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    let parts = match Raw::deserialize(deserializer)? {
        Raw::Joined(s) => s.split('|').map(str::to_string).collect::<Vec<_>>(),
        Raw::List(v) => v,
    };

    parts
        .iter()
        .filter(|p| !p.trim().is_empty())
        .map(|p| p.parse::<Severity>().map_err(serde::de::Error::custom))
        .collect()
}

/// Outcome of evaluating a stage against its gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    /// Findings exist but stay within the threshold
    AdvisoryFail { findings: usize },
    /// Blocking findings exceed the threshold
    Fatal { blocking: usize, max_count: usize },
}

impl GateVerdict {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Gate evaluator
pub struct GateEvaluator;

impl GateEvaluator {
    /// Evaluate a stage result against its policy.
    ///
    /// Stages without a policy always pass.
    pub fn evaluate(result: &StageResult, policy: Option<&GatePolicy>) -> GateVerdict {
        match policy {
            Some(policy) => Self::evaluate_findings(&result.findings, policy),
            None => GateVerdict::Pass,
        }
    }

    /// Evaluate raw findings against a policy
    pub fn evaluate_findings(findings: &[Finding], policy: &GatePolicy) -> GateVerdict {
        let blocking = findings
            .iter()
            .filter(|f| policy.block_on.contains(&f.severity))
            .count();

        if blocking > policy.max_count {
            GateVerdict::Fatal {
                blocking,
                max_count: policy.max_count,
            }
        } else if !findings.is_empty() {
            GateVerdict::AdvisoryFail {
                findings: findings.len(),
            }
        } else {
            GateVerdict::Pass
        }
    }
}

/// Parse a JSON findings report.
///
/// Accepts either a bare array of findings or an object with a `findings`
/// array.
pub fn parse_report(bytes: &[u8]) -> Result<Vec<Finding>, crate::GantryError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Report {
        Bare(Vec<Finding>),
        Wrapped { findings: Vec<Finding> },
    }

    let report: Report = serde_json::from_slice(bytes)?;
    Ok(match report {
        Report::Bare(findings) | Report::Wrapped { findings } => findings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn high_blocking() -> GatePolicy {
        GatePolicy::new(vec![Severity::Critical, Severity::High], 0)
    }

    #[test]
    fn test_no_findings_pass() {
        assert_eq!(
            GateEvaluator::evaluate_findings(&[], &high_blocking()),
            GateVerdict::Pass
        );
    }

    #[test]
    fn test_blocking_severity_over_threshold_is_fatal() {
        let findings = vec![Finding::new(Severity::High, "CVE-2024-0001")];
        assert_eq!(
            GateEvaluator::evaluate_findings(&findings, &high_blocking()),
            GateVerdict::Fatal {
                blocking: 1,
                max_count: 0
            }
        );
    }

    #[test]
    fn test_findings_below_threshold_are_advisory() {
        let findings = vec![
            Finding::new(Severity::Low, "CVE-2024-0002"),
            Finding::new(Severity::Medium, "CVE-2024-0003"),
        ];
        assert_eq!(
            GateEvaluator::evaluate_findings(&findings, &high_blocking()),
            GateVerdict::AdvisoryFail { findings: 2 }
        );

        let tolerant = GatePolicy::new(vec![Severity::High], 2);
        let findings = vec![
            Finding::new(Severity::High, "a"),
            Finding::new(Severity::High, "b"),
        ];
        assert_eq!(
            GateEvaluator::evaluate_findings(&findings, &tolerant),
            GateVerdict::AdvisoryFail { findings: 2 }
        );
    }

    #[test]
    fn test_advisory_policy_never_blocks() {
        let findings = vec![Finding::new(Severity::Critical, "CVE-2024-0004")];
        let verdict = GateEvaluator::evaluate_findings(&findings, &GatePolicy::advisory());
        assert!(!verdict.is_blocking());
    }

    #[test]
    fn test_block_on_accepts_list_and_string() {
        let from_list: GatePolicy =
            serde_yaml::from_str("block_on: [critical, high]\nmax_count: 1").unwrap();
        let from_string: GatePolicy = serde_yaml::from_str("block_on: \"critical|high\"").unwrap();

        assert_eq!(from_list.block_on, from_string.block_on);
        assert_eq!(from_list.max_count, 1);
        assert_eq!(from_string.max_count, 0);
        assert!(serde_yaml::from_str::<GatePolicy>("block_on: severe").is_err());
    }

    #[test]
    fn test_parse_report_shapes() {
        let bare = br#"[{"severity": "high", "id": "CVE-1"}]"#;
        let wrapped = br#"{"findings": [{"severity": "LOW", "id": "CVE-2"}]}"#;

        assert_eq!(parse_report(bare).unwrap()[0].severity, Severity::High);

        let findings = parse_report(wrapped).unwrap();
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[0].id, "CVE-2");

        assert!(parse_report(br#"[{"severity": "severe", "id": "x"}]"#).is_err());
    }
}
