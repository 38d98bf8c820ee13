//! Rule evaluation and recommendation engine for self-reported sleep-hygiene facts.
//!
//! One call to [`analyze`] runs every rule of the knowledge base once against a
//! [`FactRecord`], merges fired rules that give the same advice, scores and ranks the merged
//! recommendations, and reports the fired-rule trace plus run metrics.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

mod rules;

pub use rules::{
    all_rule_ids, estimate_complexity, rule_by_id, rules, Condition, Explanation, Rule, RuleFault,
    MEDICAL_REFERRAL_RULE_ID, RULES,
};

const CONFIDENCE_BASE: f64 = 0.5;
const CONFIDENCE_PER_PRIORITY: f64 = 0.05;
const CONFIDENCE_PER_CONDITION: f64 = 0.1;
const MAX_SLEEP_HOURS: f64 = 24.0;
const MINUTES_PER_DAY: u32 = 1_440;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum YesNo {
    Yes,
    No,
}

impl YesNo {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "yes" => Some(Self::Yes),
            "no" => Some(Self::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoiseLevel {
    Low,
    Medium,
    High,
}

impl NoiseLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LightLevel {
    Dark,
    Dim,
    Bright,
}

impl LightLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dark => "dark",
            Self::Dim => "dim",
            Self::Bright => "bright",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dark" => Some(Self::Dark),
            "dim" => Some(Self::Dim),
            "bright" => Some(Self::Bright),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StressLevel {
    Low,
    Medium,
    High,
}

impl StressLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MedicalIssue {
    None,
    Insomnia,
    SleepApnea,
    Other,
}

impl MedicalIssue {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Insomnia => "insomnia",
            Self::SleepApnea => "sleep_apnea",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "insomnia" => Some(Self::Insomnia),
            "sleep_apnea" => Some(Self::SleepApnea),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// The caller's answers to the assessment, one field per question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactRecord {
    pub bedtime_consistent: YesNo,
    /// Hours of sleep per night.
    pub sleep_duration: f64,
    pub caffeine_after_3pm: YesNo,
    pub alcohol_before_bed: YesNo,
    /// Minutes of screen use before bed.
    pub late_screen_time: u32,
    pub daytime_nap_minutes: u32,
    pub exercise_within_3hrs_of_bed: YesNo,
    pub noise_level: NoiseLevel,
    pub light_level: LightLevel,
    pub stress_level: StressLevel,
    /// Bedroom temperature in degrees Celsius.
    pub room_temperature: f64,
    pub uses_bed_for_work: YesNo,
    pub medical_issues: MedicalIssue,
}

impl Default for FactRecord {
    /// The answer set the assessment form starts from.
    fn default() -> Self {
        Self {
            bedtime_consistent: YesNo::Yes,
            sleep_duration: 7.0,
            caffeine_after_3pm: YesNo::No,
            alcohol_before_bed: YesNo::No,
            late_screen_time: 30,
            daytime_nap_minutes: 0,
            exercise_within_3hrs_of_bed: YesNo::No,
            noise_level: NoiseLevel::Low,
            light_level: LightLevel::Dark,
            stress_level: StressLevel::Medium,
            room_temperature: 20.0,
            uses_bed_for_work: YesNo::No,
            medical_issues: MedicalIssue::None,
        }
    }
}

impl FactRecord {
    /// Check numeric answers against their declared domains.
    ///
    /// The engine itself never calls this; [`analyze`] accepts any record and lets individual
    /// rules fault on values they cannot compare.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when a real-valued field is not finite or a numeric
    /// field is outside its domain.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.sleep_duration.is_finite() {
            return Err(EngineError::Validation(
                "sleep_duration MUST be a finite number of hours".to_string(),
            ));
        }

        if !(0.0..=MAX_SLEEP_HOURS).contains(&self.sleep_duration) {
            return Err(EngineError::Validation(
                "sleep_duration MUST be within [0, 24] hours".to_string(),
            ));
        }

        if !self.room_temperature.is_finite() {
            return Err(EngineError::Validation(
                "room_temperature MUST be a finite number of degrees Celsius".to_string(),
            ));
        }

        for (field, minutes) in [
            ("late_screen_time", self.late_screen_time),
            ("daytime_nap_minutes", self.daytime_nap_minutes),
        ] {
            if minutes > MINUTES_PER_DAY {
                return Err(EngineError::Validation(format!(
                    "{field} MUST NOT exceed {MINUTES_PER_DAY} minutes"
                )));
            }
        }

        Ok(())
    }

    /// Sleep duration for numeric comparisons in rule conditions.
    ///
    /// # Errors
    /// Returns [`RuleFault::NonFiniteFact`] when the value is NaN or infinite.
    pub fn sleep_hours(&self) -> Result<f64, RuleFault> {
        finite(self.sleep_duration, "sleep_duration")
    }

    /// Room temperature for numeric comparisons in rule conditions.
    ///
    /// # Errors
    /// Returns [`RuleFault::NonFiniteFact`] when the value is NaN or infinite.
    pub fn room_celsius(&self) -> Result<f64, RuleFault> {
        finite(self.room_temperature, "room_temperature")
    }
}

fn finite(value: f64, field: &'static str) -> Result<f64, RuleFault> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RuleFault::NonFiniteFact { field })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FiredRule {
    pub rule_id: String,
    pub priority: u8,
    pub conditions_matched: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Critical,
    High,
    Medium,
    Low,
}

impl Category {
    #[must_use]
    pub fn from_priority(priority: u8) -> Self {
        if priority >= 9 {
            Self::Critical
        } else if priority >= 7 {
            Self::High
        } else if priority >= 5 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub text: String,
    pub priority: u8,
    pub confidence: f64,
    /// Ids of every rule merged into this recommendation, in evaluation order.
    pub fired_rules: Vec<String>,
    pub explanation: String,
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMeta {
    pub inference_time_ms: f64,
    pub total_rules_evaluated: usize,
    pub rules_matched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub recommendations: Vec<Recommendation>,
    pub fired_rules: Vec<FiredRule>,
    pub meta: AnalysisMeta,
}

/// Audit envelope pairing one assessment with its analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub input: FactRecord,
    pub analysis: AnalysisResult,
}

impl ExportRecord {
    /// Render the envelope as indented JSON for download.
    ///
    /// # Errors
    /// Returns an error when serialization fails.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run id from its canonical ULID text.
    ///
    /// # Errors
    /// Returns [`EngineError::Validation`] when `value` is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self, EngineError> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| EngineError::Validation(format!("invalid run id {value}: {err}")))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One persisted analysis, as kept in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRun {
    pub id: RunId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// `sha256:<hex>` of the canonical input JSON.
    pub input_digest: String,
    pub input: FactRecord,
    pub output: AnalysisResult,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Fired(FiredRule),
    NotMatched,
    Failed(RuleFault),
}

/// What happened to one rule during a pass.
#[derive(Debug, Clone)]
pub struct RuleEvaluation<'r> {
    pub rule: &'r Rule,
    pub outcome: RuleOutcome,
}

impl RuleEvaluation<'_> {
    #[must_use]
    pub fn fired(&self) -> Option<&FiredRule> {
        match &self.outcome {
            RuleOutcome::Fired(fired) => Some(fired),
            RuleOutcome::NotMatched | RuleOutcome::Failed(_) => None,
        }
    }
}

/// Fired rules sharing one advice text, before scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationGroup {
    pub text: String,
    pub priority: u8,
    pub fired_rule_ids: Vec<String>,
    pub explanations: Vec<String>,
    pub conditions_matched: Vec<u8>,
}

impl RecommendationGroup {
    #[must_use]
    pub fn average_conditions_matched(&self) -> f64 {
        if self.conditions_matched.is_empty() {
            return 0.0;
        }
        let total: f64 = self.conditions_matched.iter().copied().map(f64::from).sum();
        #[allow(clippy::cast_precision_loss)]
        let count = self.conditions_matched.len() as f64;
        total / count
    }

    /// Explanation of the first-evaluated member; the rest are kept for tracing only.
    #[must_use]
    pub fn explanation(&self) -> &str {
        self.explanations.first().map_or("", String::as_str)
    }
}

/// Run every rule once, in order, against `facts`.
///
/// A rule whose condition faults is logged and reported as [`RuleOutcome::Failed`]; it never
/// stops the pass.
#[must_use]
pub fn evaluate<'r>(rules: &'r [Rule], facts: &FactRecord) -> Vec<RuleEvaluation<'r>> {
    rules
        .iter()
        .map(|rule| {
            let outcome = match (rule.condition)(facts) {
                Ok(true) => RuleOutcome::Fired(FiredRule {
                    rule_id: rule.id.to_string(),
                    priority: rule.priority,
                    conditions_matched: rule.complexity.max(1),
                }),
                Ok(false) => RuleOutcome::NotMatched,
                Err(fault) => {
                    tracing::warn!(rule_id = rule.id, %fault, "skipping rule that failed to evaluate");
                    RuleOutcome::Failed(fault)
                }
            };
            RuleEvaluation { rule, outcome }
        })
        .collect()
}

/// Merge fired rules by their exact advice text.
///
/// The merge key is the display text itself: two rules with identical wording collapse into
/// one recommendation even when they describe different problems.
#[must_use]
pub fn aggregate(evaluations: &[RuleEvaluation<'_>], facts: &FactRecord) -> Vec<RecommendationGroup> {
    let mut groups: Vec<RecommendationGroup> = Vec::new();
    let mut index_by_text: BTreeMap<&str, usize> = BTreeMap::new();

    for evaluation in evaluations {
        let Some(fired) = evaluation.fired() else {
            continue;
        };
        let rule = evaluation.rule;
        let explanation = (rule.explanation)(facts);

        if let Some(&index) = index_by_text.get(rule.recommendation) {
            let group = &mut groups[index];
            group.priority = group.priority.max(fired.priority);
            group.fired_rule_ids.push(fired.rule_id.clone());
            group.explanations.push(explanation);
            group.conditions_matched.push(fired.conditions_matched);
            continue;
        }

        index_by_text.insert(rule.recommendation, groups.len());
        groups.push(RecommendationGroup {
            text: rule.recommendation.to_string(),
            priority: fired.priority,
            fired_rule_ids: vec![fired.rule_id.clone()],
            explanations: vec![explanation],
            conditions_matched: vec![fired.conditions_matched],
        });
    }

    groups
}

/// `min(1.0, round2(0.5 + 0.05 * priority + 0.1 * conditions_matched))`.
#[must_use]
pub fn calculate_confidence(priority: u8, conditions_matched: f64) -> f64 {
    let confidence = CONFIDENCE_BASE
        + CONFIDENCE_PER_PRIORITY * f64::from(priority)
        + CONFIDENCE_PER_CONDITION * conditions_matched;
    round2(confidence).min(1.0)
}

/// Attach confidence and category; the id is assigned by [`rank`].
#[must_use]
pub fn score(group: RecommendationGroup) -> Recommendation {
    let confidence = calculate_confidence(group.priority, group.average_conditions_matched());
    let category = Category::from_priority(group.priority);
    let explanation = group.explanation().to_string();

    Recommendation {
        id: String::new(),
        text: group.text,
        priority: group.priority,
        confidence,
        fired_rules: group.fired_rule_ids,
        explanation,
        category,
    }
}

fn first_fired_rule(recommendation: &Recommendation) -> &str {
    recommendation.fired_rules.first().map_or("", String::as_str)
}

fn presentation_order(lhs: &Recommendation, rhs: &Recommendation) -> Ordering {
    rhs.priority
        .cmp(&lhs.priority)
        .then_with(|| first_fired_rule(lhs).cmp(first_fired_rule(rhs)))
}

/// Stable sort by priority desc, then first fired-rule id as a plain string ("R10" < "R2"),
/// then number the result `REC-1..`.
#[must_use]
pub fn rank(mut recommendations: Vec<Recommendation>) -> Vec<Recommendation> {
    recommendations.sort_by(presentation_order);
    for (index, recommendation) in recommendations.iter_mut().enumerate() {
        recommendation.id = format!("REC-{}", index + 1);
    }
    recommendations
}

/// Analyze one fact record against the built-in knowledge base.
#[must_use]
pub fn analyze(facts: &FactRecord) -> AnalysisResult {
    analyze_with_rules(rules(), facts)
}

/// Analyze one fact record against an arbitrary catalog.
#[must_use]
pub fn analyze_with_rules(rules: &[Rule], facts: &FactRecord) -> AnalysisResult {
    let started = Instant::now();

    let evaluations = evaluate(rules, facts);
    let fired_rules = evaluations.iter().filter_map(RuleEvaluation::fired).cloned().collect::<Vec<_>>();
    let recommendations = rank(aggregate(&evaluations, facts).into_iter().map(score).collect());

    let inference_time_ms = round2(started.elapsed().as_secs_f64() * 1_000.0);
    tracing::debug!(
        rules_evaluated = rules.len(),
        rules_matched = fired_rules.len(),
        recommendations = recommendations.len(),
        inference_time_ms,
        "sleep hygiene analysis complete"
    );

    AnalysisResult {
        recommendations,
        meta: AnalysisMeta {
            inference_time_ms,
            total_rules_evaluated: rules.len(),
            rules_matched: fired_rules.len(),
        },
        fired_rules,
    }
}

/// The first `n` recommendations of an already ranked result.
#[must_use]
pub fn top_priority(result: &AnalysisResult, n: usize) -> &[Recommendation] {
    let end = n.min(result.recommendations.len());
    &result.recommendations[..end]
}

/// Whether any recommendation was produced by the medical-referral rule.
#[must_use]
pub fn requires_medical_attention(result: &AnalysisResult) -> bool {
    result.recommendations.iter().any(|recommendation| {
        recommendation.fired_rules.iter().any(|rule_id| rule_id == MEDICAL_REFERRAL_RULE_ID)
    })
}

/// Wrap an assessment and its analysis in an audit envelope stamped with the current time.
#[must_use]
pub fn export_record(facts: &FactRecord, result: &AnalysisResult) -> ExportRecord {
    export_record_at(facts, result, OffsetDateTime::now_utc())
}

#[must_use]
pub fn export_record_at(
    facts: &FactRecord,
    result: &AnalysisResult,
    timestamp: OffsetDateTime,
) -> ExportRecord {
    ExportRecord { timestamp, input: facts.clone(), analysis: result.clone() }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
