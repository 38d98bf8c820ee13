use crate::{FactRecord, LightLevel, MedicalIssue, NoiseLevel, StressLevel, YesNo};

/// Rule whose firing means the user reported a condition that needs a clinician.
pub const MEDICAL_REFERRAL_RULE_ID: &str = "R13";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RuleFault {
    #[error("fact `{field}` is not a finite number")]
    NonFiniteFact { field: &'static str },
}

pub type Condition = fn(&FactRecord) -> Result<bool, RuleFault>;
pub type Explanation = fn(&FactRecord) -> String;

/// One condition/advice pair in the knowledge base.
#[derive(Clone, Copy)]
pub struct Rule {
    pub id: &'static str,
    /// Weight in `1..=10`; higher is more urgent.
    pub priority: u8,
    /// Declared estimate of how many sub-conditions `condition` covers, derived from the shape
    /// of the condition as authored (see [`estimate_complexity`]). It is not a count of facts
    /// that actually matched and only feeds the confidence score.
    pub complexity: u8,
    pub condition: Condition,
    pub recommendation: &'static str,
    pub explanation: Explanation,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("complexity", &self.complexity)
            .field("recommendation", &self.recommendation)
            .finish_non_exhaustive()
    }
}

/// Estimate the number of sub-conditions a rule covers from its conjunction and disjunction
/// joins: `conjunctions + 1 + disjunctions / 2`, never below 1.
#[must_use]
pub const fn estimate_complexity(conjunctions: u8, disjunctions: u8) -> u8 {
    let estimate = conjunctions + 1 + disjunctions / 2;
    if estimate < 1 {
        1
    } else {
        estimate
    }
}

/// The built-in knowledge base, in evaluation order.
pub static RULES: [Rule; 18] = [
    Rule {
        id: "R1",
        priority: 9,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.bedtime_consistent == YesNo::No),
        recommendation: "Try going to bed and waking up at the same time every day (±30 minutes).",
        explanation: |_| {
            "Your irregular bedtime schedule disrupts your circadian rhythm. Consistency is key \
             for quality sleep."
                .to_string()
        },
    },
    Rule {
        id: "R2",
        priority: 10,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.sleep_hours()? < 7.0),
        recommendation: "Aim for 7–9 hours of sleep nightly.",
        explanation: |facts| {
            format!(
                "You're currently getting {} hours of sleep, which is below the recommended 7-9 \
                 hours for optimal health and cognitive function.",
                facts.sleep_duration
            )
        },
    },
    Rule {
        id: "R3",
        priority: 8,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.caffeine_after_3pm == YesNo::Yes),
        recommendation: "Avoid caffeine after 3 PM; switch to decaf in the afternoon.",
        explanation: |_| {
            "Caffeine has a half-life of 5-6 hours. Consuming it after 3 PM can significantly \
             interfere with your ability to fall asleep."
                .to_string()
        },
    },
    Rule {
        id: "R4",
        priority: 7,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.alcohol_before_bed == YesNo::Yes),
        recommendation: "Avoid alcohol within 3 hours of bedtime — it fragments sleep.",
        explanation: |_| {
            "While alcohol may help you fall asleep initially, it disrupts REM sleep and causes \
             fragmented, poor-quality sleep later in the night."
                .to_string()
        },
    },
    Rule {
        id: "R5",
        priority: 8,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.late_screen_time >= 60),
        recommendation: "Stop using screens at least 60 minutes before bed or use blue-light filters.",
        explanation: |facts| {
            format!(
                "You're using screens {} minutes before bed. Blue light from screens suppresses \
                 melatonin production, making it harder to fall asleep.",
                facts.late_screen_time
            )
        },
    },
    Rule {
        id: "R6",
        priority: 7,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.daytime_nap_minutes >= 45),
        recommendation: "Limit naps to 20–30 minutes and avoid late-afternoon naps.",
        explanation: |facts| {
            format!(
                "Your {}-minute naps may be reducing your sleep drive. Long naps can interfere \
                 with nighttime sleep quality.",
                facts.daytime_nap_minutes
            )
        },
    },
    Rule {
        id: "R7",
        priority: 6,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.exercise_within_3hrs_of_bed == YesNo::Yes),
        recommendation: "Finish vigorous exercise at least 3 hours before bedtime.",
        explanation: |_| {
            "Exercise raises body temperature and adrenaline levels. Your body needs time to cool \
             down and relax before sleep."
                .to_string()
        },
    },
    Rule {
        id: "R8",
        priority: 8,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.noise_level == NoiseLevel::High),
        recommendation: "Use earplugs or white noise to reduce disruptive sounds.",
        explanation: |_| {
            "High noise levels can prevent you from reaching deep sleep stages and cause frequent \
             awakenings throughout the night."
                .to_string()
        },
    },
    Rule {
        id: "R9",
        priority: 8,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.light_level == LightLevel::Bright),
        recommendation: "Make the bedroom dark; blackout curtains or eye masks help.",
        explanation: |_| {
            "Bright light in your bedroom suppresses melatonin production. Darkness signals your \
             brain that it's time to sleep."
                .to_string()
        },
    },
    Rule {
        id: "R10",
        priority: 9,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.stress_level == StressLevel::High),
        recommendation:
            "Practice relaxation (deep breathing, progressive muscle relaxation) before bed.",
        explanation: |_| {
            "High stress levels activate your fight-or-flight response, making it difficult to \
             relax and fall asleep. Relaxation techniques can help calm your nervous system."
                .to_string()
        },
    },
    Rule {
        id: "R11",
        priority: 7,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.room_celsius()? > 24.0),
        recommendation: "Keep bedroom temperature between 16–20°C for better sleep.",
        explanation: |facts| {
            format!(
                "Your room temperature of {}°C is too warm. Core body temperature needs to drop \
                 for sleep onset. The ideal sleep temperature is 16-20°C.",
                facts.room_temperature
            )
        },
    },
    Rule {
        id: "R12",
        priority: 6,
        complexity: estimate_complexity(0, 0),
        condition: |facts| Ok(facts.uses_bed_for_work == YesNo::Yes),
        recommendation: "Use the bed only for sleep and intimacy; avoid working in bed.",
        explanation: |_| {
            "Using your bed for work creates a mental association between your bed and alertness, \
             making it harder to relax and sleep there."
                .to_string()
        },
    },
    Rule {
        id: MEDICAL_REFERRAL_RULE_ID,
        priority: 10,
        complexity: estimate_complexity(0, 1),
        condition: |facts| {
            Ok(matches!(facts.medical_issues, MedicalIssue::SleepApnea | MedicalIssue::Insomnia))
        },
        recommendation: "Consult a healthcare professional for diagnosis and treatment options.",
        explanation: |facts| {
            let condition = if facts.medical_issues == MedicalIssue::SleepApnea {
                "sleep apnea"
            } else {
                "insomnia"
            };
            format!(
                "You've indicated {condition}, which requires professional medical evaluation and \
                 treatment. This app provides general advice but cannot replace medical care."
            )
        },
    },
    Rule {
        id: "R14",
        priority: 6,
        complexity: estimate_complexity(1, 0),
        condition: |facts| {
            Ok(facts.bedtime_consistent == YesNo::No && facts.light_level != LightLevel::Dark)
        },
        recommendation: "Increase daytime bright light exposure and dim lights in the evening.",
        explanation: |_| {
            "Your inconsistent schedule combined with improper light exposure is confusing your \
             circadian rhythm. Bright light during the day and dim light in evening helps \
             regulate your sleep-wake cycle."
                .to_string()
        },
    },
    Rule {
        id: "R15",
        priority: 9,
        complexity: estimate_complexity(1, 0),
        condition: |facts| {
            Ok(facts.late_screen_time >= 60 && facts.caffeine_after_3pm == YesNo::Yes)
        },
        recommendation: "Both screen exposure and late caffeine are harming your sleep — avoid \
                         both in the evening.",
        explanation: |facts| {
            format!(
                "You have two major sleep disruptors working against you: screens {} minutes \
                 before bed AND afternoon caffeine. Eliminating both will significantly improve \
                 your sleep quality.",
                facts.late_screen_time
            )
        },
    },
    Rule {
        id: "R16",
        priority: 9,
        complexity: estimate_complexity(1, 0),
        condition: |facts| Ok(facts.sleep_hours()? < 6.0 && facts.stress_level == StressLevel::High),
        recommendation: "Combine sleep extension strategies with stress management and consider \
                         counseling if persistent.",
        explanation: |facts| {
            format!(
                "You're only getting {} hours of sleep and experiencing high stress. This creates \
                 a vicious cycle: stress prevents sleep, and lack of sleep increases stress. \
                 Professional support may be beneficial.",
                facts.sleep_duration
            )
        },
    },
    Rule {
        id: "R17",
        priority: 8,
        complexity: estimate_complexity(1, 0),
        condition: |facts| Ok(facts.daytime_nap_minutes >= 45 && facts.sleep_hours()? < 7.0),
        recommendation: "Reduce long naps; improving night sleep should reduce daytime sleepiness.",
        explanation: |facts| {
            format!(
                "Your {}-minute naps are likely compensating for only {} hours of night sleep. \
                 This creates a cycle where naps reduce nighttime sleep drive.",
                facts.daytime_nap_minutes, facts.sleep_duration
            )
        },
    },
    Rule {
        id: "R18",
        priority: 8,
        complexity: estimate_complexity(0, 2),
        condition: |facts| {
            Ok(facts.noise_level == NoiseLevel::High
                || facts.light_level == LightLevel::Bright
                || facts.room_celsius()? > 24.0)
        },
        recommendation: "Address bedroom environment: optimize noise, light, and temperature.",
        explanation: |facts| {
            let mut issues = Vec::new();
            if facts.noise_level == NoiseLevel::High {
                issues.push("high noise".to_string());
            }
            if facts.light_level == LightLevel::Bright {
                issues.push("bright light".to_string());
            }
            if facts.room_temperature > 24.0 {
                issues.push(format!("warm temperature ({}°C)", facts.room_temperature));
            }
            format!(
                "Your bedroom environment has suboptimal conditions: {}. Creating an ideal sleep \
                 environment is fundamental to good sleep hygiene.",
                issues.join(", ")
            )
        },
    },
];

#[must_use]
pub fn rules() -> &'static [Rule] {
    &RULES
}

#[must_use]
pub fn rule_by_id(id: &str) -> Option<&'static Rule> {
    RULES.iter().find(|rule| rule.id == id)
}

#[must_use]
pub fn all_rule_ids() -> Vec<&'static str> {
    RULES.iter().map(|rule| rule.id).collect()
}
