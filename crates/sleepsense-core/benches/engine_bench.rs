use criterion::{criterion_group, criterion_main, Criterion};
use sleepsense_core::{
    analyze, evaluate, rules, FactRecord, LightLevel, MedicalIssue, NoiseLevel, StressLevel, YesNo,
};

fn mk_facts(index: u32) -> FactRecord {
    FactRecord {
        bedtime_consistent: if index % 2 == 0 { YesNo::No } else { YesNo::Yes },
        sleep_duration: f64::from(index % 10),
        caffeine_after_3pm: if index % 3 == 0 { YesNo::Yes } else { YesNo::No },
        alcohol_before_bed: if index % 5 == 0 { YesNo::Yes } else { YesNo::No },
        late_screen_time: (index * 7) % 180,
        daytime_nap_minutes: (index * 11) % 120,
        exercise_within_3hrs_of_bed: YesNo::No,
        noise_level: if index % 4 == 0 { NoiseLevel::High } else { NoiseLevel::Low },
        light_level: if index % 6 == 0 { LightLevel::Bright } else { LightLevel::Dim },
        stress_level: if index % 2 == 1 { StressLevel::High } else { StressLevel::Medium },
        room_temperature: 18.0 + f64::from(index % 10),
        uses_bed_for_work: YesNo::Yes,
        medical_issues: if index % 7 == 0 { MedicalIssue::Insomnia } else { MedicalIssue::None },
    }
}

fn bench_analyze(c: &mut Criterion) {
    let answers = (0..1_000).map(mk_facts).collect::<Vec<_>>();

    c.bench_function("analyze_1000_assessments", |b| {
        b.iter(|| {
            for facts in &answers {
                let result = analyze(facts);
                if result.meta.total_rules_evaluated != rules().len() {
                    panic!("analysis skipped part of the catalog");
                }
            }
        });
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let facts = mk_facts(1);

    c.bench_function("evaluate_single_assessment", |b| {
        b.iter(|| evaluate(rules(), &facts).len());
    });
}

criterion_group!(engine_benches, bench_analyze, bench_evaluate);
criterion_main!(engine_benches);
