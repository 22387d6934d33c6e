use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use prosegate_core::learner::fit;
use prosegate_core::scoring::composite;
use prosegate_core::solver;
use prosegate_core::types::AttemptScores;
use prosegate_core::{DetectionMethod, GenerationAttempt, GenerationParameters, Weights, readability};
use uuid::Uuid;

fn history(n: usize) -> Vec<GenerationAttempt> {
    (0..n)
        .map(|i| {
            let detection = (i * 37 % 100) as f64;
            GenerationAttempt {
                id: Uuid::new_v4(),
                request_id: Uuid::new_v4(),
                subject_key: format!("Subject{}", i % 25),
                component_type: "description".into(),
                attempt_number: 1,
                parameters: GenerationParameters::new(1).with("temperature", 0.8),
                content: String::new(),
                detection_score: detection,
                detection_method: DetectionMethod::Authoritative,
                subjective_score: (i * 53 % 11) as f64 * 0.9,
                readability_score: (i * 71 % 100) as f64,
                composite_score: 0.0,
                success: detection >= 70.0,
                exclusion_reason: None,
                created_at: Utc::now(),
            }
        })
        .collect()
}

fn bench_composite(c: &mut Criterion) {
    let weights = Weights::new(0.6, 0.3, 0.1).unwrap();
    let scores = AttemptScores {
        detection: 92.0,
        subjective: 8.5,
        readability: 95.0,
    };
    c.bench_function("composite_score", |b| {
        b.iter(|| composite(black_box(&scores), black_box(&weights)))
    });
}

fn bench_solver(c: &mut Criterion) {
    for n in [100usize, 1_000, 10_000] {
        let samples = history(n);
        c.bench_function(&format!("fit_weights_{n}"), |b| {
            b.iter(|| fit(black_box(&samples), 1e-10))
        });
    }

    let rows: Vec<[f64; 3]> = (0..1_000)
        .map(|i| {
            let x = i as f64 / 1_000.0;
            [x, 1.0 - x, (x * 7.0) % 1.0]
        })
        .collect();
    let targets: Vec<f64> = rows.iter().map(|r| 0.5 * r[0] + 0.5 * r[2]).collect();
    c.bench_function("simplex_solve_1000", |b| {
        b.iter(|| solver::solve(black_box(&rows), black_box(&targets), 1e-10))
    });
}

fn bench_readability(c: &mut Criterion) {
    let text = "Laser cleaning removes rust and paint without abrasives. \
                The oxide layer absorbs the pulse; the base metal reflects it. "
        .repeat(20);
    c.bench_function("readability_score", |b| {
        b.iter(|| readability::score(black_box(&text)))
    });
}

criterion_group!(benches, bench_composite, bench_solver, bench_readability);
criterion_main!(benches);
