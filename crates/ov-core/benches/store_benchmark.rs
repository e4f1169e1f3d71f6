//! Store and router benchmarks
//!
//! Measures the hot paths hit on every reconciliation:
//! - task completion with agent rollup
//! - session finish with rollup across agents
//! - routing and tier selection
//! - command repetition scans

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use ov_core::patterns::PatternDetector;
use ov_core::router::{TaskRouter, TaskSpec};
use ov_core::store::{NewAgent, NewSession, NewTask, SessionOutcome, SessionStatus, Store, TaskOutcome};

fn seeded_store() -> (Store, i64, i64) {
    let store = Store::in_memory().unwrap();
    let team = store.create_team("engineering", "software", None).unwrap();
    let agent = store
        .create_agent(&NewAgent::new(team.id, "builder", "backend engineer"))
        .unwrap();
    (store, team.id, agent.id)
}

fn bench_task_completion(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_completion");

    group.bench_function("complete_task_with_rollup", |b| {
        let (store, team_id, agent_id) = seeded_store();
        let session = store
            .create_session(&NewSession {
                team_id,
                ..Default::default()
            })
            .unwrap();
        b.iter_with_setup(
            || {
                store
                    .create_task(&NewTask {
                        session_id: session.id.clone(),
                        agent_id,
                        description: "bench".to_string(),
                        tier_used: None,
                    })
                    .unwrap()
            },
            |task| black_box(store.complete_task(&task.id, &TaskOutcome::completed()).unwrap()),
        )
    });

    group.finish();
}

fn bench_session_finish(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_finish");

    for tasks in [1usize, 10, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            let (store, team_id, agent_id) = seeded_store();
            b.iter_with_setup(
                || {
                    let session = store
                        .create_session(&NewSession {
                            team_id,
                            ..Default::default()
                        })
                        .unwrap();
                    for _ in 0..tasks {
                        let task = store
                            .create_task(&NewTask {
                                session_id: session.id.clone(),
                                agent_id,
                                description: "bench".to_string(),
                                tier_used: None,
                            })
                            .unwrap();
                        store.complete_task(&task.id, &TaskOutcome::completed()).unwrap();
                    }
                    session.id
                },
                |id| {
                    black_box(
                        store
                            .finish_session(&id, &SessionOutcome::new(SessionStatus::Completed))
                            .unwrap(),
                    )
                },
            )
        });
    }

    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let store = Store::in_memory().unwrap();
    let router = TaskRouter::default();
    router.seed_organization(&store).unwrap();
    let spec = TaskSpec::new("Refactor the database migration layer and fix the flaky test");

    group.bench_function("plan", |b| b.iter(|| black_box(router.plan(&store, &spec).unwrap())));
    group.bench_function("select_execution_tier", |b| {
        b.iter(|| black_box(router.select_execution_tier(&spec)))
    });

    group.finish();
}

fn bench_repetition_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_repetition");
    let store = Store::in_memory().unwrap();
    let detector = PatternDetector::default();
    for i in 0..500 {
        detector
            .log_command(&store, &format!("deploy service {} to staging", i % 25))
            .unwrap();
    }

    group.bench_function("analyze_500_commands", |b| {
        b.iter(|| black_box(detector.analyze_command_repetition(&store).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_task_completion,
    bench_session_finish,
    bench_routing,
    bench_repetition_scan
);
criterion_main!(benches);
