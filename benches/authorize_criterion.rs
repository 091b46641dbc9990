use canopy_core::{Entities, Entity, EntityUid, PolicyEngine, Request, Response};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

#[derive(Debug, Clone, Copy)]
struct ScenarioSpec {
    name: &'static str,
    noise_policies: usize,
    group_depth: usize,
    deny: bool,
}

struct Scenario {
    name: &'static str,
    engine: PolicyEngine,
    request: Request,
}

fn uid(type_name: &str, id: &str) -> EntityUid {
    EntityUid::from_type_name_and_id(type_name, id).expect("valid benchmark uid")
}

fn policy_text(spec: ScenarioSpec) -> String {
    let mut text = format!(
        r#"
@id("target")
permit (
    principal in Group::"g{}",
    action == Action::"view",
    resource is Photo
) when {{
    resource.size < 1000 && context.mfa
}};
"#,
        spec.group_depth
    );
    for i in 0..spec.noise_policies {
        text.push_str(&format!(
            "permit (principal == User::\"noise{i}\", action == Action::\"edit\", resource) when {{ resource.size > {i} }};\n"
        ));
    }
    if spec.deny {
        text.push_str(r#"forbid (principal, action, resource) when { resource has locked };"#);
    }
    text
}

/// `User::"target"` in g0 in g1 ... in g{depth}.
fn entities(spec: ScenarioSpec) -> Entities {
    let mut list = vec![
        Entity::with_uid(uid("User", "target")).with_parent(uid("Group", "g0")),
        Entity::with_uid(uid("Photo", "p1"))
            .with_attr("size", 10)
            .with_attr("locked", true),
    ];
    for depth in 0..spec.group_depth {
        list.push(
            Entity::with_uid(uid("Group", &format!("g{depth}")))
                .with_parent(uid("Group", &format!("g{}", depth + 1))),
        );
    }
    Entities::from_entities(list).expect("benchmark entities are unique")
}

fn build_scenario(spec: ScenarioSpec) -> Scenario {
    let engine = PolicyEngine::new_from_str(&policy_text(spec))
        .and_then(|engine| engine.with_entities(entities(spec)))
        .expect("benchmark policies are valid");
    let request = Request::new(
        uid("User", "target"),
        uid("Action", "view"),
        uid("Photo", "p1"),
    )
    .with_context(canopy_core::Context::new().with_attr("mfa", true));
    Scenario {
        name: spec.name,
        engine,
        request,
    }
}

fn specs() -> Vec<ScenarioSpec> {
    vec![
        ScenarioSpec { name: "single_policy", noise_policies: 0, group_depth: 0, deny: false },
        ScenarioSpec { name: "noise_100", noise_policies: 100, group_depth: 0, deny: false },
        ScenarioSpec { name: "noise_1000", noise_policies: 1000, group_depth: 0, deny: false },
        ScenarioSpec { name: "groups_16", noise_policies: 10, group_depth: 16, deny: false },
        ScenarioSpec { name: "forbid_wins", noise_policies: 100, group_depth: 4, deny: true },
    ]
}

fn score(response: &Response) -> usize {
    response.diagnostics.reasons.len() + response.diagnostics.errors.len()
}

fn benchmark_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    group.sample_size(40);

    let scenarios: Vec<_> = specs().into_iter().map(build_scenario).collect();
    for scenario in &scenarios {
        group.bench_with_input(BenchmarkId::from_parameter(scenario.name), scenario, |b, s| {
            b.iter(|| {
                let response = s
                    .engine
                    .evaluate(black_box(&s.request))
                    .expect("benchmark requests are valid");
                black_box(score(&response));
            });
        });
    }

    group.finish();
}

fn benchmark_parse(c: &mut Criterion) {
    let text = policy_text(ScenarioSpec {
        name: "parse",
        noise_policies: 200,
        group_depth: 0,
        deny: true,
    });
    c.bench_function("parse_policy_set_200", |b| {
        b.iter(|| canopy_core::compile_policy(black_box(&text)).expect("valid policy text"));
    });
}

criterion_group!(benches, benchmark_evaluate, benchmark_parse);
criterion_main!(benches);
