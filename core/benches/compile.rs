//! Compile benchmarks: rule list → compiled rules.
//!
//! Measures the per-request cost of compiling name patterns and parsing,
//! checking and evaluating expressions, and how it scales with rule count.

use celfilter::prelude::*;
use celfilter::{parse, NameMatcher};

fn main() {
    divan::main();
}

const SIMPLE: &str = "observed.composite.resource.spec.watchers > 10";

const COMPLEX: &str = "has(observed.composite.resource.spec.regions) && \
    observed.composite.resource.spec.regions.exists(r, r.startsWith('eu-')) && \
    math.greatest([1, 2, size(desired.resources)]) < 50 && \
    (has(context.tier) ? context.tier : 'free') in ['pro', 'enterprise']";

// ═══════════════════════════════════════════════════════════════════════════════
// Building blocks
// ═══════════════════════════════════════════════════════════════════════════════

#[divan::bench]
fn environment_standard() -> Environment {
    Environment::standard().unwrap()
}

#[divan::bench]
fn name_matcher_literal(bencher: divan::Bencher) {
    bencher.bench_local(|| NameMatcher::compile("bucket"));
}

#[divan::bench]
fn name_matcher_complex(bencher: divan::Bencher) {
    bencher.bench_local(|| {
        NameMatcher::compile(r"(redis|memcached)-[a-z]{2}-(east|west)-[0-9]+|cache-.*")
    });
}

#[divan::bench(args = [SIMPLE, COMPLEX])]
fn parse_expression(bencher: divan::Bencher, source: &str) {
    bencher.bench_local(|| parse(source));
}

#[divan::bench(args = [SIMPLE, COMPLEX])]
fn compile_program(bencher: divan::Bencher, source: &str) {
    let env = Environment::standard().unwrap();
    bencher.bench_local(|| Program::compile(&env, source).map(|p| p.result_type().clone()));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rule lists at scale
// ═══════════════════════════════════════════════════════════════════════════════

fn rules(n: usize) -> Vec<Rule> {
    (0..n)
        .map(|i| Rule::new(format!("resource-{i}-.*"), format!("context.index != {i}")))
        .collect()
}

#[divan::bench(args = [1, 10, 100, 256])]
fn compile_rules(bencher: divan::Bencher, n: usize) {
    let engine = FilterEngine::new().unwrap();
    let rules = rules(n);
    let mut ctx = EvaluationContext::default();
    ctx.context.insert("index".into(), (-1).into());

    bencher.bench_local(|| engine.compile(&rules, &ctx).map(|c| c.len()));
}

#[divan::bench(args = [1, 10, 100, 256])]
fn check_rules(bencher: divan::Bencher, n: usize) {
    let engine = FilterEngine::new().unwrap();
    let rules = rules(n);

    bencher.bench_local(|| engine.check(&rules));
}
