//! ReDoS safety demonstration.
//!
//! Rule names are user-supplied regular expressions, matched against every
//! desired composed resource name. Rust's `regex` crate (linear time, RE2
//! semantics) cannot backtrack catastrophically.
//!
//! Pattern: `(a+)+$` against `"a" * N + "X"`
//!
//! - Backtracking engines: O(2^N), hangs at N=25+
//! - Rust `regex` crate: O(N), microseconds even at N=100

use celfilter::prelude::*;
use celfilter::NameMatcher;
use std::collections::BTreeMap;

fn main() {
    divan::main();
}

/// The classic ReDoS pattern: nested quantifier with anchor.
const REDOS_PATTERN: &str = r"(a+)+$";

/// N 'a's followed by 'X' (forces a full backtrack attempt).
fn pathological_input(n: usize) -> String {
    "a".repeat(n) + "X"
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReDoS via NameMatcher
// ═══════════════════════════════════════════════════════════════════════════════

#[divan::bench(args = [10, 20, 25, 30, 50, 100])]
fn redos_name_matcher(bencher: divan::Bencher, n: usize) {
    let matcher = NameMatcher::compile(REDOS_PATTERN).unwrap();
    let input = pathological_input(n);

    bencher.bench_local(|| matcher.matches(&input));
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReDoS via the full engine (compile → evaluate → apply)
// ═══════════════════════════════════════════════════════════════════════════════

#[divan::bench(args = [10, 20, 50, 100])]
fn redos_full_pipeline(bencher: divan::Bencher, n: usize) {
    let engine = FilterEngine::new().unwrap();
    let rules = [Rule::new(REDOS_PATTERN, "false")];
    let ctx = EvaluationContext::default();
    let name = pathological_input(n);

    bencher
        .with_inputs(|| BTreeMap::from([(name.clone(), ())]))
        .bench_local_values(|candidates| engine.filter(&rules, candidates, &ctx));
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReDoS via matches() inside an expression
// ═══════════════════════════════════════════════════════════════════════════════

#[divan::bench(args = [10, 50, 100])]
fn redos_expression_matches(bencher: divan::Bencher, n: usize) {
    let env = Environment::standard().unwrap();
    let program = Program::compile(&env, "context.name.matches('(a+)+$')").unwrap();
    let mut ctx = EvaluationContext::default();
    ctx.context
        .insert("name".into(), pathological_input(n).into());
    let activation = ctx.activation(&env);

    bencher.bench_local(|| program.evaluate_bool(&activation));
}
