//! Engine properties checked directly against the public API.

use celfilter_test::prelude::*;
use serde_json::json;

#[test]
fn empty_rules_are_identity() {
    let engine = FilterEngine::new().unwrap();
    let set = candidates(&["a", "b"]);
    let ctx = ContextBuilder::new().context("anything", json!(1)).build();
    assert_eq!(engine.filter(&[], set.clone(), &ctx).unwrap(), set);
}

#[test]
fn anchoring_is_full_string() {
    let engine = FilterEngine::new().unwrap();
    let kept = engine
        .filter(
            &[Rule::new("foo.*", "false")],
            candidates(&["foobar", "xfoobar", "foobarx"]),
            &EvaluationContext::default(),
        )
        .unwrap();
    assert_eq!(names(&kept), ["xfoobar"]);
}

#[test]
fn second_matching_rule_is_evaluated_but_ignored() {
    let counter = TickCounter::new();
    let engine = counter.engine(false).unwrap();
    let rules = [Rule::new("a", "true"), Rule::new("a", "tick()")];
    let kept = engine
        .filter(&rules, candidates(&["a"]), &EvaluationContext::default())
        .unwrap();
    assert_eq!(names(&kept), ["a"]);
    assert_eq!(counter.calls(), 1);
}

#[test]
fn single_evaluation_regardless_of_candidates() {
    for set in [candidates(&[]), candidates(&["x-1"]), candidates(&["x-1", "x-2", "x-3", "y"])] {
        let counter = TickCounter::new();
        let engine = counter.engine(true).unwrap();
        engine
            .filter(&[Rule::new("x-.*", "tick()")], set, &EvaluationContext::default())
            .unwrap();
        assert_eq!(counter.calls(), 1);
    }
}

#[test]
fn failing_pattern_evaluates_nothing() {
    let counter = TickCounter::new();
    let engine = counter.engine(true).unwrap();
    let err = engine
        .filter(
            &[Rule::new("(", "tick()")],
            candidates(&["a"]),
            &EvaluationContext::default(),
        )
        .unwrap_err();
    assert_eq!(err.stage(), Stage::PatternCompile);
    assert_eq!(counter.calls(), 0);
}

#[test]
fn later_failure_discards_earlier_evaluations() {
    let counter = TickCounter::new();
    let engine = counter.engine(false).unwrap();
    let err = engine
        .filter(
            &[Rule::new("a", "tick()"), Rule::new("b", "1 + 1")],
            candidates(&["a", "b"]),
            &EvaluationContext::default(),
        )
        .unwrap_err();
    assert_eq!((err.index(), err.stage()), (1, Stage::ResultType));
    assert_eq!(counter.calls(), 1);
}

#[test]
fn same_outcome_for_every_matched_candidate() {
    let engine = FilterEngine::new().unwrap();
    let ctx = ContextBuilder::new()
        .composite(json!({"spec": {"watchers": 42}}))
        .build();
    let kept = engine
        .filter(
            &[Rule::new(".*", "observed.composite.resource.spec.watchers == 42")],
            candidates(&["a", "b", "c"]),
            &ctx,
        )
        .unwrap();
    assert_eq!(kept.len(), 3);
}

#[test]
fn engine_is_usable_across_threads() {
    let engine = FilterEngine::new().unwrap();
    let rules = vec![Rule::new("drop-.*", "false")];
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            let rules = rules.clone();
            std::thread::spawn(move || {
                let name = format!("drop-{i}");
                engine
                    .filter(
                        &rules,
                        candidates(&[name.as_str(), "keep"]),
                        &EvaluationContext::default(),
                    )
                    .map(|kept| kept.len())
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(1));
    }
}

#[test]
fn function_envelope_round_trip() {
    let request: RunFunctionRequest = serde_json::from_value(json!({
        "meta": {"tag": "t"},
        "desired": {"resources": {"a": {"resource": {}}, "b": {"resource": {}}}},
        "input": {
            "apiVersion": "cel.fn.crossplane.io/v1beta1",
            "kind": "Filters",
            "filters": [{"name": "a", "expression": "false"}]
        }
    }))
    .unwrap();
    let response = FilterFunction::new().unwrap().run(&request);
    assert!(!response.is_fatal());
    assert_eq!(
        response.desired.resources.keys().collect::<Vec<_>>(),
        ["b"]
    );
}
