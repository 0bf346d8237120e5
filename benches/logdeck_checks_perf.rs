use std::time::Duration;

use chrono::Utc;
use logdeck::{CheckProgram, CheckRegistry, Level, LogEntry, ResultCache};
use serde_json::json;

fn main() {
    divan::main();
}

const SIMPLE: &str = "type == \"error\"";
const COMPLEX: &str =
    "(type == \"error\" || type == \"warn\") && contains(str(argList), \"disk\") && len(argList) > 0";

fn make_entry(id: u64) -> LogEntry {
    LogEntry {
        id,
        level: Level::Error,
        timestamp: Utc::now(),
        origin: Some("src/db.js:42".to_string()),
        args: vec![json!("disk usage high"), json!({"pct": 93})],
        bound_data: serde_json::Map::new(),
        is_new: false,
    }
}

#[divan::bench(args = [SIMPLE, COMPLEX])]
fn compile(source: &str) -> CheckProgram {
    CheckProgram::compile(divan::black_box(source)).expect("compiles")
}

#[divan::bench(args = [SIMPLE, COMPLEX])]
fn eval_uncached(bencher: divan::Bencher<'_, '_>, source: &str) {
    let mut registry = CheckRegistry::default();
    let id = registry.add("bench", source).expect("check");
    let entry = make_entry(1);
    bencher.bench_local(|| {
        // Fresh cache per run so every eval actually executes.
        let mut cache = ResultCache::default();
        divan::black_box(registry.run_check(id, &entry, &mut cache))
    });
}

#[divan::bench]
fn eval_cache_hit(bencher: divan::Bencher<'_, '_>) {
    let mut registry = CheckRegistry::default();
    let id = registry.add("bench", COMPLEX).expect("check");
    let entry = make_entry(1);
    let mut cache = ResultCache::default();
    registry.run_check(id, &entry, &mut cache);
    bencher.bench_local(|| divan::black_box(registry.run_check(id, &entry, &mut cache)));
}

#[divan::bench]
fn eval_with_deadline_probes(bencher: divan::Bencher<'_, '_>) {
    // Long boolean chain, enough steps to cross several probe intervals.
    let source = (0..64)
        .map(|idx| format!("len(str(argList)) > {idx}"))
        .collect::<Vec<_>>()
        .join(" && ");
    let program = CheckProgram::compile(&source).expect("compiles");
    let inputs = logdeck_inputs();
    bencher.bench_local(|| {
        divan::black_box(program.eval(&inputs, Duration::from_millis(25)))
    });
}

fn logdeck_inputs() -> logdeck::CheckInputs {
    logdeck::CheckInputs::for_entry(&make_entry(1))
}
