use chrono::Utc;
use logdeck::{
    CheckRegistry, FilterPipeline, FilterState, Level, LogEntry, LogStore, ResultCache,
};
use serde_json::json;

fn main() {
    divan::main();
}

fn make_entry(idx: usize) -> LogEntry {
    LogEntry {
        id: 0,
        level: Level::ALL[idx % Level::ALL.len()],
        timestamp: Utc::now(),
        origin: Some(format!("src/module_{}.js:{}", idx % 20, 1 + idx % 200)),
        args: vec![
            json!(format!("event {idx}")),
            json!({"seq": idx, "payload": {"nested": true, "items": [1, 2, 3]}}),
        ],
        bound_data: serde_json::Map::new(),
        is_new: true,
    }
}

#[divan::bench(args = [100, 1000, 5000])]
fn append_at_capacity(bencher: divan::Bencher<'_, '_>, capacity: usize) {
    bencher
        .with_inputs(|| {
            let mut store = LogStore::new(capacity);
            // Prefill so every append in the hot loop evicts.
            for idx in 0..capacity {
                store.append(make_entry(idx));
            }
            store
        })
        .bench_local_values(|mut store| {
            for idx in 0..256 {
                divan::black_box(store.append(make_entry(idx)));
            }
            store
        });
}

#[divan::bench(args = [1000, 5000])]
fn filter_pass_over_buffer(bencher: divan::Bencher<'_, '_>, len: usize) {
    bencher
        .with_inputs(|| {
            let mut store = LogStore::new(len);
            for idx in 0..len {
                store.append(make_entry(idx));
            }
            let mut state = FilterState::default();
            state.query = "event 42".to_string();
            (store, FilterPipeline::new(state), CheckRegistry::default(), ResultCache::default())
        })
        .bench_local_values(|(store, pipeline, mut registry, mut cache)| {
            let mut shown = 0usize;
            for entry in store.iter() {
                let text = entry
                    .args
                    .iter()
                    .map(|value| value.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                if pipeline.should_display(entry, &text, &mut registry, &mut cache) {
                    shown += 1;
                }
            }
            divan::black_box(shown)
        });
}
