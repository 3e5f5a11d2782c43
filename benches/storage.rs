use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use convostore::{
    open_database, Backend, PersistentConfig, Speaker, StorageManager, StorageOptions, Utterance,
    Value,
};

fn manager_for(name: &str, dir: &std::path::Path) -> StorageManager {
    let backend = match name {
        "memory" => Backend::Memory,
        _ => Backend::Persistent(
            open_database(
                dir,
                Some(PersistentConfig {
                    sync_on_write: false,
                    ..PersistentConfig::default()
                }),
            )
            .unwrap(),
        ),
    };
    StorageManager::new(backend, StorageOptions::named("bench")).unwrap()
}

fn bench_metadata(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata");
    group.throughput(Throughput::Elements(1));

    for name in ["memory", "persistent"] {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(name, dir.path());
        let mut speaker = Speaker::new(&manager, "speaker").unwrap();
        let utt = Utterance::builder()
            .id("0")
            .speaker(&mut speaker)
            .text("benchmark")
            .build(&manager)
            .unwrap();

        let mut n = 0i64;
        group.bench_with_input(BenchmarkId::new("set", name), &utt, |b, utt| {
            b.iter(|| {
                n += 1;
                utt.meta().set("score", n).unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("get", name), &utt, |b, utt| {
            b.iter(|| utt.meta().get("score").unwrap());
        });

        group.bench_with_input(BenchmarkId::new("hydrate", name), &manager, |b, manager| {
            b.iter(|| manager.get_utterance("0").unwrap());
        });
    }
    group.finish();
}

fn bench_build_utterances(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_utterance");

    for name in ["memory", "persistent"] {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_for(name, dir.path());
        let mut speaker = Speaker::new(&manager, "speaker").unwrap();

        let mut id = 0u64;
        group.bench_function(name, |b| {
            b.iter(|| {
                id += 1;
                Utterance::builder()
                    .id(id.to_string())
                    .speaker(&mut speaker)
                    .text("hello")
                    .meta("length", Value::from(5))
                    .build(&manager)
                    .unwrap()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_metadata, bench_build_utterances);
criterion_main!(benches);
