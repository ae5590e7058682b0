//! Code memory hot paths
//!
//! Measures the per-block costs a translator pays on every emitted block:
//! - bump allocation (uncontended and contended)
//! - executable -> writable translation
//! - the full emit sequence (allocate, copy, instruction cache flush)
//!
//! Run with: cargo bench --bench code_memory

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dualjit::{JitConfig, JitRuntime, ManualHost};

const REGION: usize = 64 * 1024 * 1024;

fn runtime() -> JitRuntime {
    let runtime = JitRuntime::with_host(
        JitConfig::immediate().with_region_size(REGION),
        Arc::new(ManualHost::new()),
    );
    runtime.initialize().expect("dual-mapped region");
    runtime
}

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");

    for len in [16usize, 256, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("single_thread", len), len, |b, &len| {
            let mut runtime = runtime();
            b.iter(|| {
                if runtime.remaining() < len {
                    runtime.recreate().expect("recreate region");
                }
                black_box(runtime.allocate(black_box(len)).unwrap())
            });
        });
    }

    group.bench_function("four_threads_x1000", |b| {
        let mut runtime = Arc::new(runtime());
        b.iter(|| {
            if runtime.remaining() < 4 * 1000 * 64 {
                Arc::get_mut(&mut runtime)
                    .expect("no outstanding workers")
                    .recreate()
                    .expect("recreate region");
            }
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    let runtime = Arc::clone(&runtime);
                    thread::spawn(move || {
                        for _ in 0..1000 {
                            black_box(runtime.allocate(64).unwrap());
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().unwrap();
            }
        });
    });

    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let runtime = runtime();
    let exec = runtime.allocate(4096).unwrap();
    let translator = runtime.manager().region().unwrap().translator();

    c.bench_function("translate/to_writable", |b| {
        b.iter(|| black_box(translator.to_writable(black_box(exec)).unwrap()))
    });
    c.bench_function("translate/write_pointer_for", |b| {
        b.iter(|| black_box(runtime.write_pointer_for(black_box(exec)).unwrap()))
    });
}

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");

    for len in [64usize, 1024, 16 * 1024].iter() {
        let code = vec![0x90u8; *len];
        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &code, |b, code| {
            let mut runtime = runtime();
            b.iter(|| {
                if runtime.remaining() < code.len() + 16 {
                    runtime.recreate().expect("recreate region");
                }
                black_box(runtime.emit_aligned(black_box(code), 16).unwrap())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_translate, bench_emit);
criterion_main!(benches);
