use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use sluice::{BufferConfig, ElementType, RingBuffer, SlotLayout};

fn bench_slot_cycle(c: &mut Criterion) {
    let cfg = BufferConfig::new(1024, 8, SlotLayout::scalar(ElementType::F64)).unwrap();
    let rb = RingBuffer::create("RB_bench", cfg).unwrap();
    let reader = rb.new_reader_group().unwrap();
    let writer = rb.new_writer();

    let mut group = c.benchmark_group("slot_cycle");
    group.throughput(Throughput::Elements(1));
    group.bench_function("acquire_commit_next_release", |b| {
        b.iter(|| {
            let mut slot = writer.acquire().unwrap();
            slot.scalars_mut::<f64>().unwrap()[0] = 1.0;
            slot.commit();
            let record = reader.next().unwrap();
            black_box(record.sequence());
        });
    });
    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let cfg = BufferConfig::new(1024, 8, SlotLayout::scalar(ElementType::F64)).unwrap();
    let rb = RingBuffer::create("RB_bench", cfg).unwrap();
    let readers: Vec<_> = (0..4).map(|_| rb.new_reader_group().unwrap()).collect();
    let writer = rb.new_writer();

    let mut group = c.benchmark_group("fanout");
    group.throughput(Throughput::Elements(1));
    group.bench_function("commit_to_four_groups", |b| {
        b.iter(|| {
            writer.acquire().unwrap().commit();
            for reader in &readers {
                black_box(reader.next().unwrap().sequence());
            }
        });
    });
    group.finish();
}

fn bench_observer_peek(c: &mut Criterion) {
    let cfg = BufferConfig::new(64, 64, SlotLayout::scalar(ElementType::F64)).unwrap();
    let rb = RingBuffer::create("RB_bench", cfg).unwrap();
    let observer = rb.new_observer();
    rb.new_writer().acquire().unwrap().commit();

    c.bench_function("observer_peek", |b| {
        b.iter(|| black_box(observer.peek().unwrap().sequence()));
    });
}

criterion_group!(benches, bench_slot_cycle, bench_fanout, bench_observer_peek);
criterion_main!(benches);
