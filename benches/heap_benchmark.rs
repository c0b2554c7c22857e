use criterion::{black_box, criterion_group, criterion_main, Criterion};
use realtime_region_heap::Heap;

const REGION_SIZE: usize = 1 << 20;

fn alloc_free_cycle(c: &mut Criterion) {
    let mut region = vec![0u8; REGION_SIZE];
    let mut heap = unsafe { Heap::create(region.as_mut_ptr(), region.len()) }.unwrap();

    c.bench_function("alloc_free_small", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(32)).unwrap();
            unsafe { heap.free(Some(p)) };
        })
    });
}

fn alloc_free_fragmented(c: &mut Criterion) {
    let mut region = vec![0u8; REGION_SIZE];
    let mut heap = unsafe { Heap::create(region.as_mut_ptr(), region.len()) }.unwrap();

    let mut held: Vec<_> = (0..64).map(|i| heap.alloc(16 + i * 8).unwrap()).collect();
    for i in (0..held.len()).step_by(2) {
        unsafe { heap.free(Some(held[i])) };
    }

    c.bench_function("alloc_free_best_fit_lookup", |b| {
        b.iter(|| {
            let p = heap.alloc(black_box(24)).unwrap();
            unsafe { heap.free(Some(p)) };
        })
    });

    for i in (1..held.len()).step_by(2) {
        unsafe { heap.free(Some(held[i])) };
    }
    held.clear();
}

criterion_group!(benches, alloc_free_cycle, alloc_free_fragmented);
criterion_main!(benches);
