#![allow(unused)]
extern crate rvmem;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rvmem::prelude::*;
use std::hint::black_box;

fn options() -> MachineOptions<u64> {
    MachineOptions::default().with_memory_max(64 << 20)
}

/// Benchmark aligned loads that hit the same page, and loads that walk across pages.
fn bench_reads(c: &mut Criterion) {
    let mut memory = Memory::<u64>::new(&options()).unwrap();
    memory.memset(0x100000, 0xAA, 1 << 20).unwrap();

    let mut group = c.benchmark_group("memory_read");
    group.throughput(Throughput::Elements(4096));
    group.bench_function("same_page", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for i in 0..4096u64 {
                let addr = black_box(0x100000 + (i % 512) * 8);
                sum = sum.wrapping_add(memory.read::<u64>(addr).unwrap());
            }
            black_box(sum)
        });
    });
    group.bench_function("page_walk", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            for i in 0..4096u64 {
                let addr = black_box(0x100000 + (i % 256) * 4096);
                sum = sum.wrapping_add(memory.read::<u64>(addr).unwrap());
            }
            black_box(sum)
        });
    });
    group.finish();
}

/// Benchmark bulk copies in and out of guest memory at several sizes.
fn bench_bulk(c: &mut Criterion) {
    let mut memory = Memory::<u64>::new(&options()).unwrap();
    let mut group = c.benchmark_group("memory_bulk");

    for size in [64usize, 4096, 65536] {
        let data = vec![0x5a; size];
        let mut out = vec![0; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("memcpy", size), &data, |b, data| {
            b.iter(|| memory.memcpy(black_box(0x200010), data).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("memcpy_out", size), &size, |b, _| {
            b.iter(|| {
                memory.memcpy_out(&mut out, black_box(0x200010)).unwrap();
                black_box(out[0])
            });
        });
    }
    group.finish();
}

/// Benchmark forking a populated address space and dirtying one page of the fork.
fn bench_fork(c: &mut Criterion) {
    let mut master = Memory::<u64>::new(&options()).unwrap();
    master.memset(0x100000, 1, 4 << 20).unwrap();

    c.bench_function("fork_and_write", |b| {
        b.iter(|| {
            let mut fork = Memory::fork(&master, &options()).unwrap();
            fork.write::<u64>(black_box(0x180000), 2).unwrap();
            black_box(fork.pages_active())
        });
    });
}

criterion_group!(benches, bench_reads, bench_bulk, bench_fork);
criterion_main!(benches);
