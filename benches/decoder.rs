#![allow(unused)]
extern crate rvmem;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use rvmem::{
    decoder::{generate_decoder_cache, DecodedExecuteSegment, HandlerRegistry},
    prelude::*,
};
use std::{hint::black_box, sync::Arc};

/// A page-aligned block of mixed 32-bit and compressed instructions.
fn code(pages: usize) -> Vec<u8> {
    // addi a0, a0, 1 ; c.addi a1, 1 ; c.nop ; bnez a0, -8 ; add a2, a0, a1
    let pattern: [u8; 16] = [
        0x13, 0x05, 0x15, 0x00, 0x85, 0x05, 0x01, 0x00, 0xe3, 0x1c, 0x05, 0xfe, 0x33, 0x06,
        0xb5, 0x00,
    ];
    pattern.iter().copied().cycle().take(pages * 4096).collect()
}

/// Benchmark decoding a fresh execute segment, with and without compressed instructions.
fn bench_decode_segment(c: &mut Criterion) {
    let data = code(64);
    let registry = HandlerRegistry::<u64>::new();

    let mut group = c.benchmark_group("decoder");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for compressed in [true, false] {
        let name = if compressed { "generate_rvc" } else { "generate_rv64" };
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut exec =
                    DecodedExecuteSegment::<u64>::create(black_box(&data), 0x10000, compressed)
                        .unwrap();
                generate_decoder_cache(&mut exec, &registry).unwrap();
                black_box(exec)
            });
        });
    }
    group.finish();
}

/// Benchmark the shared-segment path, where every lookup after the first is a cache hit.
fn bench_shared_lookup(c: &mut Criterion) {
    let data = code(16);
    let shared = Arc::new(SharedExecuteSegments::<u64>::new(true));
    let options = MachineOptions::default()
        .with_memory_max(16 << 20)
        .with_shared_segments(shared);

    c.bench_function("shared_segment_hit", |b| {
        b.iter(|| {
            let mut memory = Memory::<u64>::new(&options).unwrap();
            let segment = memory
                .create_execute_segment(black_box(&data), 0x10000, true, false)
                .unwrap();
            black_box(segment)
        });
    });
}

/// Benchmark straight-line execution of a decoded countdown loop.
fn bench_simulate(c: &mut Criterion) {
    // li a0, 100000 ; loop: addi a0, a0, -1 ; bnez a0, loop ; ebreak
    let code: Vec<u8> = [0x0001_8537u32, 0x6a05_051b, 0xfff5_0513, 0xfe05_1ee3, 0x0010_0073]
        .iter()
        .flat_map(|i| i.to_le_bytes())
        .collect();
    let len = code.len() as u64;
    let image = Arc::new(ProgramImage::new(code, 0x10000).with_segment(LoadSegment {
        vaddr: 0x10000,
        offset: 0,
        filesz: len,
        memsz: len,
        flags: SegmentFlags::READ | SegmentFlags::EXEC,
    }));
    let master = Machine::<u64>::from_image(image, MachineOptions::default()).unwrap();

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(200_003));
    group.bench_function("countdown", |b| {
        b.iter(|| {
            let mut machine = master.fork(MachineOptions::default()).unwrap();
            black_box(machine.simulate(1_000_000).unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_decode_segment, bench_shared_lookup, bench_simulate);
criterion_main!(benches);
