#![no_main]

use libfuzzer_sys::fuzz_target;
use rvmem::{
    decoder::{generate_decoder_cache, DecodedExecuteSegment, HandlerRegistry},
    memory::ProgramImage,
    Machine, MachineOptions,
};

fuzz_target!(|data: &[u8]| {
    let _ = ProgramImage::parse::<u64>(data, true);
    let _ = Machine::<u64>::from_elf(data, MachineOptions::default().with_memory_max(16 << 20));

    let len = data.len() & !3;
    if let Ok(mut exec) = DecodedExecuteSegment::<u64>::create(&data[..len], 0x10000, true) {
        let _ = generate_decoder_cache(&mut exec, &HandlerRegistry::new());
    }
});
