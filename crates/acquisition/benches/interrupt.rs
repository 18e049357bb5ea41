//! Criterion benchmarks for the interrupt path.
//!
//! Measures one interrupt event end to end against the simulated FPGA:
//! flag read/clear, serial-number read, stamping and cursor advance, then the
//! consumer claiming what was produced.
//!
//! Run with: cargo bench --bench interrupt

use acquisition::{AcquisitionEngine, FlowControl};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dma_pool::{BufferPool, Geometry};
use fpga_sim::{SimConfig, SimulatedFpga};
use register_port::{map, DmaMask, InterruptFlags, RegisterBus, RegisterPort, Stream};
use std::sync::Arc;

fn rig() -> (Arc<SimulatedFpga>, AcquisitionEngine) {
    let fpga = Arc::new(SimulatedFpga::new(SimConfig {
        peaks_count: 8,
        peaks_size: 4096,
        timestamp_offset: 4088,
        ..SimConfig::default()
    }));
    let port = Arc::new(RegisterPort::new(fpga.clone()));
    let flow = Arc::new(FlowControl::new());

    let geometry = Geometry::discover(&port, Stream::Peaks).unwrap();
    let pool = BufferPool::new(Stream::Peaks, geometry, fpga.allocator()).unwrap();
    pool.setup(&port).unwrap();
    flow.attach(Arc::new(pool));
    flow.arm(Stream::Peaks).unwrap();

    fpga.write32(map::INTE, InterruptFlags::PEAKS.bits()).unwrap();
    fpga.write32(map::DMACR, DmaMask::PEAKS.bits()).unwrap();

    (fpga, AcquisitionEngine::with_system_clock(port, flow))
}

/// Interrupts covering 1..=7 coalesced completions, each drained by a consumer.
fn interrupt_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("interrupt_drain");

    for burst in [1usize, 2, 4, 7] {
        let (fpga, engine) = rig();
        group.throughput(Throughput::Elements(burst as u64));
        group.bench_with_input(BenchmarkId::new("peaks", burst), &burst, |b, &burst| {
            b.iter(|| {
                fpga.complete_peaks(burst, false);
                let outcome = engine.on_interrupt();
                black_box(outcome);
                engine.flow().flush(Stream::Peaks);
            });
        });
    }

    group.finish();
}

/// Spurious wakes: flag register read and cleared, nothing else.
fn spurious_interrupt(c: &mut Criterion) {
    let (_fpga, engine) = rig();
    c.bench_function("spurious_interrupt", |b| {
        b.iter(|| black_box(engine.on_interrupt()));
    });
}

criterion_group!(benches, interrupt_drain, spurious_interrupt);
criterion_main!(benches);
