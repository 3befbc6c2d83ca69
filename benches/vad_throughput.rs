use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use razor_voice::audio::{AudioFrame, Vad, VadConfig};
use razor_voice::interrupt::{InterruptConfig, InterruptMonitor};
use razor_voice::wake::RingBuffer;
use std::hint::black_box;
use std::time::Duration;
use tokio::time::Instant;

const FRAME_SAMPLES: usize = 320;

/// One minute of 20ms frames alternating speech bursts and pauses.
fn conversation(start: Instant) -> Vec<AudioFrame> {
    (0..3000u64)
        .map(|seq| {
            let speaking = (seq / 50) % 2 == 0;
            let amplitude: i16 = if speaking { 1200 } else { 40 };
            let samples = (0..FRAME_SAMPLES)
                .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
                .collect();
            AudioFrame::new(seq, start + Duration::from_millis(seq * 20), 16000, samples)
        })
        .collect()
}

fn bench_vad(c: &mut Criterion) {
    let frames = conversation(Instant::now());
    let mut group = c.benchmark_group("frame_path");
    group.throughput(Throughput::Elements(frames.len() as u64));

    group.bench_function(BenchmarkId::new("vad", frames.len()), |b| {
        b.iter(|| {
            let mut vad = Vad::new(VadConfig::default());
            let mut events = 0usize;
            for frame in &frames {
                if vad.process(black_box(frame)).is_some() {
                    events += 1;
                }
            }
            events
        })
    });

    group.bench_function(BenchmarkId::new("vad+barge_in+ring", frames.len()), |b| {
        b.iter(|| {
            let mut vad = Vad::new(VadConfig::default());
            let mut monitor = InterruptMonitor::new(InterruptConfig::default());
            let mut ring = RingBuffer::new(Duration::from_secs(3));
            let mut fired = 0usize;
            for frame in &frames {
                ring.push(frame.clone());
                if !monitor.is_armed() {
                    monitor.arm();
                }
                if monitor.process(black_box(frame)) {
                    fired += 1;
                }
                black_box(vad.process(frame));
            }
            fired
        })
    });

    group.finish();
}

criterion_group!(benches, bench_vad);
criterion_main!(benches);
