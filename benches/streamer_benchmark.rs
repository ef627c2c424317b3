//! Benchmarks for the streamer and the failure queue.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use stampede::failure::{FailureQueue, FailureRecord};
use stampede::streamer::{
    AsyncSink, AsyncStreamer, Completion, SinkError, StreamMode, Streamer, streamer_for,
};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

/// Completes every write before returning.
struct ImmediateSink;

impl AsyncSink<u64, Vec<u8>> for ImmediateSink {
    fn put_async(&self, _key: u64, value: Vec<u8>, on_complete: Completion) -> Result<(), SinkError> {
        black_box(value);
        on_complete(Ok(()));
        Ok(())
    }
}

/// Completes writes on a background thread, like a network client would.
struct BackgroundSink {
    tx: Mutex<Sender<Completion>>,
}

impl BackgroundSink {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Completion>();
        thread::spawn(move || {
            for completion in rx {
                completion(Ok(()));
            }
        });
        Self { tx: Mutex::new(tx) }
    }
}

impl AsyncSink<u64, Vec<u8>> for BackgroundSink {
    fn put_async(&self, _key: u64, value: Vec<u8>, on_complete: Completion) -> Result<(), SinkError> {
        black_box(value);
        self.tx
            .lock()
            .map_err(|_| SinkError::new("sink poisoned"))?
            .send(on_complete)
            .map_err(|_| SinkError::new("sink closed"))
    }
}

const ENTRIES: u64 = 10_000;

fn bench_async_streamer(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_streamer");
    group.throughput(Throughput::Elements(ENTRIES));

    group.bench_function("immediate", |b| {
        b.iter(|| {
            let streamer = AsyncStreamer::new(ImmediateSink, 1000);
            for key in 0..ENTRIES {
                streamer.push_entry(key, vec![0u8; 64]).unwrap();
            }
            streamer.await_completion().unwrap();
        });
    });

    let sink = Arc::new(BackgroundSink::new());
    for window in [1usize, 16, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("background", window), window, |b, &window| {
            b.iter(|| {
                let streamer = AsyncStreamer::new(Arc::clone(&sink), window);
                for key in 0..ENTRIES {
                    streamer.push_entry(key, vec![0u8; 64]).unwrap();
                }
                streamer.await_completion().unwrap();
            });
        });
    }

    group.bench_function("sync_mode", |b| {
        b.iter(|| {
            let streamer: Box<dyn Streamer<u64, Vec<u8>>> =
                streamer_for(Arc::clone(&sink), StreamMode::Sync);
            for key in 0..ENTRIES {
                streamer.push_entry(key, vec![0u8; 64]).unwrap();
            }
            streamer.await_completion().unwrap();
        });
    });

    group.finish();
}

fn bench_failure_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("failure_queue");

    for size in [100usize, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("append_drain", size), size, |b, &size| {
            let queue = FailureQueue::new();
            b.iter(|| {
                for i in 0..size {
                    queue.append(FailureRecord::new("member-1", format!("failure {}", i)));
                }
                black_box(queue.drain_all())
            });
        });
    }

    group.bench_function("contended_append", |b| {
        let queue = Arc::new(FailureQueue::new());
        b.iter(|| {
            thread::scope(|s| {
                for t in 0..4 {
                    let queue = Arc::clone(&queue);
                    s.spawn(move || {
                        for i in 0..250 {
                            queue.append(FailureRecord::new(format!("member-{}", t), format!("failure {}", i)));
                        }
                    });
                }
            });
            black_box(queue.drain_all())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_async_streamer, bench_failure_queue);
criterion_main!(benches);
