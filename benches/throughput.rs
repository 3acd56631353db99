//! Throughput benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use labwire::logging::TrafficRecord;
use labwire::transport::session::{DelimiterFramer, Framer, Link, NoHeartbeat, SessionConfig};
use labwire::{Builder, CapabilityRegistry, Registry, SessionSettings, ThreadedSession};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const MODEL: &str = "\
Device:
  name: bench
  id: 1
  interfaces:
    Socket:
      name: CTRL
      host: 127.0.0.1
      port: 5025
    Serial:
      name: UART
      port: /dev/ttyUSB0
    Telnet:
      name: SHELL
      host: 127.0.0.1
";

/// Replays the same bytes forever
struct Replay {
    data: Vec<u8>,
    pos: usize,
}

impl Link for Replay {
    fn send_bytes(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.data.len() {
            self.pos = 0;
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Returns whatever was sent
#[derive(Default)]
struct Echo {
    buffer: VecDeque<u8>,
}

impl Link for Echo {
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.buffer.extend(data);
        Ok(())
    }

    fn recv_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffer.is_empty() {
            std::thread::sleep(Duration::from_micros(50));
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

fn model_benchmark(c: &mut Criterion) {
    let builder = Builder::new(
        Arc::new(Registry::new()),
        Arc::new(CapabilityRegistry::with_builtins()),
        SessionSettings::default(),
    );

    let mut group = c.benchmark_group("model");
    group.bench_function("load_and_remove", |b| {
        b.iter(|| {
            let device = builder.load_str(black_box(MODEL)).unwrap();
            black_box(device.remove().unwrap())
        })
    });
    group.finish();
}

fn framing_benchmark(c: &mut Criterion) {
    let line = b"MEAS:VOLT 12.034;CURR 0.512\r\n";
    let data: Vec<u8> = line.iter().copied().cycle().take(line.len() * 128).collect();

    let mut group = c.benchmark_group("framing");
    group.throughput(Throughput::Bytes(line.len() as u64));

    group.bench_function("delimiter_frame", |b| {
        let mut link = Replay {
            data: data.clone(),
            pos: 0,
        };
        let mut framer = DelimiterFramer::new(b"\r\n".to_vec());
        b.iter(|| {
            let frame = framer.read_frame(&mut link, Duration::from_millis(10)).unwrap();
            black_box(frame)
        })
    });

    group.finish();
}

fn session_benchmark(c: &mut Criterion) {
    let config = SessionConfig::default()
        .name("bench-echo")
        .read_timeout(Duration::from_millis(1))
        .cycle_sleep(Duration::ZERO);
    let session = ThreadedSession::start(
        config,
        || Ok(Box::new(Echo::default()) as Box<dyn Link>),
        Box::new(DelimiterFramer::default()),
        Box::new(NoHeartbeat),
    )
    .unwrap();

    let mut group = c.benchmark_group("session");
    group.bench_function("echo_round_trip", |b| {
        let msg = Bytes::from_static(b"*IDN?\n");
        b.iter(|| {
            session.write(msg.clone()).unwrap();
            black_box(session.read(Some(Duration::from_secs(1))).unwrap())
        })
    });
    group.finish();
}

fn traffic_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("traffic");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("hex_render", |b| {
        b.iter(|| black_box(TrafficRecord::rx(black_box(&data)).to_hex()))
    });

    group.bench_function("printable_check", |b| {
        b.iter(|| black_box(TrafficRecord::tx(black_box(&data)).is_printable()))
    });

    group.finish();
}

criterion_group!(
    benches,
    model_benchmark,
    framing_benchmark,
    session_benchmark,
    traffic_benchmark
);
criterion_main!(benches);
