//! Performance benchmarks for the wire codec and slot hasher.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kvlink::command::key_slot;
use kvlink::protocol::{encode_args, Decoder};

/// Benchmark reply decoding over a variety of frame shapes.
fn bench_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("decoding");

    group.bench_function("simple_string", |b| {
        let mut decoder = Decoder::new(8192, 32);
        b.iter(|| {
            decoder.feed(black_box(b"+OK\r\n"));
            decoder.next().unwrap().unwrap()
        });
    });

    group.bench_function("bulk_string", |b| {
        let mut decoder = Decoder::new(8192, 32);
        let frame = b"$11\r\nhello world\r\n";
        b.iter(|| {
            decoder.feed(black_box(frame));
            decoder.next().unwrap().unwrap()
        });
    });

    group.bench_function("nested_array", |b| {
        let mut decoder = Decoder::new(8192, 32);
        let frame = b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Foo\r\n-Bar\r\n";
        b.iter(|| {
            decoder.feed(black_box(frame));
            decoder.next().unwrap().unwrap()
        });
    });

    group.bench_function("pipelined_replies", |b| {
        let mut decoder = Decoder::new(8192, 32);
        let mut stream = Vec::new();
        for i in 0..64 {
            stream.extend_from_slice(format!(":{i}\r\n").as_bytes());
        }
        b.iter(|| {
            decoder.feed(black_box(&stream));
            for _ in 0..64 {
                decoder.next().unwrap().unwrap();
            }
        });
    });

    group.finish();
}

/// Benchmark command encoding.
fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    let mut buf = bytes::BytesMut::with_capacity(4096);

    group.bench_function("set_command", |b| {
        let args: [&[u8]; 3] = [b"SET", b"user:1000:profile", b"some payload here"];
        b.iter(|| {
            buf.clear();
            encode_args(black_box(&args), &mut buf);
        });
    });

    group.finish();
}

/// Benchmark hash-slot computation with and without hash tags.
fn bench_key_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_slot");

    group.bench_function("plain_key", |b| {
        b.iter(|| key_slot(black_box(b"user:1000:profile")));
    });

    group.bench_function("tagged_key", |b| {
        b.iter(|| key_slot(black_box(b"{user:1000}:profile")));
    });

    group.finish();
}

criterion_group!(benches, bench_decoding, bench_encoding, bench_key_slot);
criterion_main!(benches);
