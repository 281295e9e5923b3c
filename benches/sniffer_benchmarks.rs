use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use darvazeh::extract_session_id;

/// A ClientHello carrying the ApplicationID extension after `n_exts`
/// unrelated extensions, stressing the extension walk.
fn client_hello(app_id: &[u8], n_exts: usize) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(22u8);
    out.extend_from_slice(&[0xfe, 0xfd]);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
    out.extend_from_slice(&[0, 0]);

    out.push(1);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&[0xfe, 0xfd]);
    out.extend_from_slice(&[0xaa; 32]);

    out.push(32);
    out.extend_from_slice(&[0x42; 32]);
    out.push(0);
    out.extend_from_slice(&[0, 32]);
    for suite in 0u16..16 {
        out.extend_from_slice(&suite.to_be_bytes());
    }
    out.extend_from_slice(&[1, 0]);

    let mut exts = Vec::new();
    for i in 0..n_exts {
        exts.extend_from_slice(&(i as u16).to_be_bytes());
        exts.extend_from_slice(&8u16.to_be_bytes());
        exts.extend_from_slice(&[0u8; 8]);
    }
    exts.extend_from_slice(&48018u16.to_be_bytes());
    exts.extend_from_slice(&((app_id.len() + 1) as u16).to_be_bytes());
    exts.push(app_id.len() as u8);
    exts.extend_from_slice(app_id);

    out.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    out.extend_from_slice(&exts);
    out
}

fn bench_app_id_first_extension(c: &mut Criterion) {
    let packet = client_hello(b"abcdefgh", 0);

    let mut group = c.benchmark_group("sniffer");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("app_id_first", |b| {
        b.iter(|| extract_session_id(black_box(&packet), true))
    });
    group.finish();
}

fn bench_app_id_deep_extension_walk(c: &mut Criterion) {
    let packet = client_hello(b"abcdefgh", 24);

    let mut group = c.benchmark_group("sniffer");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("app_id_after_24_extensions", |b| {
        b.iter(|| extract_session_id(black_box(&packet), true))
    });
    group.finish();
}

fn bench_legacy_fallback(c: &mut Criterion) {
    let packet = client_hello(b"abcdefgh", 4);

    let mut group = c.benchmark_group("sniffer");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("legacy_session_id", |b| {
        b.iter(|| extract_session_id(black_box(&packet), false))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_app_id_first_extension,
    bench_app_id_deep_extension_walk,
    bench_legacy_fallback
);
criterion_main!(benches);
