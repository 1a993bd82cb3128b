use std::io::Cursor;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use distcarve::carve::{BlockScanner, CarveEngine, CarveSettings, CarveWindow, SignaturePair, Step};

fn minimal_jpeg() -> Vec<u8> {
    let mut jpeg = vec![0u8; 128];
    jpeg[0..4].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
    jpeg[4..9].copy_from_slice(b"JFIF\0");
    jpeg[126..128].copy_from_slice(&[0xFF, 0xD9]);
    jpeg
}

fn dense_chunk(len: usize) -> Vec<u8> {
    let jpeg = minimal_jpeg();
    let mut data = vec![0u8; len];
    let stride = jpeg.len() * 64;
    let mut offset = 0;
    while offset + jpeg.len() <= len {
        data[offset..offset + jpeg.len()].copy_from_slice(&jpeg);
        offset += stride;
    }
    data
}

fn bench_scanner(c: &mut Criterion) {
    let mut group = c.benchmark_group("scanner");
    for size in [8 * 1024 * 1024usize, 32 * 1024 * 1024usize] {
        let data = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("empty", size), &data, |b, data| {
            b.iter(|| {
                let mut scanner = BlockScanner::new(SignaturePair::jpeg(), 2 * 1024 * 1024);
                let mut found = 0u64;
                for block in data.chunks(8 * 1024 * 1024) {
                    scanner
                        .push_block::<(), _>(block, |_| {
                            found += 1;
                            Ok(Step::Consume)
                        })
                        .expect("scan");
                }
                found
            });
        });
    }
    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    let size = 16 * 1024 * 1024usize;
    let chunk = dense_chunk(size);
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("jpeg_dense", |b| {
        let engine = CarveEngine::new(CarveSettings::default());
        let window = CarveWindow {
            base_offset: 0,
            owned: 0..size as u64,
        };
        b.iter(|| {
            let out = tempfile::tempdir().expect("tempdir");
            engine
                .carve_reader(Cursor::new(&chunk), &window, out.path())
                .expect("carve")
                .artifacts
                .len()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_scanner, bench_engine);
criterion_main!(benches);
