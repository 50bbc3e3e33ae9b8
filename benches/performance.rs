use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sentinel_proxy::core::{Endpoint, ResponseCache, Signature};
use sentinel_proxy::redis::{classify, request_len, scan, ReplyProgress, Request};
use std::time::Duration;
use tokio::runtime::Runtime;

/// 构造指定长度的批量字符串回复
fn bulk_reply(len: usize) -> Vec<u8> {
    let mut reply = format!("${}\r\n", len).into_bytes();
    reply.extend(std::iter::repeat(b'x').take(len));
    reply.extend_from_slice(b"\r\n");
    reply
}

/// 构造包含多个元素的数组回复
fn array_reply(elements: usize) -> Vec<u8> {
    let mut reply = format!("*{}\r\n", elements).into_bytes();
    for i in 0..elements {
        reply.extend_from_slice(format!("$6\r\nval{:03}\r\n", i % 1000).as_bytes());
    }
    reply
}

/// 回复扫描器性能基准测试
fn bench_reply_scanner(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_scanner");

    for size in [16usize, 4096, 1 << 20].iter() {
        let reply = bulk_reply(*size);
        group.bench_with_input(BenchmarkId::new("bulk_whole", size), &reply, |b, reply| {
            b.iter(|| {
                let progress = scan(ReplyProgress::new(), black_box(reply)).unwrap();
                black_box(progress.is_complete());
            });
        });

        // 按 4KB 分块模拟多次读取
        group.bench_with_input(BenchmarkId::new("bulk_chunked", size), &reply, |b, reply| {
            b.iter(|| {
                let mut progress = ReplyProgress::new();
                for chunk in reply.chunks(4096) {
                    progress = scan(progress, black_box(chunk)).unwrap();
                }
                black_box(progress.is_complete());
            });
        });
    }

    for elements in [10usize, 1000].iter() {
        let reply = array_reply(*elements);
        group.bench_with_input(BenchmarkId::new("array", elements), &reply, |b, reply| {
            b.iter(|| black_box(scan(ReplyProgress::new(), black_box(reply)).unwrap()));
        });
    }

    group.finish();
}

/// 请求解析与分类性能基准测试
fn bench_request_handling(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_handling");
    let get = b"*2\r\n$3\r\nGET\r\n$10\r\nuser:12345\r\n".to_vec();
    let set = b"*3\r\n$3\r\nSET\r\n$10\r\nuser:12345\r\n$5\r\nhello\r\n".to_vec();

    group.bench_function("request_len", |b| {
        b.iter(|| black_box(request_len(black_box(&get)).unwrap()))
    });

    group.bench_function("parse_and_classify", |b| {
        b.iter(|| {
            for frame in [&get, &set] {
                let request = Request::parse(black_box(frame)).unwrap();
                black_box(classify(&request, true));
            }
        })
    });

    group.finish();
}

/// 响应缓存性能基准测试
fn bench_response_cache(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("response_cache");

    for entries in [100usize, 10_000].iter() {
        let cache = ResponseCache::new(Duration::from_secs(60), 4096);
        let keys: Vec<Bytes> = (0..*entries)
            .map(|i| Bytes::from(format!("*2\r\n$3\r\nGET\r\n$8\r\nkey{:05}\r\n", i)))
            .collect();
        rt.block_on(async {
            for key in &keys {
                cache.put(key.clone(), Bytes::from_static(b"$5\r\nvalue\r\n")).await;
            }
        });

        group.bench_with_input(BenchmarkId::new("get_hit", entries), &keys, |b, keys| {
            b.to_async(&rt).iter(|| async {
                for key in keys.iter().take(100) {
                    black_box(cache.get(key).await);
                }
            });
        });
    }

    group.finish();
}

/// 拓扑签名计算性能基准测试
fn bench_signatures(c: &mut Criterion) {
    let mut group = c.benchmark_group("signatures");

    for replicas in [1usize, 3, 16].iter() {
        let endpoints: Vec<Endpoint> = (0..*replicas)
            .map(|i| Endpoint::new(format!("10.0.0.{}", i + 1), 6379))
            .collect();
        group.bench_with_input(
            BenchmarkId::new("replica_set", replicas),
            &endpoints,
            |b, endpoints| b.iter(|| black_box(Signature::of_endpoint_set(black_box(endpoints)))),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_reply_scanner,
    bench_request_handling,
    bench_response_cache,
    bench_signatures
);
criterion_main!(benches);
