use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use wharf::http::{parse_urlencoded, HeadersChecker, RequestParser};

fn bench_parse_by_header_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");

    for header_count in [2, 8, 32] {
        let mut request = String::from("GET /index.html HTTP/1.1\r\nHost: example.com\r\n");
        for i in 0..header_count {
            request.push_str(&format!("X-Header-{i}: value-{i}\r\n"));
        }
        request.push_str("\r\n");
        let bytes = request.into_bytes();

        group.bench_with_input(
            BenchmarkId::from_parameter(header_count),
            &bytes,
            |b, bytes| {
                b.iter(|| {
                    let mut parser = RequestParser::new(
                        64 * 1024,
                        1024 * 1024,
                        Arc::new(HeadersChecker::new()),
                    );
                    parser.feed(black_box(bytes))
                });
            },
        );
    }

    group.finish();
}

fn bench_parse_post_body(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_post");

    for size in [256, 4_096, 65_536] {
        let mut request =
            format!("POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {size}\r\n\r\n")
                .into_bytes();
        request.extend(std::iter::repeat(b'd').take(size));

        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            b.iter(|| {
                let mut parser = RequestParser::new(
                    1024 * 1024,
                    1024 * 1024,
                    Arc::new(HeadersChecker::new()),
                );
                parser.feed(black_box(request))
            });
        });
    }

    group.finish();
}

fn bench_query_decoding(c: &mut Criterion) {
    let query = "name=hello+world&city=d%C3%BCsseldorf&tags=a%2Cb%2Cc&page=42";
    c.bench_function("parse_urlencoded", |b| {
        b.iter(|| parse_urlencoded(black_box(query)));
    });
}

criterion_group!(
    benches,
    bench_parse_by_header_count,
    bench_parse_post_body,
    bench_query_decoding
);
criterion_main!(benches);
