//! Benchmarks for blocklist matching.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::net::{IpAddr, Ipv4Addr};

use defensiq::blocklist::Category;
use defensiq::dns::Matcher;

fn build_matcher(size: usize, patterns: usize) -> Matcher {
    let mut matcher = Matcher::new();
    for i in 0..size {
        if i % 2 == 0 {
            matcher.insert_domain(&format!("blocked{i}.com"), Category::Malware);
        } else {
            matcher.insert_domain(&format!("ads{i}.net"), Category::Advertising);
        }
        matcher.insert_ip(IpAddr::V4(Ipv4Addr::from(i as u32)), Category::Custom);
    }
    for i in 0..patterns {
        matcher.insert_pattern(&format!("^track{i}[0-9]+\\."), Category::Custom);
    }
    matcher
}

fn bench_check_domain(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher_lookup");

    for size in &[10, 100, 1000, 10000] {
        let matcher = build_matcher(*size, 10);

        group.bench_with_input(BenchmarkId::new("exact_hit", size), &matcher, |b, m| {
            b.iter(|| m.check_domain(black_box("blocked0.com")));
        });

        // Walks two parent domains before matching.
        group.bench_with_input(BenchmarkId::new("parent_hit", size), &matcher, |b, m| {
            b.iter(|| m.check_domain(black_box("cdn.tracking.ads1.net")));
        });

        // Misses fall through to every pattern.
        group.bench_with_input(BenchmarkId::new("miss", size), &matcher, |b, m| {
            b.iter(|| m.check_domain(black_box("www.example.org")));
        });

        group.bench_with_input(BenchmarkId::new("ip_hit", size), &matcher, |b, m| {
            b.iter(|| m.check_ip(black_box(IpAddr::V4(Ipv4Addr::from(2)))));
        });
    }

    group.finish();
}

fn bench_matcher_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher_creation");

    for size in &[10, 100, 1000, 10000] {
        group.bench_with_input(BenchmarkId::new("new", size), size, |b, size| {
            b.iter(|| build_matcher(black_box(*size), 0));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_check_domain, bench_matcher_creation);
criterion_main!(benches);
