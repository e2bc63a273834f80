use criterion::{black_box, criterion_group, criterion_main, Criterion};

use luaveil::pipeline::{self, ObfuscationOptions};
use luaveil::{lexer::Scanner, parser::Parser, resolve::Resolver};

const SAMPLE: &str = r#"
local function fib(n)
  if n < 2 then return n end
  return fib(n - 1) + fib(n - 2)
end

local results = {}
for i = 1, 15 do
  results[i] = fib(i)
end

local total = 0
for _, v in ipairs(results) do
  total = total + v
end
print('total', total)
"#;

fn bench_front_end(c: &mut Criterion) {
    c.bench_function("lex", |b| {
        b.iter(|| Scanner::new(black_box(SAMPLE)).scan_tokens().unwrap())
    });

    c.bench_function("parse", |b| {
        let tokens = Scanner::new(SAMPLE).scan_tokens().unwrap();
        b.iter(|| Parser::new(black_box(tokens.clone())).parse().unwrap())
    });

    c.bench_function("resolve", |b| {
        let tokens = Scanner::new(SAMPLE).scan_tokens().unwrap();
        let chunk = Parser::new(tokens).parse().unwrap();
        b.iter(|| Resolver::new().resolve(black_box(&chunk)).unwrap())
    });
}

fn bench_pipeline(c: &mut Criterion) {
    c.bench_function("compile", |b| {
        b.iter(|| pipeline::compile_source(black_box(SAMPLE)).unwrap())
    });

    c.bench_function("obfuscate_baseline", |b| {
        let options = ObfuscationOptions::none();
        b.iter(|| pipeline::obfuscate(black_box(SAMPLE), &options).unwrap())
    });

    c.bench_function("obfuscate_full", |b| {
        let options = ObfuscationOptions::default();
        b.iter(|| pipeline::obfuscate(black_box(SAMPLE), &options).unwrap())
    });
}

criterion_group!(benches, bench_front_end, bench_pipeline);
criterion_main!(benches);
