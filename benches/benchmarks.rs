use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::io::{BufRead, Cursor};

use tawk::{parse_program, Interp, Lexer, TokenKind};

fn run_awk(program: &str, input: &str) -> String {
    let program = parse_program(program).unwrap();
    let mut interp = Interp::new(&program);
    let mut output = Vec::new();
    let stdin: Box<dyn BufRead> = Box::new(Cursor::new(input.as_bytes().to_vec()));
    interp.run(stdin, &mut output).unwrap();
    String::from_utf8(output).unwrap()
}

fn lex_all(source: &str) -> usize {
    let mut lexer = Lexer::new(source);
    let mut count = 0;
    loop {
        let tok = lexer.scan().unwrap();
        count += 1;
        if tok.kind == TokenKind::Eof {
            return count;
        }
    }
}

const COMPLEX_PROGRAM: &str = r#"
    BEGIN { FS = ":"; count = 0 }
    /pattern/ {
        for (i = 1; i <= NF; i++) {
            if ($i ~ /[0-9]+/) { sum += $i; count++ }
        }
    }
    END { if (count > 0) printf "avg: %.2f\n", sum / count }
"#;

fn bench_lexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer");

    group.bench_function("simple", |b| {
        b.iter(|| lex_all(black_box(r#"BEGIN { print "hello" }"#)))
    });
    group.bench_function("complex", |b| b.iter(|| lex_all(black_box(COMPLEX_PROGRAM))));

    group.finish();
}

fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");

    group.bench_function("complex", |b| {
        b.iter(|| parse_program(black_box(COMPLEX_PROGRAM)).unwrap())
    });
    group.bench_function("function_heavy", |b| {
        b.iter(|| {
            parse_program(black_box(
                "function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) } \
                 BEGIN { print fact(10) }",
            ))
            .unwrap()
        })
    });

    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("execution");

    for rows in [100usize, 1000] {
        let input: String = (0..rows)
            .map(|i| format!("row{} {} {}\n", i, i, i * 2))
            .collect();

        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("sum_column", rows), &input, |b, input| {
            b.iter(|| run_awk("{ sum += $2 } END { print sum }", black_box(input)))
        });
        group.bench_with_input(BenchmarkId::new("regex_filter", rows), &input, |b, input| {
            b.iter(|| run_awk("/row[0-9]*7/ { n++ } END { print n }", black_box(input)))
        });
        group.bench_with_input(BenchmarkId::new("field_rewrite", rows), &input, |b, input| {
            b.iter(|| run_awk("{ $2 = $3; print }", black_box(input)))
        });
    }

    group.bench_function("fibonacci", |b| {
        b.iter(|| {
            run_awk(
                "function fib(n) { return n < 2 ? n : fib(n-1) + fib(n-2) } \
                 BEGIN { print fib(18) }",
                "",
            )
        })
    });

    group.bench_function("array_churn", |b| {
        b.iter(|| {
            run_awk(
                "BEGIN { for (i = 0; i < 2000; i++) a[i % 100] = i; \
                 n = 0; for (k in a) n++; print n }",
                "",
            )
        })
    });

    group.finish();
}

criterion_group!(benches, bench_lexer, bench_parser, bench_execution);
criterion_main!(benches);
