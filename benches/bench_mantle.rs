#![allow(
    clippy::tests_outside_test_module,
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::cast_precision_loss,
    reason = "benchmark"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use mantle::{Context, Template, TemplateCollection, TemplateLookup};

mod utils;

fn lookup() -> TemplateLookup {
    let lookup = TemplateLookup::new();
    lookup
        .put_string("/layout.html", include_str!("layout.html"))
        .unwrap();
    lookup
        .put_string("/profile.html", include_str!("profile.html"))
        .unwrap();
    lookup
}

fn mantle_benchmark(c: &mut Criterion) {
    let lookup = lookup();
    let profile = lookup.get_template("/profile.html").unwrap();

    let contexts: Vec<Context> = utils::generate_random_contexts(100)
        .iter()
        .map(utils::to_context)
        .collect();

    utils::print_binary_size();

    let mut group = c.benchmark_group("Template Rendering");
    group.sample_size(50);

    group.bench_function("mantle_compile", |b| {
        b.iter(|| {
            black_box(Template::new(include_str!("profile.html")).unwrap());
        });
    });

    group.bench_function("mantle_render", |b| {
        b.iter(|| {
            for context in &contexts {
                black_box(profile.render(context).unwrap());
            }
        });
    });

    group.bench_function("mantle_lookup_render", |b| {
        b.iter(|| {
            for context in &contexts {
                black_box(lookup.render("/profile.html", context).unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, mantle_benchmark);
criterion_main!(benches);
