use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lcem::augmented::Nested;
use lcem::likelihood::e_step;
use lcem::model::FitConfig;
use lcem::mstep::MStep;
use lcem::newton::NewtonRaphson;
use lcem::seeding::initial_parameters;
use lcem::simulate::Scenario;

fn benchmark_em_iteration(c: &mut Criterion) {
    let sizes = [500_usize, 1785, 5000];
    let cases: Vec<_> = sizes
        .iter()
        .map(|&units| {
            let scenario = Scenario {
                num_units: units,
                ..Scenario::election_like()
            };
            let (data, _) = scenario.generate(0x5EED).expect("simulate");
            let start = initial_parameters(&data, &FitConfig::with_classes(3), 1).expect("start");
            (units, data, start)
        })
        .collect();

    let mut group = c.benchmark_group("em_iteration");
    for (units, data, start) in cases.iter() {
        group.throughput(Throughput::Elements(*units as u64));

        group.bench_with_input(BenchmarkId::new("e_step", units), data, |b, input| {
            b.iter(|| black_box(e_step(black_box(start), input).expect("e-step")));
        });

        let estep = e_step(start, data).expect("e-step");
        group.bench_with_input(BenchmarkId::new("newton", units), data, |b, input| {
            let mut strategy = NewtonRaphson::new(1.0);
            b.iter(|| black_box(strategy.update(start, &estep, input)));
        });

        group.bench_with_input(BenchmarkId::new("nested", units), data, |b, input| {
            let mut strategy = Nested;
            b.iter(|| black_box(strategy.update(start, &estep, input)));
        });
    }
    group.finish();
}

criterion_group!(em_iteration, benchmark_em_iteration);
criterion_main!(em_iteration);
