use std::sync::Arc;

use approx::assert_relative_eq;
use arrow::array::{ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use bayes_formula::backend::BlockKind;
use bayes_formula::interpret::{
    comparisons, predictions, slopes, AverageBy, ComparisonType, ComparisonsOptions, Conditional,
    PredictionsOptions, SlopesOptions, VariableSpec,
};
use bayes_formula::{
    Column, DataFrame, FitSettings, InferenceData, Method, Model, ModelOptions, Prior, Value,
};
use pretty_assertions::assert_eq;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};

const N: usize = 100;

fn linear_data(seed: u64) -> DataFrame {
    let mut rng = SmallRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.5).unwrap();
    let x: Vec<f64> = (0..N).map(|i| -2.0 + 4.0 * i as f64 / (N - 1) as f64).collect();
    let y = x.iter().map(|x| 1.0 + 2.0 * x + noise.sample(&mut rng)).collect();
    let g = (0..N).map(|i| ["a", "b", "c"][i % 3].to_string()).collect();
    DataFrame::from_columns([
        ("y", Column::Numeric(y)),
        ("x", Column::Numeric(x)),
        ("g", Column::Categorical(g)),
    ])
    .unwrap()
}

fn settings() -> FitSettings {
    FitSettings {
        num_tune: 500,
        num_draws: 500,
        seed: 42,
        ..Default::default()
    }
}

fn fit(formula: &str) -> (Model, InferenceData) {
    let model = Model::new(formula, linear_data(1)).unwrap();
    let idata = model.fit(&settings()).unwrap();
    (model, idata)
}

fn posterior_mean(idata: &InferenceData, name: &str) -> f64 {
    let values = idata.posterior.require(name).unwrap().values();
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn linear_regression_end_to_end() {
    let (model, idata) = fit("y ~ x");
    assert_eq!(idata.posterior.require("x").unwrap().shape(), &[2, 500]);
    assert!(idata.observed_data.as_ref().unwrap().contains("y"));
    assert_relative_eq!(posterior_mean(&idata, "x"), 2.0, epsilon = 0.2);
    assert_relative_eq!(posterior_mean(&idata, "Intercept"), 1.0, epsilon = 0.2);
    assert_relative_eq!(posterior_mean(&idata, "y_sigma"), 0.5, epsilon = 0.15);

    let options = PredictionsOptions {
        grid_n: 10,
        ..Default::default()
    };
    let mut rng = SmallRng::seed_from_u64(0);
    let summary = predictions(&model, &idata, &Conditional::from("x"), &options, &mut rng).unwrap();
    assert_eq!(summary.nrows(), 10);
    let estimate = summary.numeric("estimate").unwrap();
    let lower = summary.numeric("lower_3.0%").unwrap();
    let upper = summary.numeric("upper_97.0%").unwrap();
    for i in 0..10 {
        assert!(lower[i] < estimate[i] && estimate[i] < upper[i]);
    }
    assert!(estimate.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn posterior_predictive_intervals_are_wider() {
    let (model, idata) = fit("y ~ x");
    let mut rng = SmallRng::seed_from_u64(0);
    let conditional = Conditional::from("x");
    let mean = PredictionsOptions::default();
    let mean = predictions(&model, &idata, &conditional, &mean, &mut rng).unwrap();
    let pps = PredictionsOptions {
        pps: true,
        ..Default::default()
    };
    let pps = predictions(&model, &idata, &conditional, &pps, &mut rng).unwrap();
    let width = |frame: &DataFrame, row: usize| {
        frame.numeric("upper_97.0%").unwrap()[row] - frame.numeric("lower_3.0%").unwrap()[row]
    };
    assert!(width(&pps, 25) > 2.0 * width(&mean, 25));
}

#[test]
fn average_slope_is_the_coefficient() {
    let (model, idata) = fit("y ~ x");
    let options = SlopesOptions {
        average_by: Some(AverageBy::All),
        ..Default::default()
    };
    let summary = slopes(&model, &idata, &VariableSpec::from("x"), None, &options).unwrap();
    assert_eq!(summary.nrows(), 1);
    assert_eq!(&summary.names()[..2], &["term", "estimate_type"]);
    assert_relative_eq!(
        summary.numeric("estimate").unwrap()[0],
        posterior_mean(&idata, "x"),
        epsilon = 1e-6
    );
}

#[test]
fn ratio_of_means() {
    let (model, idata) = fit("y ~ x");
    let options = ComparisonsOptions {
        comparison_type: ComparisonType::Ratio,
        average_by: Some(AverageBy::All),
        ..Default::default()
    };
    let contrast = VariableSpec::values("x", [1.0, 2.0]);
    let summary = comparisons(&model, &idata, &contrast, None, &options).unwrap();
    assert_eq!(summary.column("value").unwrap().level(0), "(1, 2)");

    let a = idata.posterior.require("Intercept").unwrap().values();
    let b = idata.posterior.require("x").unwrap().values();
    let ratios: Vec<f64> = a
        .iter()
        .zip(b.iter())
        .map(|(a, b)| (a + 2.0 * b) / (a + b))
        .collect();
    let expected = ratios.iter().sum::<f64>() / ratios.len() as f64;
    assert_relative_eq!(summary.numeric("estimate").unwrap()[0], expected, epsilon = 1e-9);
}

#[test]
fn one_row_per_pair_of_levels() {
    let (model, idata) = fit("y ~ x + g");
    let options = ComparisonsOptions {
        average_by: Some(AverageBy::All),
        ..Default::default()
    };
    let three = comparisons(&model, &idata, &VariableSpec::from("g"), None, &options).unwrap();
    assert_eq!(three.nrows(), 3);
    let pair = VariableSpec::values("g", ["a", "b"]);
    let two = comparisons(&model, &idata, &pair, None, &options).unwrap();
    assert_eq!(two.nrows(), 1);
    assert_relative_eq!(
        two.numeric("estimate").unwrap()[0],
        three.numeric("estimate").unwrap()[0],
        epsilon = 1e-12
    );

    let by_g = ComparisonsOptions {
        average_by: Some(AverageBy::from("g")),
        ..Default::default()
    };
    let summary = comparisons(&model, &idata, &VariableSpec::from("x"), None, &by_g).unwrap();
    assert_eq!(summary.nrows(), 3);
    assert_eq!(summary.column("g").unwrap().level(2), "c");
}

#[test]
fn aliases_reach_the_posterior() {
    let mut model = Model::new("y ~ x", linear_data(2)).unwrap();
    model.set_alias([("x", "slope"), ("sigma", "noise")]);
    let idata = model.fit(&settings()).unwrap();
    assert!(idata.posterior.contains("slope"));
    assert!(idata.posterior.contains("noise"));
    assert!(!idata.posterior.contains("x"));

    let mut rng = SmallRng::seed_from_u64(0);
    let options = PredictionsOptions::default();
    let summary = predictions(&model, &idata, &Conditional::from("x"), &options, &mut rng);
    assert_eq!(summary.unwrap().nrows(), 50);
}

#[test]
fn strong_priors_shrink_coefficients() {
    let options = ModelOptions {
        priors: vec![(
            "x".to_string(),
            Prior::new("Normal").with("mu", 0.0).with("sigma", 0.01).into(),
        )],
        ..Default::default()
    };
    let model = Model::with_options("y ~ x", linear_data(3), options).unwrap();
    let idata = model.fit(&settings()).unwrap();
    assert!(posterior_mean(&idata, "x").abs() < 0.05);
}

#[test]
fn design_blocks_follow_the_formula() {
    let model = Model::new("y ~ x + g + (1 | g)", linear_data(4)).unwrap();
    let spec = model.build().unwrap();
    let blocks = &spec.predictors[0].blocks;
    let names: Vec<&str> = blocks.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec!["Intercept", "x", "g", "1|g"]);
    assert_eq!(blocks[2].ncols(), 2);
    assert!(matches!(
        blocks[3].kind,
        BlockKind::GroupSpecific { n_groups: 3, n_expr: 1, .. }
    ));
    assert_eq!(spec.n_obs(), N);
}

/// `y = offset[g] + x + noise` at 150 rows, with offsets -2, 1 and 4.
fn grouped_data(seed: u64) -> DataFrame {
    let n = 150;
    let offsets = [-2.0, 1.0, 4.0];
    let mut rng = SmallRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.5).unwrap();
    let x: Vec<f64> = (0..n).map(|i| -2.0 + 4.0 * i as f64 / (n - 1) as f64).collect();
    let y = x
        .iter()
        .enumerate()
        .map(|(i, x)| offsets[i % 3] + x + noise.sample(&mut rng))
        .collect();
    let g = (0..n).map(|i| ["a", "b", "c"][i % 3].to_string()).collect();
    DataFrame::from_columns([
        ("y", Column::Numeric(y)),
        ("x", Column::Numeric(x)),
        ("g", Column::Categorical(g)),
    ])
    .unwrap()
}

#[test]
fn group_intercepts_are_recovered() {
    let truth = [("a", -2.0), ("b", 1.0), ("c", 4.0)];
    for noncentered in [true, false] {
        let options = ModelOptions {
            noncentered,
            ..Default::default()
        };
        let model = Model::with_options("y ~ x + (1 | g)", grouped_data(7), options).unwrap();
        let idata = model.fit(&settings()).unwrap();

        let conditional = Conditional::Values(vec![
            ("x".to_string(), vec![Value::Number(0.0)]),
            ("g".to_string(), truth.iter().map(|(g, _)| Value::from(*g)).collect()),
        ]);
        let mut rng = SmallRng::seed_from_u64(0);
        let options = PredictionsOptions::default();
        let summary = predictions(&model, &idata, &conditional, &options, &mut rng).unwrap();
        assert_eq!(summary.nrows(), 3);

        let groups = summary.column("g").unwrap();
        let estimate = summary.numeric("estimate").unwrap();
        let lower = summary.numeric("lower_3.0%").unwrap();
        let upper = summary.numeric("upper_97.0%").unwrap();
        for row in 0..3 {
            let (_, expected) = truth.iter().find(|(g, _)| *g == groups.level(row)).unwrap();
            assert_relative_eq!(estimate[row], *expected, epsilon = 0.3);
            assert!(upper[row] - lower[row] < 0.6, "interval of {} is too wide", groups.level(row));
        }
        assert!(posterior_mean(&idata, "1|g_sigma") > 1.0);
    }
}

#[test]
fn laplace_is_opt_in() {
    let model = Model::new("y ~ x", linear_data(1)).unwrap();
    let laplace = FitSettings {
        method: Method::Laplace,
        ..settings()
    };
    let approx = model.fit(&laplace).unwrap();
    let (_, sampled) = fit("y ~ x");
    assert_relative_eq!(
        posterior_mean(&approx, "x"),
        posterior_mean(&sampled, "x"),
        epsilon = 0.05
    );

    let grouped = Model::new("y ~ x + (1 | g)", grouped_data(7)).unwrap();
    assert!(grouped.fit(&laplace).is_err());
}

#[test]
fn poisson_regression() {
    let mut rng = SmallRng::seed_from_u64(5);
    let x: Vec<f64> = (0..N).map(|i| -1.0 + 2.0 * i as f64 / (N - 1) as f64).collect();
    let y = x
        .iter()
        .map(|x| Poisson::new((1.5 + 0.8 * x).exp()).unwrap().sample(&mut rng))
        .collect();
    let data =
        DataFrame::from_columns([("y", Column::Numeric(y)), ("x", Column::Numeric(x))]).unwrap();
    let options = ModelOptions {
        family: "poisson".into(),
        ..Default::default()
    };
    let model = Model::with_options("y ~ x", data, options).unwrap();
    let idata = model.fit(&settings()).unwrap();
    assert_relative_eq!(posterior_mean(&idata, "x"), 0.8, epsilon = 0.3);
}

#[test]
fn models_from_arrow_batches() {
    let frame = linear_data(6);
    let batch = frame.to_record_batch().unwrap();
    assert_eq!(DataFrame::from_record_batch(&batch).unwrap(), frame);

    let columns: Vec<(&str, ArrayRef)> = vec![
        ("y", Arc::new(Float64Array::from(vec![1.0, 2.5, 2.0, 4.0, 3.5, 5.0]))),
        ("g", Arc::new(StringArray::from(vec!["u", "v", "u", "v", "u", "v"]))),
    ];
    let batch = RecordBatch::try_from_iter(columns).unwrap();
    let data = DataFrame::from_record_batch(&batch).unwrap();
    let model = Model::new("y ~ g", data).unwrap();
    assert_eq!(model.covariates(), vec!["g".to_string()]);
}
