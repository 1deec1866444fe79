use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use itertools::{iproduct, Itertools};
use ndarray::{Array2, ArrayView1, Axis, Zip};
use rand::Rng;

use crate::data::{mean, Column, DataFrame, Value};
use crate::dims::{DataArray, Dim};
use crate::draws::InferenceData;
use crate::error::{DataError, ModelError, Result};
use crate::interpret::create_data::{cap_data, differences_data, side_rows, Contrast};
use crate::interpret::stats::{Interval, Summary};
use crate::interpret::utils::{
    check_covariates, default_contrast_values, enforce_type, AverageBy, Conditional, VariableSpec,
};
use crate::model::{Model, PredictionKind};

/// A function applied to draws before they are summarized.
pub type Transform = fn(f64) -> f64;

/// Options of [`predictions`].
#[derive(Debug, Clone)]
pub struct PredictionsOptions {
    /// Parameter of the likelihood to summarize, `"mean"` for the mean of
    /// the response.
    pub target: String,
    /// Summarize draws of the posterior predictive distribution instead of
    /// the parameter.
    pub pps: bool,
    pub use_hdi: bool,
    pub prob: f64,
    /// Values of a numeric main covariate.
    pub grid_n: usize,
    /// Quantiles of numeric group and panel covariates.
    pub groups_n: usize,
    /// Keyed by the name of the summarized variable.
    pub transforms: Vec<(String, Transform)>,
}

impl Default for PredictionsOptions {
    fn default() -> Self {
        Self {
            target: "mean".to_string(),
            pps: false,
            use_hdi: true,
            prob: 0.94,
            grid_n: 50,
            groups_n: 5,
            transforms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonType {
    #[default]
    Diff,
    Ratio,
}

impl ComparisonType {
    fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            ComparisonType::Diff => x - y,
            ComparisonType::Ratio => x / y,
        }
    }
}

impl fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonType::Diff => f.write_str("diff"),
            ComparisonType::Ratio => f.write_str("ratio"),
        }
    }
}

impl FromStr for ComparisonType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diff" => Ok(ComparisonType::Diff),
            "ratio" => Ok(ComparisonType::Ratio),
            _ => Err(ModelError::ComparisonType(s.to_string())),
        }
    }
}

/// Scale of a slope: `d` for the response or covariate itself, `e` for a
/// relative change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlopeType {
    #[default]
    Dydx,
    Dyex,
    Eyex,
    Eydx,
}

impl SlopeType {
    fn scale(self, dydx: f64, x: f64, y: f64) -> f64 {
        match self {
            SlopeType::Dydx => dydx,
            SlopeType::Dyex => dydx * x,
            SlopeType::Eyex => dydx * x / y,
            SlopeType::Eydx => dydx / y,
        }
    }
}

impl fmt::Display for SlopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlopeType::Dydx => "dydx",
            SlopeType::Dyex => "dyex",
            SlopeType::Eyex => "eyex",
            SlopeType::Eydx => "eydx",
        };
        f.write_str(name)
    }
}

impl FromStr for SlopeType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dydx" => Ok(SlopeType::Dydx),
            "dyex" => Ok(SlopeType::Dyex),
            "eyex" => Ok(SlopeType::Eyex),
            "eydx" => Ok(SlopeType::Eydx),
            _ => Err(ModelError::SlopeType(s.to_string())),
        }
    }
}

/// Options of [`comparisons`].
#[derive(Debug, Clone)]
pub struct ComparisonsOptions {
    pub comparison_type: ComparisonType,
    pub average_by: Option<AverageBy>,
    pub use_hdi: bool,
    pub prob: f64,
    pub grid_n: usize,
    pub groups_n: usize,
}

impl Default for ComparisonsOptions {
    fn default() -> Self {
        Self {
            comparison_type: ComparisonType::Diff,
            average_by: None,
            use_hdi: true,
            prob: 0.94,
            grid_n: 50,
            groups_n: 5,
        }
    }
}

/// Options of [`slopes`].
#[derive(Debug, Clone)]
pub struct SlopesOptions {
    pub slope: SlopeType,
    /// Step of the finite difference.
    pub eps: f64,
    pub average_by: Option<AverageBy>,
    pub use_hdi: bool,
    pub prob: f64,
    pub grid_n: usize,
    pub groups_n: usize,
}

impl Default for SlopesOptions {
    fn default() -> Self {
        Self {
            slope: SlopeType::Dydx,
            eps: 1e-4,
            average_by: None,
            use_hdi: true,
            prob: 0.94,
            grid_n: 50,
            groups_n: 5,
        }
    }
}

/// Draws flattened to (samples, rows * levels), levels varying fastest.
struct Draws {
    samples: Array2<f64>,
    levels: Option<Vec<String>>,
}

impl Draws {
    fn new(array: &DataArray, response: &str) -> Result<Self> {
        let dim = Dim::mean_levels(response);
        let levels = match array.coords(&dim) {
            Some(labels) => Some(labels.to_vec()),
            None => array.len_of(&dim).map(|n| (0..n).map(|i| i.to_string()).collect()),
        };
        Ok(Self {
            samples: array.samples()?,
            levels,
        })
    }

    fn n_levels(&self) -> usize {
        self.levels.as_ref().map_or(1, Vec::len)
    }

    fn rows(&self, rows: &[usize]) -> Array2<f64> {
        let l = self.n_levels();
        let cells: Vec<usize> = rows.iter().flat_map(|&r| (0..l).map(move |k| r * l + k)).collect();
        self.samples.select(Axis(1), &cells)
    }
}

/// Repeats every row once per response level and adds the level column.
fn expand_levels(frame: DataFrame, levels: Option<&[String]>, response: &str) -> Result<DataFrame> {
    let Some(levels) = levels else {
        return Ok(frame);
    };
    let n = frame.nrows();
    let rows: Vec<usize> = (0..n).flat_map(|r| std::iter::repeat(r).take(levels.len())).collect();
    let mut out = frame.take_rows(&rows);
    let labels = (0..n).flat_map(|_| levels.iter().cloned()).collect();
    out.insert(Dim::mean_levels(response).name(), Column::Categorical(labels))?;
    Ok(out)
}

fn insert_summary(frame: &mut DataFrame, interval: &Interval, summary: Summary) -> Result<()> {
    frame.insert("estimate", Column::Numeric(summary.estimate))?;
    frame.insert(interval.lower_name(), Column::Numeric(summary.lower))?;
    frame.insert(interval.upper_name(), Column::Numeric(summary.upper))?;
    Ok(())
}

/// Draws of `target` for the rows the means were just computed on.
fn target_draws(
    model: &Model,
    idata: &InferenceData,
    target: &str,
    n_rows: usize,
) -> Result<(String, DataArray)> {
    let component = if target == "mean" {
        Some(model.response_component())
    } else {
        model.components().iter().find(|c| c.name() == target)
    };
    if let Some(component) = component {
        let name = component.var_name();
        let array = idata.posterior.require(&name)?.clone();
        return Ok((name, array));
    }
    match model.constant_components().iter().find(|c| c.param() == target) {
        Some(constant) => Ok((
            constant.var_name().to_string(),
            constant.predict(&idata.posterior, model.response_var(), n_rows)?,
        )),
        None => Err(ModelError::TermNotFound(target.to_string())),
    }
}

/// Conditional adjusted predictions.
///
/// Evaluates the model on a grid of the `conditional` covariates and
/// summarizes the draws of the target on every row of the grid. The summary
/// holds the grid, `estimate` and the interval bounds.
pub fn predictions<R: Rng + ?Sized>(
    model: &Model,
    idata: &InferenceData,
    conditional: &Conditional,
    options: &PredictionsOptions,
    rng: &mut R,
) -> Result<DataFrame> {
    if options.pps && options.target != "mean" {
        return Err(ModelError::PpsTarget);
    }
    let interval = Interval::new(options.prob, options.use_hdi)?;
    let data = cap_data(model, conditional, options.grid_n, options.groups_n)?;
    let response = model.response_var().to_string();

    let mut idata = idata.clone();
    let (name, array) = if options.pps {
        model.predict_with(&mut idata, PredictionKind::Pps, Some(&data), true, rng)?;
        let pps = idata
            .posterior_predictive
            .as_ref()
            .ok_or_else(|| ModelError::MissingDraws(response.clone()))?;
        (response.clone(), pps.require(&response)?.clone())
    } else {
        model.insert_means(&mut idata.posterior, Some(&data), true)?;
        target_draws(model, &idata, &options.target, data.nrows())?
    };
    let array = match options.transforms.iter().find(|(key, _)| *key == response || *key == name) {
        Some((_, transform)) => array.map(transform),
        None => array,
    };

    let draws = Draws::new(&array, &response)?;
    let summary = interval.summarize(&draws.samples);
    let mut frame = expand_levels(data, draws.levels.as_deref(), &response)?;
    insert_summary(&mut frame, &interval, summary)?;
    Ok(frame)
}

#[derive(Debug, Clone, Copy)]
enum Effect {
    Comparison(ComparisonType),
    Slope { slope: SlopeType, eps: f64 },
}

impl Effect {
    fn name(&self) -> String {
        match self {
            Effect::Comparison(kind) => kind.to_string(),
            Effect::Slope { slope, .. } => slope.to_string(),
        }
    }
}

/// Draws of an effect for every pair of sides of a contrast.
struct Differences {
    contrast: Contrast,
    effect: Effect,
    response: String,
    interval: Interval,
    /// Covariates of the rows of the first side, contrast variable excluded.
    covariates: DataFrame,
    n_rows: usize,
    /// Per pair and row, the values of the contrast variable on both sides.
    values: Vec<Vec<String>>,
    /// Per pair, (samples, rows * levels).
    effects: Vec<Array2<f64>>,
    levels: Option<Vec<String>>,
}

impl Differences {
    #[allow(clippy::too_many_arguments)]
    fn new(
        model: &Model,
        idata: &InferenceData,
        contrast: Contrast,
        conditional: Option<&Conditional>,
        effect: Effect,
        interval: Interval,
        grid_n: usize,
        groups_n: usize,
    ) -> Result<Self> {
        let data = differences_data(model, conditional, &contrast, grid_n, groups_n)?;
        let mut posterior = idata.posterior.clone();
        model.insert_means(&mut posterior, Some(&data), true)?;
        let response = model.response_var().to_string();
        let mean = posterior.require(&model.response_component().var_name())?;
        let draws = Draws::new(mean, &response)?;

        let sides = side_rows(&data, &contrast, conditional.is_none())?;
        let n_rows = sides.first().map_or(0, Vec::len);
        if sides.iter().any(|side| side.len() != n_rows) {
            return Err(ModelError::Dimension {
                name: contrast.name.clone(),
                reason: "the sides of the contrast cover different numbers of rows".to_string(),
            });
        }

        let column = data.column(&contrast.name)?;
        let l = draws.n_levels();
        let mut effects = Vec::with_capacity(contrast.pairs.len());
        let mut values = Vec::with_capacity(contrast.pairs.len());
        for &(left, right) in &contrast.pairs {
            let y0 = draws.rows(&sides[left]);
            let y1 = draws.rows(&sides[right]);
            let estimate = match effect {
                Effect::Comparison(kind) => {
                    Zip::from(&y1).and(&y0).map_collect(|&a, &b| kind.apply(a, b))
                }
                Effect::Slope { slope, eps } => {
                    let x: Vec<f64> = sides[right]
                        .iter()
                        .map(|&row| column.value(row).as_number().unwrap_or(f64::NAN))
                        .collect();
                    Array2::from_shape_fn(y1.dim(), |(s, cell)| {
                        let dydx = (y1[[s, cell]] - y0[[s, cell]]) / eps;
                        slope.scale(dydx, x[cell / l], y1[[s, cell]])
                    })
                }
            };
            effects.push(estimate);
            values.push(
                sides[left]
                    .iter()
                    .zip(&sides[right])
                    .map(|(&a, &b)| format!("({}, {})", column.value(a), column.value(b)))
                    .collect(),
            );
        }

        let mut covariates = data.take_rows(sides.first().map_or(&[][..], Vec::as_slice));
        covariates.remove(&contrast.name);
        Ok(Self {
            contrast,
            effect,
            response,
            interval,
            covariates,
            n_rows,
            values,
            effects,
            levels: draws.levels,
        })
    }

    fn n_levels(&self) -> usize {
        self.levels.as_ref().map_or(1, Vec::len)
    }

    fn labels(&self, n: usize) -> (Column, Column) {
        (
            Column::Categorical(vec![self.contrast.name.clone(); n]),
            Column::Categorical(vec![self.effect.name(); n]),
        )
    }

    /// One row per pair, covariate row and response level.
    fn summary(&self) -> Result<DataFrame> {
        let l = self.n_levels();
        let cells: Vec<(usize, usize, usize)> =
            iproduct!(0..self.effects.len(), 0..self.n_rows, 0..l).collect();
        let rows: Vec<usize> = cells.iter().map(|&(_, r, _)| r).collect();

        let (term, estimate_type) = self.labels(cells.len());
        let mut frame = DataFrame::new();
        frame.insert("term", term)?;
        frame.insert("estimate_type", estimate_type)?;
        frame.insert(
            "value",
            Column::Categorical(cells.iter().map(|&(p, r, _)| self.values[p][r].clone()).collect()),
        )?;
        for (name, column) in self.covariates.columns() {
            frame.insert(name, column.take(&rows))?;
        }
        if let Some(levels) = &self.levels {
            let labels = cells.iter().map(|&(_, _, k)| levels[k].clone()).collect();
            frame.insert(Dim::mean_levels(&self.response).name(), Column::Categorical(labels))?;
        }

        let mut summary = Summary::default();
        for effect in &self.effects {
            summary.extend(self.interval.summarize(effect));
        }
        insert_summary(&mut frame, &self.interval, summary)?;
        Ok(frame)
    }

    /// Averages the effect over the rows sharing the values of `by`, draw by
    /// draw, before summarizing.
    fn average_by(&self, by: &AverageBy) -> Result<DataFrame> {
        let names: Vec<String> = match by {
            AverageBy::All => Vec::new(),
            AverageBy::Variables(names) => names.iter().cloned().unique().collect(),
        };
        let columns = names
            .iter()
            .map(|name| {
                self.covariates
                    .get(name)
                    .ok_or_else(|| ModelError::NotACovariate(name.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let keys: Vec<Vec<Value>> = (0..self.n_rows)
            .map(|row| columns.iter().map(|c| c.value(row)).collect())
            .collect();
        let mut unique = keys.clone();
        unique.sort_by(|a, b| compare_keys(a, b));
        unique.dedup();
        let groups: Vec<Vec<usize>> = unique
            .iter()
            .map(|key| (0..self.n_rows).filter(|&row| keys[row] == *key).collect())
            .collect();

        let l = self.n_levels();
        let cells: Vec<(usize, usize, usize)> =
            iproduct!(0..self.effects.len(), 0..groups.len(), 0..l).collect();
        let mut summary = Summary::default();
        for &(p, g, k) in &cells {
            let columns: Vec<usize> = groups[g].iter().map(|&row| row * l + k).collect();
            let averaged: Vec<f64> = self.effects[p]
                .select(Axis(1), &columns)
                .rows()
                .into_iter()
                .map(|draw| mean(&draw.to_vec()))
                .collect();
            summary.push(&self.interval, ArrayView1::from(averaged.as_slice()));
        }

        let (term, estimate_type) = self.labels(cells.len());
        let mut frame = DataFrame::new();
        frame.insert("term", term)?;
        frame.insert("estimate_type", estimate_type)?;
        if let Effect::Comparison(_) = self.effect {
            let labels = cells
                .iter()
                .map(|&(p, _, _)| {
                    let (left, right) = self.contrast.pairs[p];
                    format!(
                        "({}, {})",
                        side_label(&self.contrast.sides[left]),
                        side_label(&self.contrast.sides[right])
                    )
                })
                .collect();
            frame.insert("value", Column::Categorical(labels))?;
        }
        for (idx, name) in names.iter().enumerate() {
            let cells: Vec<Value> = cells.iter().map(|&(_, g, _)| unique[g][idx].clone()).collect();
            frame.insert(name.clone(), Column::from_values(name, &cells)?)?;
        }
        if let Some(levels) = &self.levels {
            let labels = cells.iter().map(|&(_, _, k)| levels[k].clone()).collect();
            frame.insert(Dim::mean_levels(&self.response).name(), Column::Categorical(labels))?;
        }
        insert_summary(&mut frame, &self.interval, summary)?;
        Ok(frame)
    }

    fn finish(self, average_by: Option<&AverageBy>) -> Result<DataFrame> {
        match average_by {
            Some(by) => self.average_by(by),
            None => self.summary(),
        }
    }
}

fn side_label(side: &[Value]) -> String {
    match side {
        [value] => value.to_string(),
        _ => side.iter().join(", "),
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
        (Value::Level(x), Value::Level(y)) => x.cmp(y),
        (Value::Number(_), Value::Level(_)) => Ordering::Less,
        (Value::Level(_), Value::Number(_)) => Ordering::Greater,
    }
}

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_values(x, y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Every level of a categorical contrast, or a one unit change around the
/// mean of a numeric one, unless values are given.
fn comparison_contrast(model: &Model, spec: &VariableSpec) -> Result<Contrast> {
    let (name, values) = match spec {
        VariableSpec::Name(name) => {
            check_covariates(model, &[name.as_str()])?;
            let values = default_contrast_values(model.data().column(name)?);
            log::info!("Default computed for contrast variable: {name}");
            (name.clone(), values)
        }
        VariableSpec::Values(given) => {
            let [(name, values)] = given.as_slice() else {
                return Err(ModelError::TooManyContrasts(given.len()));
            };
            check_covariates(model, &[name.as_str()])?;
            (name.clone(), enforce_type(model.data().column(name)?, values))
        }
    };
    Ok(Contrast::pairwise(name, values.into_iter().map(|v| vec![v]).collect()))
}

/// Predictive comparisons.
///
/// Compares the mean of the response between the values of `contrast`,
/// pairwise, conditional on `conditional` or on the observed data when it
/// is `None`.
pub fn comparisons(
    model: &Model,
    idata: &InferenceData,
    contrast: &VariableSpec,
    conditional: Option<&Conditional>,
    options: &ComparisonsOptions,
) -> Result<DataFrame> {
    let interval = Interval::new(options.prob, options.use_hdi)?;
    let contrast = comparison_contrast(model, contrast)?;
    Differences::new(
        model,
        idata,
        contrast,
        conditional,
        Effect::Comparison(options.comparison_type),
        interval,
        options.grid_n,
        options.groups_n,
    )?
    .finish(options.average_by.as_ref())
}

/// Slopes of the mean of the response with respect to `wrt`, from a
/// forward difference of size `eps`.
///
/// A categorical `wrt` has no slope, the difference between its levels is
/// returned instead.
pub fn slopes(
    model: &Model,
    idata: &InferenceData,
    wrt: &VariableSpec,
    conditional: Option<&Conditional>,
    options: &SlopesOptions,
) -> Result<DataFrame> {
    if let VariableSpec::Values(given) = wrt {
        if conditional.is_none() {
            return Err(ModelError::WrtWithoutConditional);
        }
        if given.len() != 1 {
            return Err(ModelError::TooManyWrt(given.len()));
        }
    }
    let interval = Interval::new(options.prob, options.use_hdi)?;
    let name = wrt.name().ok_or(ModelError::TooManyWrt(0))?.to_string();
    check_covariates(model, &[name.as_str()])?;
    let column = model.data().column(&name)?;

    let Column::Numeric(observed) = column else {
        let contrast = comparison_contrast(model, wrt)?;
        return Differences::new(
            model,
            idata,
            contrast,
            conditional,
            Effect::Comparison(ComparisonType::Diff),
            interval,
            options.grid_n,
            options.groups_n,
        )?
        .finish(options.average_by.as_ref());
    };

    let original: Vec<Value> = match (wrt, conditional) {
        (VariableSpec::Values(given), _) => given[0].1.clone(),
        (VariableSpec::Name(_), Some(_)) => {
            log::info!("Default computed for wrt variable: {name}");
            vec![Value::Number(mean(observed))]
        }
        (VariableSpec::Name(_), None) => {
            log::info!("Default computed for wrt variable: {name}");
            observed.iter().copied().map(Value::Number).collect()
        }
    };
    let eps = options.eps;
    let shifted = original
        .iter()
        .map(|value| match value {
            Value::Number(x) => Ok(Value::Number(x + eps)),
            Value::Level(_) => Err(DataError::NotNumeric(name.clone())),
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let contrast = Contrast::pairwise(name, vec![original, shifted]);
    Differences::new(
        model,
        idata,
        contrast,
        conditional,
        Effect::Slope {
            slope: options.slope,
            eps,
        },
        interval,
        options.grid_n,
        options.groups_n,
    )?
    .finish(options.average_by.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draws::Dataset;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn draws(values: &[f64]) -> DataArray {
        DataArray::from_draws(Array2::from_shape_vec((1, values.len()), values.to_vec()).unwrap())
    }

    fn data() -> DataFrame {
        let n = 12;
        DataFrame::from_columns([
            ("y", Column::Numeric((0..n).map(|i| 1.0 + 0.5 * i as f64 + (i % 3) as f64).collect())),
            ("x", Column::Numeric((0..n).map(|i| i as f64).collect())),
            (
                "g",
                Column::Categorical((0..n).map(|i| ["a", "b", "c"][i % 3].to_string()).collect()),
            ),
        ])
        .unwrap()
    }

    /// `y ~ x + g` with known draws: intercept 1, slope 2 on average, and
    /// offsets 1 and 3 for the levels b and c.
    fn fitted() -> (Model, InferenceData) {
        let model = Model::new("y ~ x + g", data()).unwrap();
        let mut posterior = Dataset::new();
        posterior.insert("Intercept", draws(&[1.0, 1.0, 1.0, 1.0]));
        posterior.insert("x", draws(&[1.5, 2.0, 2.5, 2.0]));
        let g = DataArray::new(
            vec![Dim::chain(), Dim::draw(), Dim::term("g")],
            Array2::from_shape_vec((4, 2), vec![1.0, 3.0, 1.0, 3.0, 1.0, 3.0, 1.0, 3.0])
                .unwrap()
                .into_shape_with_order((1, 4, 2))
                .unwrap()
                .into_dyn(),
        )
        .unwrap();
        posterior.insert("g", g);
        posterior.insert("y_sigma", draws(&[1.0, 1.0, 1.0, 1.0]));
        (model, InferenceData::new(posterior))
    }

    #[test]
    fn predictions_follow_the_linear_predictor() {
        let (model, idata) = fitted();
        let options = PredictionsOptions {
            grid_n: 3,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let conditional = Conditional::names(["x", "g"]);
        let summary = predictions(&model, &idata, &conditional, &options, &mut rng).unwrap();
        assert_eq!(
            summary.names(),
            &["x", "g", "estimate", "lower_3.0%", "upper_97.0%"]
        );
        assert_eq!(summary.nrows(), 9);
        let x = summary.numeric("x").unwrap();
        let estimate = summary.numeric("estimate").unwrap();
        // rows 3..6 are the level b
        assert_relative_eq!(estimate[0], 1.0 + 2.0 * x[0], epsilon = 1e-12);
        assert_relative_eq!(estimate[4], 1.0 + 2.0 * x[4] + 1.0, epsilon = 1e-12);
        let lower = summary.numeric("lower_3.0%").unwrap();
        let upper = summary.numeric("upper_97.0%").unwrap();
        assert!(lower.iter().zip(estimate).zip(upper).all(|((l, e), u)| l <= e && e <= u));
    }

    #[test]
    fn transforms_apply_before_summarizing() {
        let (model, idata) = fitted();
        let options = PredictionsOptions {
            grid_n: 2,
            transforms: vec![("y".to_string(), f64::exp as Transform)],
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let summary =
            predictions(&model, &idata, &Conditional::from("x"), &options, &mut rng).unwrap();
        // g is held at its mode, the levels are tied and a wins
        assert_relative_eq!(summary.numeric("estimate").unwrap()[0], 1f64.exp());
    }

    #[test]
    fn pps_needs_the_mean_target() {
        let (model, idata) = fitted();
        let options = PredictionsOptions {
            pps: true,
            target: "sigma".to_string(),
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let err =
            predictions(&model, &idata, &Conditional::from("x"), &options, &mut rng).unwrap_err();
        assert!(matches!(err, ModelError::PpsTarget));
    }

    #[test]
    fn constant_targets_are_broadcast() {
        let (model, idata) = fitted();
        let options = PredictionsOptions {
            target: "sigma".to_string(),
            grid_n: 4,
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(0);
        let summary =
            predictions(&model, &idata, &Conditional::from("x"), &options, &mut rng).unwrap();
        assert_eq!(summary.numeric("estimate").unwrap(), &[1.0; 4]);
    }

    #[test]
    fn categorical_contrasts_compare_every_pair() {
        let (model, idata) = fitted();
        let options = ComparisonsOptions::default();
        let conditional = Conditional::from("x");
        let summary =
            comparisons(&model, &idata, &VariableSpec::from("g"), Some(&conditional), &options)
                .unwrap();
        // three pairs over a grid of 50 values of x
        assert_eq!(summary.nrows(), 150);
        assert_eq!(&summary.names()[..4], &["term", "estimate_type", "value", "x"]);
        let estimate = summary.numeric("estimate").unwrap();
        assert_relative_eq!(estimate[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(estimate[50], 3.0, epsilon = 1e-12);
        assert_relative_eq!(estimate[100], 2.0, epsilon = 1e-12);
        assert_eq!(summary.column("value").unwrap().level(60), "(a, c)");
    }

    #[test]
    fn ratios_divide_the_means() {
        let (model, idata) = fitted();
        let options = ComparisonsOptions {
            comparison_type: ComparisonType::Ratio,
            use_hdi: false,
            ..Default::default()
        };
        let contrast = VariableSpec::values("x", [1.0, 3.0]);
        let conditional = Conditional::Values(vec![("g".to_string(), vec![Value::from("a")])]);
        let summary = comparisons(&model, &idata, &contrast, Some(&conditional), &options).unwrap();
        assert_eq!(summary.nrows(), 1);
        let expected = [(1.0 + 3.0 * 1.5) / 2.5, 7.0 / 3.0, (1.0 + 3.0 * 2.5) / 3.5, 7.0 / 3.0];
        assert_relative_eq!(
            summary.numeric("estimate").unwrap()[0],
            expected.iter().sum::<f64>() / 4.0,
            epsilon = 1e-12
        );
        assert!(summary.contains("lower_3.0%"));
    }

    #[test]
    fn unit_level_comparisons_average_to_one_row() {
        let (model, idata) = fitted();
        let options = ComparisonsOptions {
            average_by: Some(AverageBy::All),
            ..Default::default()
        };
        let contrast = VariableSpec::from("x");
        let summary = comparisons(&model, &idata, &contrast, None, &options).unwrap();
        assert_eq!(summary.nrows(), 1);
        assert_eq!(
            summary.column("value").unwrap().level(0),
            format!("({}, {})", 5.5 - 0.5, 5.5 + 0.5)
        );
        assert_relative_eq!(summary.numeric("estimate").unwrap()[0], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn slopes_recover_the_coefficient() {
        let (model, idata) = fitted();
        let options = SlopesOptions::default();
        let summary = slopes(&model, &idata, &VariableSpec::from("x"), None, &options).unwrap();
        assert_eq!(summary.nrows(), 12);
        for estimate in summary.numeric("estimate").unwrap() {
            assert_relative_eq!(*estimate, 2.0, epsilon = 1e-6);
        }
        let averaged = slopes(
            &model,
            &idata,
            &VariableSpec::from("x"),
            None,
            &SlopesOptions {
                average_by: Some(AverageBy::from("g")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(&averaged.names()[..3], &["term", "estimate_type", "g"]);
        assert_eq!(averaged.nrows(), 3);
        assert_eq!(averaged.column("estimate_type").unwrap().level(0), "dydx");
    }

    #[test]
    fn elasticities_scale_by_x_over_y() {
        let (model, idata) = fitted();
        let options = SlopesOptions {
            slope: SlopeType::Eyex,
            ..Default::default()
        };
        let wrt = VariableSpec::values("x", [2.0]);
        let conditional = Conditional::Values(vec![("g".to_string(), vec![Value::from("a")])]);
        let summary = slopes(&model, &idata, &wrt, Some(&conditional), &options).unwrap();
        assert_eq!(summary.nrows(), 1);
        let expected = [1.5, 2.0, 2.5, 2.0]
            .iter()
            .map(|b| b * 2.0 / (1.0 + b * 2.0))
            .sum::<f64>()
            / 4.0;
        assert_relative_eq!(summary.numeric("estimate").unwrap()[0], expected, epsilon = 1e-3);
    }

    #[test]
    fn categorical_wrt_falls_back_to_differences() {
        let (model, idata) = fitted();
        let options = SlopesOptions::default();
        let summary = slopes(&model, &idata, &VariableSpec::from("g"), None, &options).unwrap();
        assert_eq!(summary.column("estimate_type").unwrap().level(0), "diff");
        assert_eq!(summary.nrows(), 36);
    }

    #[test]
    fn argument_errors() {
        let (model, idata) = fitted();
        let wrt = VariableSpec::values("x", [1.0]);
        let err = slopes(&model, &idata, &wrt, None, &SlopesOptions::default()).unwrap_err();
        assert!(matches!(err, ModelError::WrtWithoutConditional));

        let two = VariableSpec::Values(vec![
            ("x".to_string(), vec![Value::Number(1.0)]),
            ("g".to_string(), vec![Value::from("a")]),
        ]);
        let options = ComparisonsOptions::default();
        let err = comparisons(&model, &idata, &two, None, &options).unwrap_err();
        assert!(matches!(err, ModelError::TooManyContrasts(2)));
        let conditional = Conditional::from("g");
        let err = slopes(&model, &idata, &two, Some(&conditional), &SlopesOptions::default())
            .unwrap_err();
        assert!(matches!(err, ModelError::TooManyWrt(2)));

        let options = ComparisonsOptions {
            prob: 1.5,
            ..Default::default()
        };
        let contrast = VariableSpec::from("x");
        let err = comparisons(&model, &idata, &contrast, None, &options).unwrap_err();
        assert!(matches!(err, ModelError::Probability(_)));

        assert!(matches!("mean".parse::<ComparisonType>(), Err(ModelError::ComparisonType(_))));
        assert!(matches!("dxdy".parse::<SlopeType>(), Err(ModelError::SlopeType(_))));
        assert_eq!("eyex".parse::<SlopeType>().unwrap(), SlopeType::Eyex);
    }
}
