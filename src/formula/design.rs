//! Evaluation of parsed formulas against data.
//!
//! Encodings (categorical levels, which factors use the full set of
//! dummies) are fixed when the design is first built and reused when the
//! same structure is evaluated on new rows.

use std::collections::BTreeSet;
use std::ops::Range;

use itertools::Itertools;
use ndarray::{concatenate, Array1, Array2, ArrayView2, Axis};

use crate::data::{Column, DataFrame};
use crate::error::{DataError, FormulaError, ModelError, Result};
use crate::formula::parser::{
    FactorSpec, GroupSpec, HsgpSpec, ParsedFormula, ResponseSpec, TermSpec, Trials,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Intercept,
    Numeric,
    Categoric,
    Interaction,
    Offset,
    Hsgp,
}

impl TermKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TermKind::Intercept => "intercept",
            TermKind::Numeric => "numeric",
            TermKind::Categoric => "categoric",
            TermKind::Interaction => "interaction",
            TermKind::Offset => "offset",
            TermKind::Hsgp => "hsgp",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Encoding {
    Numeric,
    /// One dummy per level.
    Full(Vec<String>),
    /// The first level is the reference and gets no dummy.
    Reduced(Vec<String>),
}

impl Encoding {
    fn used_levels(&self) -> &[String] {
        match self {
            Encoding::Numeric => &[],
            Encoding::Full(levels) => levels,
            Encoding::Reduced(levels) => levels.get(1..).unwrap_or(&[]),
        }
    }

    fn all_levels(&self) -> &[String] {
        match self {
            Encoding::Numeric => &[],
            Encoding::Full(levels) | Encoding::Reduced(levels) => levels,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct EncodedFactor {
    spec: FactorSpec,
    encoding: Encoding,
}

impl EncodedFactor {
    /// Columns contributed by this factor alone.
    fn columns(&self, data: &DataFrame) -> Result<Vec<Vec<f64>>> {
        let column = data.column(&self.spec.variable)?;
        match &self.encoding {
            Encoding::Numeric => match column {
                Column::Numeric(values) => Ok(vec![values.clone()]),
                Column::Categorical(_) => {
                    Err(DataError::NotNumeric(self.spec.variable.clone()).into())
                }
            },
            encoding => {
                let all = encoding.all_levels();
                let rows: Vec<String> = (0..column.len()).map(|i| column.level(i)).collect();
                if let Some(unknown) = rows.iter().find(|l| !all.contains(l)) {
                    return Err(FormulaError::UnknownLevel {
                        variable: self.spec.variable.clone(),
                        level: unknown.clone(),
                    }
                    .into());
                }
                Ok(encoding
                    .used_levels()
                    .iter()
                    .map(|level| rows.iter().map(|r| if r == level { 1.0 } else { 0.0 }).collect())
                    .collect())
            }
        }
    }

    fn labels(&self) -> Vec<(String, Option<String>)> {
        match &self.encoding {
            Encoding::Numeric => vec![(self.spec.name(), None)],
            encoding => encoding
                .used_levels()
                .iter()
                .map(|level| (format!("{}[{}]", self.spec.name(), level), Some(level.clone())))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Source {
    Intercept,
    Product(Vec<EncodedFactor>),
    Offset(String),
    Hsgp(HsgpSpec),
}

/// A term with its encoding fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignTerm {
    name: String,
    kind: TermKind,
    source: Source,
    labels: Vec<String>,
    levels: Option<Vec<String>>,
}

impl DesignTerm {
    fn intercept() -> Self {
        Self {
            name: "Intercept".to_string(),
            kind: TermKind::Intercept,
            source: Source::Intercept,
            labels: vec!["Intercept".to_string()],
            levels: None,
        }
    }

    fn product(name: String, factors: Vec<EncodedFactor>) -> Self {
        let per_factor: Vec<Vec<(String, Option<String>)>> =
            factors.iter().map(EncodedFactor::labels).collect();
        let mut labels = Vec::new();
        let mut levels = Vec::new();
        for combo in per_factor.iter().multi_cartesian_product() {
            labels.push(combo.iter().map(|(label, _)| label).join(":"));
            levels.push(combo.iter().filter_map(|(_, level)| level.clone()).join(", "));
        }
        let categorical = factors.iter().any(|f| f.encoding != Encoding::Numeric);
        let kind = match (factors.len(), categorical) {
            (1, false) => TermKind::Numeric,
            (1, true) => TermKind::Categoric,
            _ => TermKind::Interaction,
        };
        Self {
            name,
            kind,
            source: Source::Product(factors),
            labels,
            levels: categorical.then_some(levels),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TermKind {
        self.kind
    }

    /// Labels of the design columns, like `x`, `a[b]` or `x:a[b]`.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Levels behind each column of categorical terms, `None` otherwise.
    pub fn levels(&self) -> Option<&[String]> {
        self.levels.as_deref()
    }

    pub fn ncols(&self) -> usize {
        self.labels.len()
    }

    pub fn hsgp(&self) -> Option<&HsgpSpec> {
        match &self.source {
            Source::Hsgp(spec) => Some(spec),
            _ => None,
        }
    }

    /// Variables read by the term.
    pub fn variables(&self) -> Vec<String> {
        match &self.source {
            Source::Intercept => vec![],
            Source::Product(factors) => factors.iter().map(|f| f.spec.variable.clone()).collect(),
            Source::Offset(v) => vec![v.clone()],
            Source::Hsgp(spec) => vec![spec.variable.clone()],
        }
    }

    /// The numeric block of this term evaluated on `data`.
    pub fn evaluate(&self, data: &DataFrame) -> Result<Array2<f64>> {
        let n = data.nrows();
        match &self.source {
            Source::Intercept => Ok(Array2::ones((n, 1))),
            Source::Offset(v) => numeric_block(data, v),
            Source::Hsgp(spec) => numeric_block(data, &spec.variable),
            Source::Product(factors) => {
                let per_factor = factors
                    .iter()
                    .map(|f| f.columns(data))
                    .collect::<Result<Vec<_>>>()?;
                let ncols = self.labels.len();
                let mut out = Array2::<f64>::ones((n, ncols));
                for (j, combo) in per_factor.iter().multi_cartesian_product().enumerate() {
                    for col in combo {
                        for (i, x) in col.iter().enumerate() {
                            out[(i, j)] *= x;
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

fn numeric_block(data: &DataFrame, name: &str) -> Result<Array2<f64>> {
    let values = data.numeric(name)?;
    Ok(Array1::from(values.to_vec()).insert_axis(Axis(1)))
}

fn is_categorical(data: &DataFrame, factor: &FactorSpec) -> Result<bool> {
    Ok(factor.categorical || !data.column(&factor.variable)?.is_numeric())
}

/// Picks an encoding for every factor of every term.
///
/// A categorical factor uses the full set of dummies when the term without
/// it is not spanned by the terms seen so far. At most one factor per term
/// uses the full set.
fn encode_terms(intercept: bool, terms: &[TermSpec], data: &DataFrame) -> Result<Vec<DesignTerm>> {
    let mut spanned: Vec<BTreeSet<String>> = Vec::new();
    let mut out = Vec::with_capacity(terms.len() + 1);
    if intercept {
        spanned.push(BTreeSet::new());
        out.push(DesignTerm::intercept());
    }
    for term in terms {
        match term {
            TermSpec::Offset(v) => {
                data.numeric(v)?;
                out.push(DesignTerm {
                    name: term.name(),
                    kind: TermKind::Offset,
                    source: Source::Offset(v.clone()),
                    labels: vec![term.name()],
                    levels: None,
                })
            }
            TermSpec::Hsgp(spec) => {
                data.numeric(&spec.variable)?;
                out.push(DesignTerm {
                    name: term.name(),
                    kind: TermKind::Hsgp,
                    source: Source::Hsgp(spec.clone()),
                    labels: vec![spec.variable.clone()],
                    levels: None,
                })
            }
            TermSpec::Product(factors) => {
                let names: BTreeSet<String> = factors.iter().map(FactorSpec::name).collect();
                let mut full: Option<String> = None;
                let mut encoded = Vec::with_capacity(factors.len());
                for factor in factors {
                    let encoding = if is_categorical(data, factor)? {
                        let levels = data.column(&factor.variable)?.unique_levels();
                        let mut rest = names.clone();
                        rest.remove(&factor.name());
                        if full.is_none() && !spanned.contains(&rest) {
                            full = Some(factor.name());
                            Encoding::Full(levels)
                        } else {
                            Encoding::Reduced(levels)
                        }
                    } else {
                        Encoding::Numeric
                    };
                    encoded.push(EncodedFactor {
                        spec: factor.clone(),
                        encoding,
                    });
                }
                if let Some(f) = full {
                    let mut rest = names.clone();
                    rest.remove(&f);
                    spanned.push(rest);
                }
                spanned.push(names);
                out.push(DesignTerm::product(term.name(), encoded));
            }
        }
    }
    Ok(out)
}

fn assemble(terms: &[DesignTerm], data: &DataFrame) -> Result<(Array2<f64>, Vec<Range<usize>>)> {
    let blocks = terms
        .iter()
        .map(|t| t.evaluate(data))
        .collect::<Result<Vec<_>>>()?;
    let mut slices = Vec::with_capacity(blocks.len());
    let mut start = 0;
    for block in &blocks {
        slices.push(start..start + block.ncols());
        start += block.ncols();
    }
    let matrix = if blocks.is_empty() {
        Array2::zeros((data.nrows(), 0))
    } else {
        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| ModelError::Dimension {
            name: "design".to_string(),
            reason: e.to_string(),
        })?
    };
    Ok((matrix, slices))
}

/// The common (population level) part of a design.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonDesign {
    terms: Vec<DesignTerm>,
    design_matrix: Array2<f64>,
    slices: Vec<Range<usize>>,
}

impl CommonDesign {
    fn new(intercept: bool, terms: &[TermSpec], data: &DataFrame) -> Result<Self> {
        let terms = encode_terms(intercept, terms, data)?;
        let (design_matrix, slices) = assemble(&terms, data)?;
        Ok(Self {
            terms,
            design_matrix,
            slices,
        })
    }

    pub fn terms(&self) -> &[DesignTerm] {
        &self.terms
    }

    pub fn term(&self, name: &str) -> Option<&DesignTerm> {
        self.terms.iter().find(|t| t.name == name)
    }

    pub fn design_matrix(&self) -> ArrayView2<f64> {
        self.design_matrix.view()
    }

    pub fn nrows(&self) -> usize {
        self.design_matrix.nrows()
    }

    pub fn slice(&self, name: &str) -> Option<Range<usize>> {
        let idx = self.terms.iter().position(|t| t.name == name)?;
        Some(self.slices[idx].clone())
    }

    /// Columns of term `name`.
    pub fn term_data(&self, name: &str) -> Option<ArrayView2<f64>> {
        let range = self.slice(name)?;
        Some(self.design_matrix.slice(ndarray::s![.., range]))
    }

    /// The same terms and encodings evaluated on new rows.
    pub fn evaluate_new_data(&self, data: &DataFrame) -> Result<Self> {
        let (design_matrix, slices) = assemble(&self.terms, data)?;
        Ok(Self {
            terms: self.terms.clone(),
            design_matrix,
            slices,
        })
    }

    /// Fails on the first term whose columns are linear combinations of
    /// the columns before it. Offsets and HSGP terms are skipped.
    fn check_full_rank(&self) -> Result<()> {
        let mut basis: Vec<Array1<f64>> = Vec::new();
        for (term, range) in self.terms.iter().zip(&self.slices) {
            if matches!(term.kind, TermKind::Offset | TermKind::Hsgp) {
                continue;
            }
            for j in range.clone() {
                let column = self.design_matrix.column(j).to_owned();
                let norm = column.dot(&column).sqrt();
                let mut residual = column;
                for q in &basis {
                    let proj = q.dot(&residual);
                    residual.scaled_add(-proj, q);
                }
                let rnorm = residual.dot(&residual).sqrt();
                if norm == 0.0 || rnorm <= 1e-10 * norm.max(1.0) {
                    return Err(ModelError::RankDeficient(term.name.clone()));
                }
                basis.push(residual / rnorm);
            }
        }
        Ok(())
    }
}

/// One `expr|factor` term of a group specific design.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTermDesign {
    name: String,
    expr: DesignTerm,
    factor: String,
    factor_variables: Vec<String>,
    groups: Vec<String>,
    predictor: Array2<f64>,
    group_index: Vec<usize>,
}

impl GroupTermDesign {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The expression part, `Intercept` for `1|g`.
    pub fn expr(&self) -> &DesignTerm {
        &self.expr
    }

    pub fn factor(&self) -> &str {
        &self.factor
    }

    /// Observed levels of the grouping factor, sorted.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// The expression evaluated on the rows, one column per expression
    /// column.
    pub fn predictor(&self) -> ArrayView2<f64> {
        self.predictor.view()
    }

    pub fn group_index(&self) -> &[usize] {
        &self.group_index
    }

    /// Block of the group design. Column `e * n_groups + g` holds
    /// expression column `e` for the rows of group `g`.
    pub fn design_matrix(&self) -> Array2<f64> {
        let n_groups = self.groups.len();
        let (n, n_expr) = self.predictor.dim();
        let mut z = Array2::zeros((n, n_expr * n_groups));
        for (i, &g) in self.group_index.iter().enumerate() {
            for e in 0..n_expr {
                z[(i, e * n_groups + g)] = self.predictor[(i, e)];
            }
        }
        z
    }

    fn evaluate(&self, data: &DataFrame) -> Result<Self> {
        let predictor = self.expr.evaluate(data)?;
        let labels = group_labels(data, &self.factor_variables)?;
        let group_index = labels
            .iter()
            .map(|label| {
                self.groups.iter().position(|g| g == label).ok_or_else(|| {
                    ModelError::from(FormulaError::UnknownLevel {
                        variable: self.factor.clone(),
                        level: label.clone(),
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            predictor,
            group_index,
            ..self.clone()
        })
    }
}

fn group_labels(data: &DataFrame, variables: &[String]) -> Result<Vec<String>> {
    let columns = variables
        .iter()
        .map(|v| data.column(v))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((0..data.nrows())
        .map(|i| columns.iter().map(|c| c.level(i)).join(":"))
        .collect())
}

/// The group specific (varying) part of a design.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupDesign {
    terms: Vec<GroupTermDesign>,
    design_matrix: Array2<f64>,
    slices: Vec<Range<usize>>,
}

impl GroupDesign {
    fn new(groups: &[GroupSpec], data: &DataFrame) -> Result<Self> {
        let mut terms: Vec<GroupTermDesign> = Vec::new();
        for group in groups {
            let factor = group.factor_name();
            let labels = group_labels(data, &group.factors)?;
            let levels: Vec<String> = labels.iter().cloned().sorted().dedup().collect();
            let group_index: Vec<usize> = labels
                .iter()
                .map(|l| levels.binary_search(l).unwrap_or_default())
                .collect();
            for expr in encode_terms(group.intercept, &group.terms, data)? {
                let expr_name = if expr.kind == TermKind::Intercept {
                    "1".to_string()
                } else {
                    expr.name.clone()
                };
                let name = format!("{expr_name}|{factor}");
                if terms.iter().any(|t| t.name == name) {
                    continue;
                }
                terms.push(GroupTermDesign {
                    name,
                    predictor: expr.evaluate(data)?,
                    expr,
                    factor: factor.clone(),
                    factor_variables: group.factors.clone(),
                    groups: levels.clone(),
                    group_index: group_index.clone(),
                });
            }
        }
        Self::from_terms(terms, data.nrows())
    }

    fn from_terms(terms: Vec<GroupTermDesign>, nrows: usize) -> Result<Self> {
        let blocks: Vec<Array2<f64>> = terms.iter().map(GroupTermDesign::design_matrix).collect();
        let mut slices = Vec::with_capacity(blocks.len());
        let mut start = 0;
        for block in &blocks {
            slices.push(start..start + block.ncols());
            start += block.ncols();
        }
        let design_matrix = if blocks.is_empty() {
            Array2::zeros((nrows, 0))
        } else {
            let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
            concatenate(Axis(1), &views).map_err(|e| ModelError::Dimension {
                name: "group design".to_string(),
                reason: e.to_string(),
            })?
        };
        Ok(Self {
            terms,
            design_matrix,
            slices,
        })
    }

    pub fn terms(&self) -> &[GroupTermDesign] {
        &self.terms
    }

    pub fn term(&self, name: &str) -> Option<&GroupTermDesign> {
        self.terms.iter().find(|t| t.name == name)
    }

    pub fn design_matrix(&self) -> ArrayView2<f64> {
        self.design_matrix.view()
    }

    pub fn slice(&self, name: &str) -> Option<Range<usize>> {
        let idx = self.terms.iter().position(|t| t.name == name)?;
        Some(self.slices[idx].clone())
    }

    /// Evaluates on new rows. Group levels not seen when the design was
    /// built are an error.
    pub fn evaluate_new_data(&self, data: &DataFrame) -> Result<Self> {
        let terms = self
            .terms
            .iter()
            .map(|t| t.evaluate(data))
            .collect::<Result<Vec<_>>>()?;
        Self::from_terms(terms, data.nrows())
    }
}

/// How the response enters the likelihood.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Numeric,
    /// Values are positions in `levels`, the first level is the reference.
    Categoric { levels: Vec<String> },
    /// `y[level]`, values are 1 where the response equals `level`.
    Indicator { level: String },
    /// Successes out of `trials`.
    Binomial { trials: Vec<f64> },
    /// One count per column, levels are the column names.
    Multinomial { levels: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseDesign {
    name: String,
    kind: ResponseKind,
    data: Array2<f64>,
}

impl ResponseDesign {
    fn new(spec: &ResponseSpec, data: &DataFrame) -> Result<Self> {
        let (kind, values) = match spec {
            ResponseSpec::Variable(v) => match data.column(v)? {
                Column::Numeric(values) => (ResponseKind::Numeric, column_matrix(values)),
                Column::Categorical(values) => {
                    let levels: Vec<String> = values.iter().cloned().sorted().dedup().collect();
                    let idx: Vec<f64> = values
                        .iter()
                        .map(|l| levels.binary_search(l).unwrap_or_default() as f64)
                        .collect();
                    (ResponseKind::Categoric { levels }, column_matrix(&idx))
                }
            },
            ResponseSpec::Level { variable, level } => {
                let column = data.column(variable)?;
                let values: Vec<f64> = (0..column.len())
                    .map(|i| if column.level(i) == *level { 1.0 } else { 0.0 })
                    .collect();
                (
                    ResponseKind::Indicator {
                        level: level.clone(),
                    },
                    column_matrix(&values),
                )
            }
            ResponseSpec::Binomial { successes, trials } => {
                let values = numeric_response(data, successes)?;
                let trials = match trials {
                    Trials::Variable(n) => numeric_response(data, n)?.to_vec(),
                    Trials::Fixed(n) => vec![*n; values.len()],
                };
                (ResponseKind::Binomial { trials }, column_matrix(values))
            }
            ResponseSpec::Multinomial(vars) => {
                let columns = vars
                    .iter()
                    .map(|v| numeric_response(data, v))
                    .collect::<Result<Vec<_>>>()?;
                let n = data.nrows();
                let counts = Array2::from_shape_fn((n, columns.len()), |(i, j)| columns[j][i]);
                (
                    ResponseKind::Multinomial {
                        levels: vars.clone(),
                    },
                    counts,
                )
            }
        };
        Ok(Self {
            name: spec.name(),
            kind,
            data: values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ResponseKind {
        &self.kind
    }

    /// (observations, 1), or (observations, levels) for multinomial counts.
    pub fn data(&self) -> ArrayView2<f64> {
        self.data.view()
    }
}

fn numeric_response<'a>(data: &'a DataFrame, name: &str) -> Result<&'a [f64]> {
    match data.column(name)? {
        Column::Numeric(values) => Ok(values),
        Column::Categorical(_) => Err(FormulaError::NonNumericResponse(name.to_string()).into()),
    }
}

fn column_matrix(values: &[f64]) -> Array2<f64> {
    Array1::from(values.to_vec()).insert_axis(Axis(1))
}

/// The design of one formula: common, group specific and response parts.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignMatrices {
    pub common: Option<CommonDesign>,
    pub group: Option<GroupDesign>,
    pub response: Option<ResponseDesign>,
}

impl DesignMatrices {
    pub fn new(parsed: &ParsedFormula, data: &DataFrame) -> Result<Self> {
        let response = parsed
            .response
            .as_ref()
            .map(|spec| ResponseDesign::new(spec, data))
            .transpose()?;
        let common = if parsed.intercept || !parsed.terms.is_empty() {
            let common = CommonDesign::new(parsed.intercept, &parsed.terms, data)?;
            if common.nrows() > 0 {
                common.check_full_rank()?;
            }
            Some(common)
        } else {
            None
        };
        let group = if parsed.groups.is_empty() {
            None
        } else {
            Some(GroupDesign::new(&parsed.groups, data)?)
        };
        Ok(Self {
            common,
            group,
            response,
        })
    }
}
