use itertools::Itertools;

use crate::data::{linspace, max, mean, min, quantile, Column, DataFrame, Value};
use crate::error::{ModelError, Result};
use crate::model::Model;

/// Covariates to condition on.
///
/// `Names` lists one to three covariates: the main one, whose values span a
/// grid, and optional group and panel covariates, whose values are their
/// levels or quantiles. `Values` gives the values of each covariate
/// directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional {
    Names(Vec<String>),
    Values(Vec<(String, Vec<Value>)>),
}

impl Conditional {
    pub fn names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Conditional::Names(names.into_iter().map(Into::into).collect())
    }

    fn keys(&self) -> Vec<&str> {
        match self {
            Conditional::Names(names) => names.iter().map(String::as_str).collect(),
            Conditional::Values(values) => values.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }
}

impl From<&str> for Conditional {
    fn from(value: &str) -> Self {
        Conditional::Names(vec![value.to_string()])
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Conditional {
    fn from(value: [S; N]) -> Self {
        Conditional::names(value)
    }
}

/// The variable of a comparison or a slope, by name or with the values to
/// evaluate it at.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableSpec {
    Name(String),
    Values(Vec<(String, Vec<Value>)>),
}

impl VariableSpec {
    pub fn values(
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        VariableSpec::Values(vec![(name.into(), values.into_iter().map(Into::into).collect())])
    }

    pub(crate) fn name(&self) -> Option<&str> {
        match self {
            VariableSpec::Name(name) => Some(name),
            VariableSpec::Values(values) => values.first().map(|(name, _)| name.as_str()),
        }
    }
}

impl From<&str> for VariableSpec {
    fn from(value: &str) -> Self {
        VariableSpec::Name(value.to_string())
    }
}

/// Marginalization of comparisons and slopes.
#[derive(Debug, Clone, PartialEq)]
pub enum AverageBy {
    /// One estimate over every row.
    All,
    /// One estimate per combination of the values of these covariates.
    Variables(Vec<String>),
}

impl From<&str> for AverageBy {
    fn from(value: &str) -> Self {
        AverageBy::Variables(vec![value.to_string()])
    }
}

/// Conditioning covariates split by role.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Covariates {
    pub(crate) main: String,
    pub(crate) group: Option<String>,
    pub(crate) panel: Option<String>,
}

impl Covariates {
    pub(crate) fn others(&self) -> Vec<&str> {
        self.group.iter().chain(self.panel.iter()).map(String::as_str).collect()
    }
}

/// Checks that every conditioning name is a covariate and assigns roles by
/// position.
pub(crate) fn covariates(model: &Model, conditional: &Conditional) -> Result<Covariates> {
    let keys: Vec<&str> = conditional.keys().into_iter().unique().collect();
    if keys.is_empty() || keys.len() > 3 {
        return Err(ModelError::CovariateCount(keys.len()));
    }
    check_covariates(model, &keys)?;
    Ok(Covariates {
        main: keys[0].to_string(),
        group: keys.get(1).map(|s| s.to_string()),
        panel: keys.get(2).map(|s| s.to_string()),
    })
}

pub(crate) fn check_covariates(model: &Model, names: &[&str]) -> Result<()> {
    let known = model.covariates();
    match names.iter().find(|n| !known.iter().any(|k| k == *n)) {
        Some(name) => Err(ModelError::NotACovariate(name.to_string())),
        None => Ok(()),
    }
}

/// Evenly spaced values over the observed range of a numeric covariate, the
/// levels of a categorical one.
pub(crate) fn main_values(column: &Column, grid_n: usize) -> Vec<Value> {
    match column {
        Column::Numeric(x) => linspace(min(x), max(x), grid_n)
            .into_iter()
            .map(Value::Number)
            .collect(),
        Column::Categorical(_) => column.unique(),
    }
}

/// Quantiles of a numeric covariate, the levels of a categorical one.
pub(crate) fn group_values(column: &Column, groups_n: usize) -> Vec<Value> {
    match column {
        Column::Numeric(x) => linspace(0.0, 1.0, groups_n)
            .into_iter()
            .map(|q| Value::Number(quantile(x, q)))
            .collect(),
        Column::Categorical(_) => column.unique(),
    }
}

/// The mean of a numeric covariate, the most frequent level of a
/// categorical one.
pub(crate) fn default_value(column: &Column) -> Option<Value> {
    match column {
        Column::Numeric(x) => Some(Value::Number(mean(x))),
        Column::Categorical(_) => column.mode(),
    }
}

/// Fills in the covariates of the model missing from `values` with their
/// default.
pub(crate) fn set_default_values(
    model: &Model,
    values: &mut Vec<(String, Vec<Value>)>,
) -> Result<()> {
    let mut computed = Vec::new();
    for name in model.covariates() {
        if values.iter().any(|(n, _)| *n == name) {
            continue;
        }
        let column = model.data().column(&name)?;
        let value = default_value(column).ok_or_else(|| ModelError::NotACovariate(name.clone()))?;
        values.push((name.clone(), vec![value]));
        computed.push(name);
    }
    if !computed.is_empty() {
        log::info!("Default computed for unspecified variable: {}", computed.join(", "));
    }
    Ok(())
}

/// A one unit difference centered on the mean for numeric covariates, all
/// the levels for categorical ones.
pub(crate) fn default_contrast_values(column: &Column) -> Vec<Value> {
    match column {
        Column::Numeric(x) => {
            let m = mean(x);
            vec![Value::Number(m - 0.5), Value::Number(m + 0.5)]
        }
        Column::Categorical(_) => column.unique(),
    }
}

/// Rows of the cross join of `columns`, the last column varying fastest.
pub(crate) fn cross_join(columns: &[(String, Vec<Value>)]) -> Result<DataFrame> {
    let rows: Vec<Vec<Value>> = columns
        .iter()
        .map(|(_, values)| values.iter().cloned())
        .multi_cartesian_product()
        .collect();
    let mut frame = DataFrame::new();
    for (idx, (name, _)) in columns.iter().enumerate() {
        let cells: Vec<Value> = rows.iter().map(|row| row[idx].clone()).collect();
        frame.insert(name.clone(), Column::from_values(name, &cells)?)?;
    }
    Ok(frame)
}

/// Casts user supplied cells to the type of the observed column, so that
/// `1.0` given for a categorical covariate reads as the level `"1"`.
pub(crate) fn enforce_type(observed: &Column, values: &[Value]) -> Vec<Value> {
    values
        .iter()
        .map(|v| match (observed, v) {
            (Column::Categorical(_), Value::Number(x)) => {
                Value::Level(crate::data::format_number(*x))
            }
            _ => v.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn main_and_group_values() {
        let x = Column::Numeric(vec![0.0, 4.0, 2.0, 1.0, 3.0]);
        assert_eq!(
            main_values(&x, 3),
            vec![Value::Number(0.0), Value::Number(2.0), Value::Number(4.0)]
        );
        assert_eq!(
            group_values(&x, 3),
            vec![Value::Number(0.0), Value::Number(2.0), Value::Number(4.0)]
        );
        let g = Column::Categorical(vec!["b".into(), "a".into(), "b".into()]);
        assert_eq!(main_values(&g, 50), vec![Value::from("a"), Value::from("b")]);
        assert_eq!(default_value(&g), Some(Value::from("b")));
    }

    #[test]
    fn numeric_contrasts_are_one_unit_apart() {
        let x = Column::Numeric(vec![1.0, 2.0, 3.0]);
        assert_eq!(default_contrast_values(&x), vec![Value::Number(1.5), Value::Number(2.5)]);
    }

    #[test]
    fn cross_join_varies_the_last_column_fastest() {
        let frame = cross_join(&[
            ("a".to_string(), vec![Value::Number(1.0), Value::Number(2.0)]),
            ("b".to_string(), vec![Value::from("x"), Value::from("y"), Value::from("z")]),
        ])
        .unwrap();
        assert_eq!(frame.nrows(), 6);
        assert_eq!(frame.numeric("a").unwrap(), &[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(frame.column("b").unwrap().level(1), "y");
    }
}
