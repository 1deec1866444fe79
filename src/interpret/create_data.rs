//! Data the model is evaluated on when interpreting it.

use itertools::Itertools;

use crate::data::{Column, DataFrame, Value};
use crate::error::{DataError, ModelError, Result};
use crate::interpret::utils::{
    covariates, cross_join, enforce_type, group_values, main_values, set_default_values,
    Conditional,
};
use crate::model::Model;

/// The variable of a comparison or a slope and the sides being compared.
///
/// On a grid, rows belong to a side when the variable takes one of the
/// side's values. At the unit level every side is a full copy of the
/// observed data: a single value replaces the variable everywhere, a side
/// with one value per observation replaces it row by row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Contrast {
    pub(crate) name: String,
    pub(crate) sides: Vec<Vec<Value>>,
    pub(crate) pairs: Vec<(usize, usize)>,
}

impl Contrast {
    /// Every pair of sides, in order.
    pub(crate) fn pairwise(name: String, sides: Vec<Vec<Value>>) -> Self {
        let pairs = (0..sides.len()).tuple_combinations().collect();
        Self { name, sides, pairs }
    }

    fn values(&self) -> Vec<Value> {
        self.sides.iter().flatten().cloned().collect()
    }
}

/// Grid values of the conditioning covariates, with defaults for the rest
/// of the model covariates appended.
fn conditional_values(
    model: &Model,
    conditional: &Conditional,
    grid_n: usize,
    groups_n: usize,
) -> Result<Vec<(String, Vec<Value>)>> {
    let covariates = covariates(model, conditional)?;
    let data = model.data();
    let values = match conditional {
        Conditional::Names(_) => {
            let mut values = vec![(
                covariates.main.clone(),
                main_values(data.column(&covariates.main)?, grid_n),
            )];
            log::info!("Default computed for main variable: {}", covariates.main);
            for name in covariates.others() {
                let levels =
                    group_values(data.column(name)?, groups_n).into_iter().dedup().collect();
                values.push((name.to_string(), levels));
            }
            if !covariates.others().is_empty() {
                log::info!(
                    "Default computed for group/panel variable: {}",
                    covariates.others().join(", ")
                );
            }
            values
        }
        Conditional::Values(given) => given
            .iter()
            .unique_by(|(name, _)| name.clone())
            .map(|(name, values)| Ok((name.clone(), enforce_type(data.column(name)?, values))))
            .collect::<std::result::Result<Vec<_>, DataError>>()?,
    };
    Ok(values)
}

/// Data for conditional adjusted predictions.
///
/// With named covariates the main covariate varies fastest, then the group
/// and the panel covariates. User supplied values are crossed in the order
/// they were given. Other covariates are held at their default.
pub(crate) fn cap_data(
    model: &Model,
    conditional: &Conditional,
    grid_n: usize,
    groups_n: usize,
) -> Result<DataFrame> {
    let mut values = conditional_values(model, conditional, grid_n, groups_n)?;
    let order: Vec<String> = values.iter().map(|(name, _)| name.clone()).collect();
    if matches!(conditional, Conditional::Names(_)) {
        values.reverse();
    }
    set_default_values(model, &mut values)?;
    let grid = cross_join(&values)?;
    let names: Vec<String> = order
        .into_iter()
        .chain(grid.names().iter().cloned())
        .unique()
        .collect();
    Ok(grid.select(&names)?)
}

/// Data for comparisons and slopes.
///
/// Without `conditional` the observed covariates are used once per side of
/// the contrast. Otherwise the conditioning values, the contrast values and
/// the defaults are crossed, the last varying fastest.
pub(crate) fn differences_data(
    model: &Model,
    conditional: Option<&Conditional>,
    contrast: &Contrast,
    grid_n: usize,
    groups_n: usize,
) -> Result<DataFrame> {
    let Some(conditional) = conditional else {
        return unit_level_data(model, contrast);
    };
    let mut values = conditional_values(model, conditional, grid_n, groups_n)?;
    match values.iter_mut().find(|(name, _)| *name == contrast.name) {
        Some((_, slot)) => *slot = contrast.values(),
        None => values.push((contrast.name.clone(), contrast.values())),
    }
    set_default_values(model, &mut values)?;
    cross_join(&values)
}

fn unit_level_data(model: &Model, contrast: &Contrast) -> Result<DataFrame> {
    let names: Vec<String> = model
        .covariates()
        .into_iter()
        .filter(|name| *name != contrast.name)
        .collect();
    let observed = model.data().select(&names)?;
    let n = model.data().nrows();
    let frames = contrast
        .sides
        .iter()
        .map(|side| {
            let cells = match side.as_slice() {
                [value] => vec![value.clone(); n],
                _ if side.len() == n => side.clone(),
                _ => {
                    return Err(ModelError::Dimension {
                        name: contrast.name.clone(),
                        reason: format!("{} values given for {} observations", side.len(), n),
                    })
                }
            };
            let mut frame = observed.clone();
            frame.insert(contrast.name.clone(), Column::from_values(&contrast.name, &cells)?)?;
            Ok(frame)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(DataFrame::vstack(&frames)?)
}

/// Rows of `data` on each side of the contrast. Unit level data is split in
/// equal blocks, grid rows are matched by value.
pub(crate) fn side_rows(
    data: &DataFrame,
    contrast: &Contrast,
    unit_level: bool,
) -> Result<Vec<Vec<usize>>> {
    let n_sides = contrast.sides.len();
    if unit_level {
        let block = data.nrows() / n_sides.max(1);
        return Ok((0..n_sides).map(|s| (s * block..(s + 1) * block).collect()).collect());
    }
    let column = data.column(&contrast.name)?;
    Ok(contrast
        .sides
        .iter()
        .map(|side| {
            (0..data.nrows())
                .filter(|&row| side.contains(&column.value(row)))
                .collect()
        })
        .collect())
}
