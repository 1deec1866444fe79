//! Containers for posterior and predictive draws.

use crate::dims::{DataArray, Dim};
use crate::error::{ModelError, Result};

/// Named arrays sharing dimensions, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    vars: Vec<(String, DataArray)>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `name`. Variables that use one of the new
    /// array's dimensions with a different length are dropped, so that
    /// predictions on new data replace the ones made on the training rows.
    pub fn insert(&mut self, name: impl Into<String>, array: DataArray) {
        let name = name.into();
        self.vars.retain(|(other, existing)| {
            if *other == name {
                return false;
            }
            !array.dims().iter().any(|dim| {
                matches!(
                    (existing.len_of(dim), array.len_of(dim)),
                    (Some(a), Some(b)) if a != b
                )
            })
        });
        self.vars.push((name, array));
    }

    pub fn get(&self, name: &str) -> Option<&DataArray> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn require(&self, name: &str) -> Result<&DataArray> {
        self.get(name)
            .ok_or_else(|| ModelError::MissingDraws(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> Option<DataArray> {
        let idx = self.vars.iter().position(|(n, _)| n == name)?;
        Some(self.vars.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Dimensions in order of first appearance.
    pub fn dims(&self) -> Vec<Dim> {
        let mut out: Vec<Dim> = Vec::new();
        for (_, array) in &self.vars {
            for dim in array.dims() {
                if !out.contains(dim) {
                    out.push(dim.clone());
                }
            }
        }
        out
    }

    pub fn n_chains(&self) -> usize {
        self.vars.first().map(|(_, a)| a.n_chains()).unwrap_or(0)
    }

    pub fn n_draws(&self) -> usize {
        self.vars.first().map(|(_, a)| a.n_draws()).unwrap_or(0)
    }
}

/// The groups produced by fitting and predicting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceData {
    pub posterior: Dataset,
    pub posterior_predictive: Option<Dataset>,
    pub prior: Option<Dataset>,
    pub prior_predictive: Option<Dataset>,
    pub observed_data: Option<Dataset>,
}

impl InferenceData {
    pub fn new(posterior: Dataset) -> Self {
        Self {
            posterior,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};
    use pretty_assertions::assert_eq;

    #[test]
    fn insert_drops_stale_observation_arrays() {
        let mut ds = Dataset::new();
        ds.insert("Intercept", DataArray::from_draws(array![[0.0, 1.0]]));
        let mean = DataArray::new(
            vec![Dim::chain(), Dim::draw(), Dim::obs("y")],
            Array3::<f64>::zeros((1, 2, 5)).into_dyn(),
        )
        .unwrap();
        ds.insert("y_sigma", mean.clone());
        ds.insert("y_mean", mean);
        assert_eq!(ds.dims(), vec![Dim::chain(), Dim::draw(), Dim::obs("y")]);

        let new_mean = DataArray::new(
            vec![Dim::chain(), Dim::draw(), Dim::obs("y")],
            Array3::<f64>::zeros((1, 2, 3)).into_dyn(),
        )
        .unwrap();
        ds.insert("y_mean", new_mean);
        let names: Vec<&str> = ds.names().collect();
        assert_eq!(names, vec!["Intercept", "y_mean"]);
    }

    #[test]
    fn missing_variable_is_reported() {
        let ds = Dataset::new();
        assert!(matches!(ds.require("x"), Err(ModelError::MissingDraws(_))));
    }
}
