//! Named dimensions and the array operations that move posterior draws
//! between the shapes used by the sampler, the design matrices and the
//! summary tables.
//!
//! Every array of draws starts with the `chain` and `draw` dimensions. The
//! helpers here are the only place where dimension names are built.

use std::fmt;

use ndarray::{concatenate, s, Array2, Array3, Array4, ArrayD, ArrayView2, Axis, IxDyn};

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dim(String);

impl Dim {
    pub fn new(name: impl Into<String>) -> Self {
        Dim(name.into())
    }

    pub fn chain() -> Self {
        Dim::new("chain")
    }

    pub fn draw() -> Self {
        Dim::new("draw")
    }

    /// One entry per observation of `response`.
    pub fn obs(response: &str) -> Self {
        Dim(format!("{response}_obs"))
    }

    /// Modelled (non reference) levels of a multivariate response.
    pub fn response_levels(response: &str) -> Self {
        Dim(format!("{response}_dim"))
    }

    /// All levels of a multivariate response, reference included.
    pub fn mean_levels(response: &str) -> Self {
        Dim(format!("{response}_mean_dim"))
    }

    /// Columns of a term with more than one coefficient.
    pub fn term(name: &str) -> Self {
        Dim(format!("{name}_dim"))
    }

    pub fn factor(factor: &str) -> Self {
        Dim(format!("{factor}__factor_dim"))
    }

    pub fn expr(name: &str) -> Self {
        Dim(format!("{name}__expr_dim"))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A labelled n-dimensional array, the equivalent of an xarray `DataArray`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    dims: Vec<Dim>,
    coords: Vec<Option<Vec<String>>>,
    values: ArrayD<f64>,
}

fn dimension_error(name: &str, reason: impl Into<String>) -> ModelError {
    ModelError::Dimension {
        name: name.to_string(),
        reason: reason.into(),
    }
}

impl DataArray {
    pub fn new(dims: Vec<Dim>, values: ArrayD<f64>) -> Result<Self> {
        if dims.len() != values.ndim() {
            return Err(dimension_error(
                &dims.iter().map(Dim::name).collect::<Vec<_>>().join(", "),
                format!("{} dims for an array with {} axes", dims.len(), values.ndim()),
            ));
        }
        let coords = vec![None; dims.len()];
        Ok(Self {
            dims,
            coords,
            values,
        })
    }

    /// Scalar parameter draws indexed by (chain, draw).
    pub fn from_draws(values: Array2<f64>) -> Self {
        Self {
            dims: vec![Dim::chain(), Dim::draw()],
            coords: vec![None, None],
            values: values.into_dyn(),
        }
    }

    pub fn with_coords(mut self, dim: &Dim, labels: Vec<String>) -> Result<Self> {
        let axis = self.require_axis(dim)?;
        if self.values.len_of(Axis(axis)) != labels.len() {
            return Err(dimension_error(
                dim.name(),
                format!(
                    "{} labels for a dimension of length {}",
                    labels.len(),
                    self.values.len_of(Axis(axis))
                ),
            ));
        }
        self.coords[axis] = Some(labels);
        Ok(self)
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    pub fn into_values(self) -> ArrayD<f64> {
        self.values
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    pub fn axis(&self, dim: &Dim) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    fn require_axis(&self, dim: &Dim) -> Result<usize> {
        self.axis(dim)
            .ok_or_else(|| dimension_error(dim.name(), "dimension not present"))
    }

    pub fn len_of(&self, dim: &Dim) -> Option<usize> {
        self.axis(dim).map(|a| self.values.len_of(Axis(a)))
    }

    pub fn coords(&self, dim: &Dim) -> Option<&[String]> {
        self.axis(dim).and_then(|a| self.coords[a].as_deref())
    }

    pub fn n_chains(&self) -> usize {
        self.values.shape().first().copied().unwrap_or(0)
    }

    pub fn n_draws(&self) -> usize {
        self.values.shape().get(1).copied().unwrap_or(0)
    }

    pub fn rename_dim(&mut self, from: &Dim, to: Dim) {
        if let Some(axis) = self.axis(from) {
            self.dims[axis] = to;
        }
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            dims: self.dims.clone(),
            coords: self.coords.clone(),
            values: self.values.mapv(f),
        }
    }

    /// Adds a zero slice in front of `dim`. The reference level of a
    /// multivariate response is not modelled and enters as a zero.
    pub fn pad_reference(&self, dim: &Dim) -> Result<Self> {
        let axis = self.require_axis(dim)?;
        let mut shape = self.values.shape().to_vec();
        shape[axis] = 1;
        let zeros = ArrayD::<f64>::zeros(IxDyn(&shape));
        let values = concatenate(Axis(axis), &[zeros.view(), self.values.view()])
            .map_err(|e| dimension_error(dim.name(), e.to_string()))?;
        let mut coords = self.coords.clone();
        coords[axis] = None;
        Ok(Self {
            dims: self.dims.clone(),
            coords,
            values,
        })
    }

    /// Keeps the given positions along `dim`.
    pub fn select(&self, dim: &Dim, indices: &[usize]) -> Result<Self> {
        let axis = self.require_axis(dim)?;
        let len = self.values.len_of(Axis(axis));
        if let Some(bad) = indices.iter().find(|&&i| i >= len) {
            return Err(dimension_error(
                dim.name(),
                format!("index {bad} out of bounds for length {len}"),
            ));
        }
        let values = self.values.select(Axis(axis), indices);
        let mut coords = self.coords.clone();
        if let Some(labels) = &self.coords[axis] {
            coords[axis] = Some(indices.iter().map(|&i| labels[i].clone()).collect());
        }
        Ok(Self {
            dims: self.dims.clone(),
            coords,
            values,
        })
    }

    /// Draws flattened to (chain * draw, cells); cells follow the remaining
    /// dimensions in row-major order.
    pub fn samples(&self) -> Result<Array2<f64>> {
        if self.dims.len() < 2 || self.dims[0] != Dim::chain() || self.dims[1] != Dim::draw() {
            return Err(dimension_error(
                "samples",
                "draws must start with the chain and draw dimensions",
            ));
        }
        let n = self.n_chains() * self.n_draws();
        let cells = self.values.len() / n.max(1);
        let flat: Vec<f64> = self.values.iter().copied().collect();
        Array2::from_shape_vec((n, cells), flat)
            .map_err(|e| dimension_error("samples", e.to_string()))
    }

    /// Reorders the draws into (chain, draw, variables, levels). `levels`
    /// is moved last when present, every other dimension is flattened into
    /// the variables axis.
    pub fn to_blocks(&self, levels: Option<&Dim>) -> Result<Array4<f64>> {
        if self.dims.len() < 2 {
            return Err(dimension_error("blocks", "missing chain and draw dimensions"));
        }
        let mut order: Vec<usize> = (0..self.dims.len()).collect();
        let mut n_levels = 1;
        if let Some(dim) = levels {
            let axis = self.require_axis(dim)?;
            n_levels = self.values.len_of(Axis(axis));
            order.retain(|&a| a != axis);
            order.push(axis);
        }
        let view = self.values.view().permuted_axes(IxDyn(&order));
        let (chains, draws) = (self.n_chains(), self.n_draws());
        let n_vars = self.values.len() / (chains * draws * n_levels).max(1);
        let flat: Vec<f64> = view.iter().copied().collect();
        Array4::from_shape_vec((chains, draws, n_vars, n_levels), flat)
            .map_err(|e| dimension_error("blocks", e.to_string()))
    }
}

/// Concatenates coefficient blocks along the variables axis, in order. This
/// is the stacked `__variables__` view that lines up with the columns of a
/// design matrix.
pub fn stack_variables(arrays: &[&DataArray], levels: Option<&Dim>) -> Result<Array4<f64>> {
    let blocks = arrays
        .iter()
        .map(|a| a.to_blocks(levels))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
    concatenate(Axis(2), &views).map_err(|e| dimension_error("__variables__", e.to_string()))
}

/// Contracts a (obs, variables) design matrix against (chain, draw,
/// variables, levels) coefficients, giving (chain, draw, obs, levels).
pub fn dot_design(design: ArrayView2<f64>, coefs: &Array4<f64>) -> Result<Array4<f64>> {
    let (chains, draws, n_vars, n_levels) = coefs.dim();
    if design.ncols() != n_vars {
        return Err(dimension_error(
            "__variables__",
            format!(
                "design has {} columns but {} coefficients were stacked",
                design.ncols(),
                n_vars
            ),
        ));
    }
    let mut out = Array4::<f64>::zeros((chains, draws, design.nrows(), n_levels));
    for c in 0..chains {
        for d in 0..draws {
            let b = coefs.slice(s![c, d, .., ..]);
            out.slice_mut(s![c, d, .., ..]).assign(&design.dot(&b));
        }
    }
    Ok(out)
}

/// Drops the trailing levels axis of a univariate linear predictor.
pub fn squeeze_levels(values: Array4<f64>) -> Result<Array3<f64>> {
    let (chains, draws, n, levels) = values.dim();
    if levels != 1 {
        return Err(dimension_error("levels", format!("expected 1 level, found {levels}")));
    }
    values
        .into_shape_with_order((chains, draws, n))
        .map_err(|e| dimension_error("levels", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};
    use pretty_assertions::assert_eq;

    #[test]
    fn dimension_names() {
        assert_eq!(Dim::obs("y").name(), "y_obs");
        assert_eq!(Dim::response_levels("y").name(), "y_dim");
        assert_eq!(Dim::mean_levels("y").name(), "y_mean_dim");
        assert_eq!(Dim::term("age:party_id").name(), "age:party_id_dim");
        assert_eq!(Dim::factor("g").name(), "g__factor_dim");
        assert_eq!(Dim::expr("x|g").name(), "x|g__expr_dim");
    }

    #[test]
    fn pad_reference_prepends_zeros() {
        let values = Array::from_shape_vec((1, 1, 2, 2), vec![1., 2., 3., 4.])
            .unwrap()
            .into_dyn();
        let dims = vec![Dim::chain(), Dim::draw(), Dim::obs("y"), Dim::response_levels("y")];
        let arr = DataArray::new(dims, values).unwrap();
        let padded = arr.pad_reference(&Dim::response_levels("y")).unwrap();
        assert_eq!(padded.shape(), &[1, 1, 2, 3]);
        let flat: Vec<f64> = padded.values().iter().copied().collect();
        assert_eq!(flat, vec![0., 1., 2., 0., 3., 4.]);
    }

    #[test]
    fn blocks_move_levels_last() {
        // (chain, draw, levels, term) with levels first among the trailing dims
        let values = Array::from_shape_vec((1, 1, 2, 3), (0..6).map(f64::from).collect())
            .unwrap()
            .into_dyn();
        let levels = Dim::response_levels("y");
        let dims = vec![Dim::chain(), Dim::draw(), levels.clone(), Dim::term("a")];
        let arr = DataArray::new(dims, values).unwrap();
        let blocks = arr.to_blocks(Some(&levels)).unwrap();
        assert_eq!(blocks.dim(), (1, 1, 3, 2));
        assert_eq!(blocks[[0, 0, 2, 1]], 5.);
        assert_eq!(blocks[[0, 0, 2, 0]], 2.);
    }

    #[test]
    fn dot_design_broadcasts_over_draws() {
        let intercept = DataArray::from_draws(array![[1.0, 2.0]]);
        let slope = DataArray::from_draws(array![[0.5, -1.0]]);
        let coefs = stack_variables(&[&intercept, &slope], None).unwrap();
        let x = array![[1.0, 0.0], [1.0, 2.0]];
        let lp = squeeze_levels(dot_design(x.view(), &coefs).unwrap()).unwrap();
        assert_eq!(lp, array![[[1.0, 2.0], [2.0, 0.0]]]);
    }

    #[test]
    fn mismatched_design_is_an_error() {
        let intercept = DataArray::from_draws(array![[1.0]]);
        let coefs = stack_variables(&[&intercept], None).unwrap();
        let x = array![[1.0, 0.0]];
        assert!(dot_design(x.view(), &coefs).is_err());
    }
}
