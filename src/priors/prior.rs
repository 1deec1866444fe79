use std::fmt;

use itertools::Itertools;

/// A value passed to a distribution parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorArg {
    Scalar(f64),
    Vector(Vec<f64>),
    /// A hyperprior.
    Prior(Box<Prior>),
}

impl PriorArg {
    /// Value for column `idx`. Scalars broadcast over every column.
    pub fn value_at(&self, idx: usize) -> Option<f64> {
        match self {
            PriorArg::Scalar(x) => Some(*x),
            PriorArg::Vector(v) => v.get(idx).copied(),
            PriorArg::Prior(_) => None,
        }
    }

    pub fn as_prior(&self) -> Option<&Prior> {
        match self {
            PriorArg::Prior(p) => Some(p),
            _ => None,
        }
    }

    fn squeeze(self) -> Self {
        match self {
            PriorArg::Vector(v) if v.len() == 1 => PriorArg::Scalar(v[0]),
            other => other,
        }
    }
}

impl From<f64> for PriorArg {
    fn from(value: f64) -> Self {
        PriorArg::Scalar(value)
    }
}

impl From<Vec<f64>> for PriorArg {
    fn from(value: Vec<f64>) -> Self {
        PriorArg::Vector(value)
    }
}

impl From<Prior> for PriorArg {
    fn from(value: Prior) -> Self {
        PriorArg::Prior(Box::new(value))
    }
}

/// A named distribution and its arguments.
///
/// Arguments keep the order in which they were first set. Equality is
/// structural and ignores that order.
#[derive(Debug, Clone)]
pub struct Prior {
    name: String,
    args: Vec<(String, PriorArg)>,
    auto_scale: bool,
}

impl Prior {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            auto_scale: true,
        }
    }

    /// Builder form of [`Prior::update`].
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<PriorArg>) -> Self {
        self.update(key, value);
        self
    }

    #[must_use]
    pub fn without_auto_scale(mut self) -> Self {
        self.auto_scale = false;
        self
    }

    /// Sets `key`, overwriting a previous value. One element vectors are
    /// stored as scalars.
    pub fn update(&mut self, key: &str, value: impl Into<PriorArg>) {
        let value = value.into().squeeze();
        match self.args.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.args.push((key.to_string(), value)),
        }
    }

    pub fn update_many<K: AsRef<str>>(&mut self, values: impl IntoIterator<Item = (K, PriorArg)>) {
        for (key, value) in values {
            self.update(key.as_ref(), value);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[(String, PriorArg)] {
        &self.args
    }

    pub fn arg(&self, key: &str) -> Option<&PriorArg> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn arg_mut(&mut self, key: &str) -> Option<&mut PriorArg> {
        self.args.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn scalar(&self, key: &str) -> Option<f64> {
        match self.arg(key)? {
            PriorArg::Scalar(x) => Some(*x),
            _ => None,
        }
    }

    pub fn hyperprior(&self, key: &str) -> Option<&Prior> {
        self.arg(key).and_then(PriorArg::as_prior)
    }

    pub fn has_hyperprior(&self) -> bool {
        self.args
            .iter()
            .any(|(_, v)| matches!(v, PriorArg::Prior(_)))
    }

    pub fn auto_scale(&self) -> bool {
        self.auto_scale
    }

    pub fn set_auto_scale(&mut self, value: bool) {
        self.auto_scale = value;
    }
}

impl PartialEq for Prior {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.auto_scale == other.auto_scale
            && self.args.len() == other.args.len()
            && self
                .args
                .iter()
                .all(|(k, v)| other.arg(k).is_some_and(|o| o == v))
    }
}

fn round4(x: f64) -> f64 {
    let r = (x * 1e4).round() / 1e4;
    if r == 0.0 {
        0.0
    } else {
        r
    }
}

impl fmt::Display for PriorArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorArg::Scalar(x) => write!(f, "{}", round4(*x)),
            PriorArg::Vector(v) => write!(f, "[{}]", v.iter().map(|x| round4(*x)).join(", ")),
            PriorArg::Prior(p) => write!(f, "{}", p),
        }
    }
}

impl fmt::Display for Prior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .args
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .join(", ");
        write!(f, "{}({})", self.name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn display_nests_hyperpriors() {
        let prior = Prior::new("Normal")
            .with("mu", 0.0)
            .with("sigma", Prior::new("HalfNormal").with("sigma", 1.0));
        assert_eq!(prior.to_string(), "Normal(mu: 0, sigma: HalfNormal(sigma: 1))");
    }

    #[test]
    fn display_rounds_values() {
        let prior = Prior::new("Normal")
            .with("mu", vec![0.123456, 2.0])
            .with("sigma", 2.5);
        assert_eq!(prior.to_string(), "Normal(mu: [0.1235, 2], sigma: 2.5)");
    }

    #[test]
    fn update_squeezes_single_values() {
        let mut prior = Prior::new("Normal").with("mu", 0.0);
        prior.update("sigma", vec![3.0]);
        assert_eq!(prior.arg("sigma"), Some(&PriorArg::Scalar(3.0)));
        prior.update("mu", vec![1.0, 2.0]);
        assert_eq!(prior.arg("mu"), Some(&PriorArg::Vector(vec![1.0, 2.0])));
        let keys: Vec<&str> = prior.args().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["mu", "sigma"]);
    }

    #[test]
    fn equality_is_structural() {
        let a = Prior::new("Normal").with("mu", 0.0).with("sigma", 1.0);
        let b = Prior::new("Normal").with("sigma", 1.0).with("mu", 0.0);
        assert_eq!(a, b);
        assert_ne!(a, Prior::new("Normal").with("mu", 0.0).with("sigma", 2.0));
        assert_ne!(a, Prior::new("Cauchy").with("mu", 0.0).with("sigma", 1.0));
        let nested =
            |s: f64| Prior::new("Normal").with("sigma", Prior::new("HalfNormal").with("sigma", s));
        assert_eq!(nested(1.0), nested(1.0));
        assert_ne!(nested(1.0), nested(2.0));
    }

    proptest! {
        #[test]
        fn update_merges_keys(
            old in proptest::collection::btree_map("[a-e]", -10f64..10., 0..5),
            new in proptest::collection::btree_map("[c-h]", -10f64..10., 0..5),
        ) {
            let mut prior = Prior::new("Custom");
            for (k, v) in &old {
                prior.update(k, *v);
            }
            prop_assert_eq!(&prior, &prior.clone());
            for (k, v) in &new {
                prior.update(k, *v);
            }
            let mut expected = old.clone();
            expected.extend(new.clone());
            prop_assert_eq!(prior.args().len(), expected.len());
            for (k, v) in &expected {
                prop_assert_eq!(prior.scalar(k), Some(*v));
            }
        }
    }
}
