use std::fmt;
use std::str::FromStr;

use statrs::function::erf::{erf, erf_inv};

use crate::error::ModelError;

/// Link names accepted when a family does not restrict its links.
pub const SUPPORTED_LINKS: &[&str] = &[
    "cloglog",
    "identity",
    "inverse_squared",
    "inverse",
    "log",
    "logit",
    "probit",
    "softmax",
    "tan_2",
];

/// A link function and its inverse.
#[derive(Clone, Copy)]
pub struct CustomLink {
    pub name: &'static str,
    pub link: fn(f64) -> f64,
    pub linkinv: fn(f64) -> f64,
}

impl fmt::Debug for CustomLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomLink").field("name", &self.name).finish()
    }
}

impl PartialEq for CustomLink {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Link {
    Identity,
    Log,
    Logit,
    Probit,
    Cloglog,
    Inverse,
    InverseSquared,
    Softmax,
    Tan2,
    Custom(CustomLink),
}

impl Link {
    pub fn custom(name: &'static str, link: fn(f64) -> f64, linkinv: fn(f64) -> f64) -> Self {
        Link::Custom(CustomLink {
            name,
            link,
            linkinv,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Link::Identity => "identity",
            Link::Log => "log",
            Link::Logit => "logit",
            Link::Probit => "probit",
            Link::Cloglog => "cloglog",
            Link::Inverse => "inverse",
            Link::InverseSquared => "inverse_squared",
            Link::Softmax => "softmax",
            Link::Tan2 => "tan_2",
            Link::Custom(c) => c.name,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Link::Custom(_))
    }

    /// Maps a parameter to the linear predictor scale. For `softmax` this
    /// is the log odds against the reference level.
    pub fn link(&self, x: f64) -> f64 {
        match self {
            Link::Identity => x,
            Link::Log => x.ln(),
            Link::Logit => (x / (1.0 - x)).ln(),
            Link::Probit => std::f64::consts::SQRT_2 * erf_inv(2.0 * x - 1.0),
            Link::Cloglog => (-(1.0 - x).ln()).ln(),
            Link::Inverse => 1.0 / x,
            Link::InverseSquared => 1.0 / (x * x),
            Link::Softmax => x.ln(),
            Link::Tan2 => (x / 2.0).tan(),
            Link::Custom(c) => (c.link)(x),
        }
    }

    /// Maps a linear predictor to the parameter scale. `softmax` needs a
    /// full vector of levels, see [`Link::linkinv_slice`].
    pub fn linkinv(&self, x: f64) -> f64 {
        match self {
            Link::Identity => x,
            Link::Log => x.exp(),
            Link::Logit => expit(x),
            Link::Probit => 0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2)),
            Link::Cloglog => 1.0 - (-x.exp()).exp(),
            Link::Inverse => 1.0 / x,
            Link::InverseSquared => 1.0 / x.sqrt(),
            Link::Softmax => x.exp(),
            Link::Tan2 => 2.0 * x.atan(),
            Link::Custom(c) => (c.linkinv)(x),
        }
    }

    /// Inverse link over the levels of one observation.
    pub fn linkinv_slice(&self, values: &mut [f64]) {
        match self {
            Link::Softmax => softmax(values),
            other => values.iter_mut().for_each(|x| *x = other.linkinv(*x)),
        }
    }
}

pub(crate) fn expit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub(crate) fn softmax(values: &mut [f64]) {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut total = 0.0;
    for x in values.iter_mut() {
        *x = (*x - max).exp();
        total += *x;
    }
    values.iter_mut().for_each(|x| *x /= total);
}

impl FromStr for Link {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let link = match s {
            "identity" => Link::Identity,
            "log" => Link::Log,
            "logit" => Link::Logit,
            "probit" => Link::Probit,
            "cloglog" => Link::Cloglog,
            "inverse" => Link::Inverse,
            "inverse_squared" => Link::InverseSquared,
            "softmax" => Link::Softmax,
            "tan_2" => Link::Tan2,
            other => return Err(ModelError::UnknownLink(other.to_string())),
        };
        Ok(link)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn every_supported_name_parses() {
        for name in SUPPORTED_LINKS {
            let link: Link = name.parse().unwrap();
            assert_eq!(link.name(), *name);
        }
        assert!("logarithm".parse::<Link>().is_err());
    }

    #[test]
    fn softmax_normalizes() {
        let mut v = [0.0, 1.0, 2.0];
        Link::Softmax.linkinv_slice(&mut v);
        assert_relative_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        assert!(v[0] < v[1] && v[1] < v[2]);
    }

    #[test]
    fn custom_links_are_called() {
        let link = Link::custom("double", |x| x * 2.0, |x| x / 2.0);
        assert_eq!(link.name(), "double");
        assert_eq!(link.linkinv(4.0), 2.0);
        assert_eq!(link.link(2.0), 4.0);
    }

    proptest! {
        #[test]
        fn linkinv_inverts_link(p in 0.01f64..0.99) {
            for link in [Link::Logit, Link::Probit, Link::Cloglog, Link::Log, Link::Identity,
                         Link::Inverse, Link::InverseSquared, Link::Tan2] {
                let back = link.linkinv(link.link(p));
                prop_assert!((back - p).abs() < 1e-8, "{} gave {}", link, back);
            }
        }
    }
}
