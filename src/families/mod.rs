//! Likelihoods, link functions and the families that bind them together.

mod family;
mod likelihood;
mod link;
pub mod observation;

pub use family::{Family, LinkChoice, LinkSpec, SupportedLinks};
pub use likelihood::{known_distribution, DistSettings, Likelihood, DISTRIBUTIONS};
pub use link::{CustomLink, Link, SUPPORTED_LINKS};
pub(crate) use link::{expit, softmax};
