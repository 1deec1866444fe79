//! Model formulas in R syntax and the design matrices they produce.

mod design;
mod parser;

pub use design::{
    CommonDesign, DesignMatrices, DesignTerm, GroupDesign, GroupTermDesign, ResponseDesign,
    ResponseKind, TermKind,
};
pub use parser::{
    parse, FactorSpec, GroupSpec, HsgpSpec, ParsedFormula, ResponseSpec, TermSpec, Trials,
};

use std::fmt;

use crate::error::{FormulaError, Result};

/// A main formula and optional formulas for the other parameters of the
/// likelihood, as in `Formula::new("y ~ x").with_additional(["sigma ~ x"])`.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    main: String,
    additionals: Vec<String>,
}

impl Formula {
    pub fn new(main: impl Into<String>) -> Self {
        Self {
            main: main.into(),
            additionals: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_additional<S: Into<String>>(
        mut self,
        formulas: impl IntoIterator<Item = S>,
    ) -> Self {
        self.additionals.extend(formulas.into_iter().map(Into::into));
        self
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn additionals(&self) -> &[String] {
        &self.additionals
    }

    /// Parses every formula. The main formula must have a response, each
    /// additional one names the parameter it models on its left-hand side.
    pub fn parse(&self) -> Result<(ParsedFormula, Vec<(String, ParsedFormula)>)> {
        let main = parse(&self.main)?;
        if main.response.is_none() {
            return Err(FormulaError::MissingResponse(self.main.clone()).into());
        }
        let mut additionals = Vec::with_capacity(self.additionals.len());
        for formula in &self.additionals {
            let parsed = parse(formula)?;
            let param = match &parsed.response {
                Some(ResponseSpec::Variable(name)) => name.clone(),
                _ => return Err(FormulaError::MissingResponse(formula.clone()).into()),
            };
            additionals.push((param, parsed));
        }
        Ok((main, additionals))
    }
}

impl From<&str> for Formula {
    fn from(value: &str) -> Self {
        Formula::new(value)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.main)?;
        for additional in &self.additionals {
            write!(f, "\n            {}", additional)?;
        }
        Ok(())
    }
}
