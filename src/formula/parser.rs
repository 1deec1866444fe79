//! Recursive descent parser for the R model formula syntax.

use std::collections::BTreeSet;

use itertools::Itertools;

use crate::error::FormulaError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64, String),
    Str(String),
    Op(char),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Ident(s) | Token::Str(s) => s.clone(),
            Token::Number(_, s) => s.clone(),
            Token::Op(c) => c.to_string(),
        }
    }
}

fn tokenize(formula: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| parse_error(formula, format!("invalid number '{text}'")))?;
            tokens.push(Token::Number(value, text));
        } else if c.is_alphabetic() || c == '_' || c == '.' {
            let start = i;
            let in_name = |c: char| c.is_alphanumeric() || c == '_' || c == '.';
            while i < chars.len() && in_name(chars[i]) {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if c == '"' || c == '\'' || c == '`' {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != c {
                i += 1;
            }
            if i == chars.len() {
                return Err(parse_error(formula, "unterminated string"));
            }
            let text: String = chars[start..i].iter().collect();
            // backticks quote variable names
            if c == '`' {
                tokens.push(Token::Ident(text));
            } else {
                tokens.push(Token::Str(text));
            }
            i += 1;
        } else if "~+-*:|(),=[]".contains(c) {
            tokens.push(Token::Op(c));
            i += 1;
        } else {
            return Err(parse_error(formula, format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

fn parse_error(formula: &str, reason: impl Into<String>) -> FormulaError {
    FormulaError::Parse {
        formula: formula.to_string(),
        reason: reason.into(),
    }
}

/// Number of trials of a binomial response.
#[derive(Debug, Clone, PartialEq)]
pub enum Trials {
    Variable(String),
    Fixed(f64),
}

/// Left-hand side of a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSpec {
    Variable(String),
    /// `y[level]`, the response is an indicator of `level`.
    Level { variable: String, level: String },
    /// `p(successes, trials)`
    Binomial { successes: String, trials: Trials },
    /// `c(y1, y2, ...)`
    Multinomial(Vec<String>),
}

impl ResponseSpec {
    pub fn name(&self) -> String {
        match self {
            ResponseSpec::Variable(v) | ResponseSpec::Level { variable: v, .. } => v.clone(),
            ResponseSpec::Binomial { successes, trials } => match trials {
                Trials::Variable(n) => format!("p({successes}, {n})"),
                Trials::Fixed(n) => format!("p({successes}, {n})"),
            },
            ResponseSpec::Multinomial(vars) => format!("c({})", vars.join(", ")),
        }
    }

    pub fn variables(&self) -> Vec<String> {
        match self {
            ResponseSpec::Variable(v) | ResponseSpec::Level { variable: v, .. } => vec![v.clone()],
            ResponseSpec::Binomial { successes, trials } => match trials {
                Trials::Variable(n) => vec![successes.clone(), n.clone()],
                Trials::Fixed(_) => vec![successes.clone()],
            },
            ResponseSpec::Multinomial(vars) => vars.clone(),
        }
    }
}

/// A variable entering a term, `C(x)` forces a categorical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactorSpec {
    pub variable: String,
    pub categorical: bool,
}

impl FactorSpec {
    pub fn name(&self) -> String {
        if self.categorical {
            format!("C({})", self.variable)
        } else {
            self.variable.clone()
        }
    }
}

/// Settings of a Hilbert space approximate Gaussian process term.
#[derive(Debug, Clone, PartialEq)]
pub struct HsgpSpec {
    pub variable: String,
    pub m: usize,
    pub c: Option<f64>,
    pub l: Option<f64>,
    pub cov: String,
    pub drop_first: bool,
    pub centered: bool,
    label: String,
}

impl HsgpSpec {
    pub fn name(&self) -> &str {
        &self.label
    }
}

/// A right-hand side term before it meets the data.
#[derive(Debug, Clone, PartialEq)]
pub enum TermSpec {
    Product(Vec<FactorSpec>),
    Offset(String),
    Hsgp(HsgpSpec),
}

impl TermSpec {
    pub fn name(&self) -> String {
        match self {
            TermSpec::Product(factors) => factors.iter().map(FactorSpec::name).join(":"),
            TermSpec::Offset(v) => format!("offset({v})"),
            TermSpec::Hsgp(spec) => spec.name().to_string(),
        }
    }

    pub fn degree(&self) -> usize {
        match self {
            TermSpec::Product(factors) => factors.len(),
            _ => 1,
        }
    }

    pub fn variables(&self) -> Vec<String> {
        match self {
            TermSpec::Product(factors) => factors.iter().map(|f| f.variable.clone()).collect(),
            TermSpec::Offset(v) => vec![v.clone()],
            TermSpec::Hsgp(spec) => vec![spec.variable.clone()],
        }
    }

    fn same_as(&self, other: &TermSpec) -> bool {
        match (self, other) {
            (TermSpec::Product(a), TermSpec::Product(b)) => {
                a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
            }
            (a, b) => a == b,
        }
    }
}

/// `(expr | factor)`
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    pub intercept: bool,
    pub terms: Vec<TermSpec>,
    /// Grouping variables, more than one for `g1:g2`.
    pub factors: Vec<String>,
}

impl GroupSpec {
    pub fn factor_name(&self) -> String {
        self.factors.join(":")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFormula {
    pub response: Option<ResponseSpec>,
    pub intercept: bool,
    pub terms: Vec<TermSpec>,
    pub groups: Vec<GroupSpec>,
}

impl ParsedFormula {
    /// Every variable read from the data, response included.
    pub fn variables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let response = self.response.iter().flat_map(ResponseSpec::variables);
        let common = self.terms.iter().flat_map(TermSpec::variables);
        let groups = self.groups.iter().flat_map(|g| {
            g.terms
                .iter()
                .flat_map(TermSpec::variables)
                .chain(g.factors.iter().cloned())
                .collect::<Vec<_>>()
        });
        for name in response.chain(common).chain(groups) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Term(TermSpec),
    Intercept,
    NoIntercept,
    Group(GroupSpec),
}

struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

/// Parses `lhs ~ rhs`. The left-hand side is optional.
pub fn parse(formula: &str) -> Result<ParsedFormula, FormulaError> {
    let tokens = tokenize(formula)?;
    let tilde = tokens.iter().position(|t| *t == Token::Op('~'));
    let (lhs, rhs) = match tilde {
        Some(idx) => (Some(tokens[..idx].to_vec()), tokens[idx + 1..].to_vec()),
        None => (None, tokens),
    };
    let response = match lhs {
        Some(tokens) => {
            let mut parser = Parser { formula, tokens, pos: 0 };
            let response = parser.response()?;
            parser.expect_end()?;
            Some(response)
        }
        None => None,
    };
    let mut parser = Parser {
        formula,
        tokens: rhs,
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(parse_error(formula, "empty right-hand side"));
    }
    let items = parser.sum()?;
    parser.expect_end()?;

    let mut intercept = true;
    let mut terms = Vec::new();
    let mut groups = Vec::new();
    for item in items {
        match item {
            Item::Intercept => intercept = true,
            Item::NoIntercept => intercept = false,
            Item::Term(term) => terms.push(term),
            Item::Group(group) => groups.push(group),
        }
    }
    Ok(ParsedFormula {
        response,
        intercept,
        terms: sort_terms(terms),
        groups,
    })
}

/// Drops repeated terms and orders the rest by degree, keeping the order of
/// appearance within a degree.
fn sort_terms(terms: Vec<TermSpec>) -> Vec<TermSpec> {
    let mut unique: Vec<TermSpec> = Vec::new();
    for term in terms {
        if !unique.iter().any(|t| t.same_as(&term)) {
            unique.push(term);
        }
    }
    unique.sort_by_key(TermSpec::degree);
    unique
}

fn remove_items(items: &mut Vec<Item>, removed: Vec<Item>) {
    for item in removed {
        match item {
            Item::Intercept | Item::NoIntercept => {
                items.retain(|i| *i != Item::Intercept);
                items.push(Item::NoIntercept);
            }
            Item::Term(term) => items.retain(|i| !matches!(i, Item::Term(t) if t.same_as(&term))),
            Item::Group(group) => items.retain(|i| *i != Item::Group(group.clone())),
        }
    }
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> FormulaError {
        parse_error(self.formula, reason)
    }

    fn eat(&mut self, op: char) -> bool {
        if self.peek() == Some(&Token::Op(op)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: char) -> Result<(), FormulaError> {
        if self.eat(op) {
            Ok(())
        } else {
            let found = self.peek().map(Token::text).unwrap_or_else(|| "end of formula".into());
            Err(self.error(format!("expected '{op}', found '{found}'")))
        }
    }

    fn expect_end(&self) -> Result<(), FormulaError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(self.error(format!("unexpected '{}'", token.text()))),
        }
    }

    fn ident(&mut self) -> Result<String, FormulaError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(other) => Err(self.error(format!("expected a name, found '{}'", other.text()))),
            None => Err(self.error("expected a name, found end of formula")),
        }
    }

    fn response(&mut self) -> Result<ResponseSpec, FormulaError> {
        let name = self.ident()?;
        if self.eat('[') {
            let level = match self.next() {
                Some(Token::Ident(s)) | Some(Token::Str(s)) | Some(Token::Number(_, s)) => s,
                _ => return Err(self.error("expected a level inside '[]'")),
            };
            self.expect(']')?;
            return Ok(ResponseSpec::Level {
                variable: name,
                level,
            });
        }
        if self.eat('(') {
            let response = match name.as_str() {
                "p" => {
                    let successes = self.ident()?;
                    self.expect(',')?;
                    let trials = match self.next() {
                        Some(Token::Ident(n)) => Trials::Variable(n),
                        Some(Token::Number(n, _)) => Trials::Fixed(n),
                        _ => return Err(self.error("expected the number of trials")),
                    };
                    ResponseSpec::Binomial { successes, trials }
                }
                "c" => {
                    let mut vars = vec![self.ident()?];
                    while self.eat(',') {
                        vars.push(self.ident()?);
                    }
                    ResponseSpec::Multinomial(vars)
                }
                other => return Err(FormulaError::UnknownFunction(other.to_string())),
            };
            self.expect(')')?;
            return Ok(response);
        }
        Ok(ResponseSpec::Variable(name))
    }

    fn sum(&mut self) -> Result<Vec<Item>, FormulaError> {
        let mut items = if self.eat('-') {
            let removed = self.product()?;
            let mut items = Vec::new();
            remove_items(&mut items, removed);
            items
        } else {
            self.product()?
        };
        loop {
            if self.eat('+') {
                items.extend(self.product()?);
            } else if self.eat('-') {
                let removed = self.product()?;
                remove_items(&mut items, removed);
            } else {
                break;
            }
        }
        Ok(items)
    }

    /// `a * b` expands to `a + b + a:b`.
    fn product(&mut self) -> Result<Vec<Item>, FormulaError> {
        let mut items = self.interaction()?;
        while self.eat('*') {
            let rhs = self.interaction()?;
            let both = self.interact(&items, &rhs)?;
            items.extend(rhs);
            items.extend(both);
        }
        Ok(items)
    }

    fn interaction(&mut self) -> Result<Vec<Item>, FormulaError> {
        let mut items = self.atom()?;
        while self.eat(':') {
            let rhs = self.atom()?;
            items = self.interact(&items, &rhs)?;
        }
        Ok(items)
    }

    fn interact(&self, lhs: &[Item], rhs: &[Item]) -> Result<Vec<Item>, FormulaError> {
        let mut out = Vec::with_capacity(lhs.len() * rhs.len());
        for (a, b) in lhs.iter().cartesian_product(rhs) {
            match (a, b) {
                (Item::Term(TermSpec::Product(fa)), Item::Term(TermSpec::Product(fb))) => {
                    let mut factors = fa.clone();
                    for f in fb {
                        if !factors.contains(f) {
                            factors.push(f.clone());
                        }
                    }
                    out.push(Item::Term(TermSpec::Product(factors)));
                }
                _ => return Err(self.error("only variables can be interacted")),
            }
        }
        Ok(out)
    }

    fn atom(&mut self) -> Result<Vec<Item>, FormulaError> {
        match self.next() {
            Some(Token::Number(value, text)) => {
                if value == 0.0 {
                    Ok(vec![Item::NoIntercept])
                } else if value == 1.0 {
                    Ok(vec![Item::Intercept])
                } else {
                    Err(self.error(format!("unexpected number '{text}'")))
                }
            }
            Some(Token::Op('(')) => {
                let items = self.sum()?;
                if self.eat('|') {
                    let group = self.group(items)?;
                    self.expect(')')?;
                    return Ok(vec![Item::Group(group)]);
                }
                self.expect(')')?;
                Ok(items)
            }
            Some(Token::Ident(name)) => {
                if self.eat('(') {
                    return self.call(name);
                }
                Ok(vec![Item::Term(TermSpec::Product(vec![FactorSpec {
                    variable: name,
                    categorical: false,
                }]))])
            }
            Some(other) => Err(self.error(format!("unexpected '{}'", other.text()))),
            None => Err(self.error("unexpected end of formula")),
        }
    }

    fn group(&mut self, items: Vec<Item>) -> Result<GroupSpec, FormulaError> {
        let mut factors = vec![self.ident()?];
        while self.eat(':') {
            factors.push(self.ident()?);
        }
        let mut intercept = true;
        let mut terms = Vec::new();
        for item in items {
            match item {
                Item::Intercept => intercept = true,
                Item::NoIntercept => intercept = false,
                Item::Term(term @ TermSpec::Product(_)) => terms.push(term),
                Item::Term(other) => {
                    return Err(self.error(format!(
                        "'{}' can not be used in a group specific term",
                        other.name()
                    )))
                }
                Item::Group(_) => return Err(self.error("group specific terms can not be nested")),
            }
        }
        Ok(GroupSpec {
            intercept,
            terms: sort_terms(terms),
            factors,
        })
    }

    fn call(&mut self, func: String) -> Result<Vec<Item>, FormulaError> {
        let term = match func.as_str() {
            "C" => {
                let variable = self.ident()?;
                self.expect(')')?;
                TermSpec::Product(vec![FactorSpec {
                    variable,
                    categorical: true,
                }])
            }
            "offset" => {
                let variable = self.ident()?;
                self.expect(')')?;
                TermSpec::Offset(variable)
            }
            "hsgp" => TermSpec::Hsgp(self.hsgp()?),
            other => return Err(FormulaError::UnknownFunction(other.to_string())),
        };
        Ok(vec![Item::Term(term)])
    }

    fn hsgp(&mut self) -> Result<HsgpSpec, FormulaError> {
        let variable = self.ident()?;
        let mut spec = HsgpSpec {
            variable: variable.clone(),
            m: 0,
            c: None,
            l: None,
            cov: "ExpQuad".to_string(),
            drop_first: false,
            centered: false,
            label: String::new(),
        };
        let mut parts = vec![variable];
        while self.eat(',') {
            let key = self.ident()?;
            self.expect('=')?;
            let value = self
                .next()
                .ok_or_else(|| self.error("expected a value after '='"))?;
            parts.push(format!("{key}={}", value.text()));
            let invalid = |reason: &str| FormulaError::InvalidArgument {
                call: "hsgp".to_string(),
                argument: key.clone(),
                reason: reason.to_string(),
            };
            match (key.as_str(), &value) {
                ("m", Token::Number(x, _)) if *x >= 1.0 && x.fract() == 0.0 => spec.m = *x as usize,
                ("c", Token::Number(x, _)) if *x > 1.0 => spec.c = Some(*x),
                ("L", Token::Number(x, _)) if *x > 0.0 => spec.l = Some(*x),
                ("cov", Token::Str(s) | Token::Ident(s)) => {
                    if !["ExpQuad", "Matern32", "Matern52"].contains(&s.as_str()) {
                        return Err(invalid("must be one of 'ExpQuad', 'Matern32', 'Matern52'"));
                    }
                    spec.cov = s.clone();
                }
                ("drop_first" | "centered", Token::Ident(s)) => {
                    let flag = match s.as_str() {
                        "True" | "true" => true,
                        "False" | "false" => false,
                        _ => return Err(invalid("must be a boolean")),
                    };
                    if key == "drop_first" {
                        spec.drop_first = flag;
                    } else {
                        spec.centered = flag;
                    }
                }
                ("m", _) => return Err(invalid("must be a positive integer")),
                ("c", _) => return Err(invalid("must be a number larger than 1")),
                ("L", _) => return Err(invalid("must be a positive number")),
                _ => return Err(invalid("unknown argument")),
            }
        }
        self.expect(')')?;
        if spec.m == 0 {
            return Err(FormulaError::InvalidArgument {
                call: "hsgp".to_string(),
                argument: "m".to_string(),
                reason: "is required".to_string(),
            });
        }
        if spec.c.is_none() == spec.l.is_none() {
            return Err(FormulaError::InvalidArgument {
                call: "hsgp".to_string(),
                argument: "c".to_string(),
                reason: "exactly one of 'c' and 'L' must be given".to_string(),
            });
        }
        spec.label = format!("hsgp({})", parts.join(", "));
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names(formula: &str) -> Vec<String> {
        parse(formula).unwrap().terms.iter().map(TermSpec::name).collect()
    }

    #[test]
    fn products_expand() {
        assert_eq!(names("y ~ a*b"), vec!["a", "b", "a:b"]);
        assert_eq!(names("y ~ a:b + a"), vec!["a", "a:b"]);
        assert_eq!(names("y ~ (a + b):x"), vec!["a:x", "b:x"]);
        assert_eq!(names("y ~ a*b - a:b"), vec!["a", "b"]);
    }

    #[test]
    fn intercept_handling() {
        assert!(parse("y ~ x").unwrap().intercept);
        assert!(!parse("y ~ 0 + x").unwrap().intercept);
        assert!(!parse("y ~ x - 1").unwrap().intercept);
        assert!(parse("y ~ 1").unwrap().terms.is_empty());
    }

    #[test]
    fn repeated_terms_collapse() {
        assert_eq!(names("y ~ x + x + b:a + a:b"), vec!["x", "b:a"]);
    }

    #[test]
    fn group_specific_terms() {
        let parsed = parse("y ~ x + (x | g) + (0 + z | g1:g2)").unwrap();
        assert_eq!(parsed.groups.len(), 2);
        assert!(parsed.groups[0].intercept);
        assert_eq!(parsed.groups[0].factor_name(), "g");
        assert!(!parsed.groups[1].intercept);
        assert_eq!(parsed.groups[1].factor_name(), "g1:g2");
        assert_eq!(
            parsed.variables(),
            vec!["y", "x", "g", "z", "g1", "g2"]
        );
    }

    #[test]
    fn responses() {
        let parsed = parse("y[yes] ~ x").unwrap();
        assert_eq!(
            parsed.response,
            Some(ResponseSpec::Level {
                variable: "y".into(),
                level: "yes".into()
            })
        );
        let parsed = parse("p(k, n) ~ x").unwrap();
        assert_eq!(parsed.response.unwrap().name(), "p(k, n)");
        let parsed = parse("p(k, 10) ~ x").unwrap();
        assert_eq!(parsed.response.unwrap().variables(), vec!["k"]);
        let parsed = parse("c(a, b, c) ~ 1").unwrap();
        assert_eq!(parsed.response.unwrap().name(), "c(a, b, c)");
        assert!(parse("~ x").unwrap().response.is_none());
    }

    #[test]
    fn function_calls() {
        assert_eq!(names("y ~ C(x) + offset(z)"), vec!["C(x)", "offset(z)"]);
        let parsed = parse("y ~ hsgp(x, m=10, c=1.5, cov='Matern52')").unwrap();
        let TermSpec::Hsgp(spec) = &parsed.terms[0] else {
            panic!("expected an hsgp term");
        };
        assert_eq!(spec.m, 10);
        assert_eq!(spec.c, Some(1.5));
        assert_eq!(spec.cov, "Matern52");
        assert_eq!(spec.name(), "hsgp(x, m=10, c=1.5, cov=Matern52)");
    }

    #[test]
    fn invalid_formulas() {
        assert!(matches!(parse("y ~ log(x)"), Err(FormulaError::UnknownFunction(_))));
        assert!(parse("y ~ x +").is_err());
        assert!(parse("y ~ (x | g):z").is_err());
        assert!(parse("y ~ hsgp(x, c=1.5)").is_err());
        assert!(parse("y ~ hsgp(x, m=10)").is_err());
        assert!(parse("y ~ x $ z").is_err());
    }
}
