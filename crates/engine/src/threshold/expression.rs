//! Threshold expression grammar
//!
//! ```text
//! expression := statistic operator bound [unit]
//! statistic  := "p(" N ")" | "p" N | "avg" | "min" | "max" | "med"
//!             | "count" | "sum" | "rate"
//! operator   := "<" | "<=" | ">" | ">=" | "==" | "!="
//! unit       := "ms" | "s" | "us"        (duration statistics only)
//! ```
//!
//! Duration values are milliseconds, so `p(90)<50`, `p90 < 50ms` and
//! `p(90) < 0.05s` are the same expression. `rate` is the failure rate of
//! the series.

use std::fmt;
use std::str::FromStr;

use crate::metrics::SeriesSnapshot;

/// Errors produced while parsing a threshold expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThresholdParseError {
    #[error("expression is empty")]
    Empty,

    #[error("no comparison operator in '{0}'")]
    MissingOperator(String),

    #[error("unknown statistic '{0}'")]
    UnknownStatistic(String),

    #[error("percentile must be within 0..=100, got '{0}'")]
    InvalidPercentile(String),

    #[error("invalid bound '{0}'")]
    InvalidBound(String),

    #[error("unit '{unit}' cannot be used with statistic '{statistic}'")]
    UnitNotAllowed { statistic: String, unit: String },
}

/// Aggregated value a threshold compares against
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    /// Percentile in `0.0..=100.0`
    Percentile(f64),
    Avg,
    Min,
    Max,
    Med,
    Count,
    Sum,
    /// Failure rate, `failure_count / count`
    Rate,
}

impl Statistic {
    /// Read this statistic from a series
    pub fn resolve(&self, series: &SeriesSnapshot) -> f64 {
        match self {
            Self::Percentile(p) => series.percentile(*p),
            Self::Avg => series.mean(),
            Self::Min => series.min,
            Self::Max => series.max,
            Self::Med => series.median(),
            Self::Count => series.count as f64,
            Self::Sum => series.sum,
            Self::Rate => series.failure_rate(),
        }
    }

    /// Whether a duration unit suffix makes sense for this statistic
    fn accepts_unit(&self) -> bool {
        !matches!(self, Self::Count | Self::Rate)
    }

    fn parse(raw: &str) -> Result<Self, ThresholdParseError> {
        let text: String = raw
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        match text.as_str() {
            "avg" => return Ok(Self::Avg),
            "min" => return Ok(Self::Min),
            "max" => return Ok(Self::Max),
            "med" => return Ok(Self::Med),
            "count" => return Ok(Self::Count),
            "sum" => return Ok(Self::Sum),
            "rate" | "failure_rate" | "failurerate" => return Ok(Self::Rate),
            _ => {}
        }

        let digits = text
            .strip_prefix("p(")
            .and_then(|rest| rest.strip_suffix(')'))
            .or_else(|| text.strip_prefix('p'))
            .ok_or_else(|| ThresholdParseError::UnknownStatistic(raw.trim().to_string()))?;

        let p: f64 = digits
            .parse()
            .map_err(|_| ThresholdParseError::UnknownStatistic(raw.trim().to_string()))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(ThresholdParseError::InvalidPercentile(digits.to_string()));
        }
        Ok(Self::Percentile(p))
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentile(p) => write!(f, "p({})", p),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Med => write!(f, "med"),
            Self::Count => write!(f, "count"),
            Self::Sum => write!(f, "sum"),
            Self::Rate => write!(f, "rate"),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    /// `observed <op> bound`
    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    /// Split `text` at the first operator
    fn split(text: &str) -> Option<(&str, Self, &str)> {
        let index = text.find(['<', '>', '=', '!'])?;
        let (lhs, rest) = text.split_at(index);

        const OPERATORS: [(&str, Comparison); 6] = [
            ("<=", Comparison::Le),
            (">=", Comparison::Ge),
            ("==", Comparison::Eq),
            ("!=", Comparison::Ne),
            ("<", Comparison::Lt),
            (">", Comparison::Gt),
        ];

        OPERATORS
            .iter()
            .find(|(symbol, _)| rest.starts_with(symbol))
            .map(|(symbol, op)| (lhs, *op, &rest[symbol.len()..]))
    }
}

/// A parsed `statistic <op> bound` expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparison: Comparison,
    /// Bound in the metric's own unit (milliseconds for durations)
    pub bound: f64,
}

impl ThresholdExpr {
    pub fn parse(text: &str) -> Result<Self, ThresholdParseError> {
        text.parse()
    }

    /// Statistic value for this expression
    pub fn observe(&self, series: &SeriesSnapshot) -> f64 {
        self.statistic.resolve(series)
    }

    /// Whether the observed value satisfies the expression
    pub fn is_satisfied_by(&self, observed: f64) -> bool {
        self.comparison.holds(observed, self.bound)
    }
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ThresholdParseError::Empty);
        }

        let (lhs, comparison, rhs) = Comparison::split(text)
            .ok_or_else(|| ThresholdParseError::MissingOperator(text.to_string()))?;
        let statistic = Statistic::parse(lhs)?;
        let bound = parse_bound(rhs.trim(), &statistic)?;

        Ok(Self {
            statistic,
            comparison,
            bound,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.statistic, self.comparison.symbol(), self.bound)
    }
}

fn parse_bound(raw: &str, statistic: &Statistic) -> Result<f64, ThresholdParseError> {
    // Longest suffixes first so "ms" is not read as "s"
    const UNITS: [(&str, f64); 4] = [("ms", 1.0), ("us", 0.001), ("µs", 0.001), ("s", 1000.0)];

    let (number, factor) = match UNITS.iter().find(|(unit, _)| raw.ends_with(unit)) {
        Some((unit, factor)) => {
            if !statistic.accepts_unit() {
                return Err(ThresholdParseError::UnitNotAllowed {
                    statistic: statistic.to_string(),
                    unit: unit.to_string(),
                });
            }
            (raw[..raw.len() - unit.len()].trim(), *factor)
        }
        None => (raw, 1.0),
    };

    let value: f64 = number
        .parse()
        .map_err(|_| ThresholdParseError::InvalidBound(raw.to_string()))?;
    if !value.is_finite() {
        return Err(ThresholdParseError::InvalidBound(raw.to_string()));
    }
    Ok(value * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_k6_style() {
        let expr = ThresholdExpr::parse("p(90)<50").unwrap();
        assert_eq!(expr.statistic, Statistic::Percentile(90.0));
        assert_eq!(expr.comparison, Comparison::Lt);
        assert_eq!(expr.bound, 50.0);

        let rate = ThresholdExpr::parse("rate<0.0001").unwrap();
        assert_eq!(rate.statistic, Statistic::Rate);
        assert_eq!(rate.bound, 0.0001);
    }

    #[test]
    fn test_parse_variants_are_equivalent() {
        let a = ThresholdExpr::parse("p(90)<50").unwrap();
        let b = ThresholdExpr::parse("p90 < 50ms").unwrap();
        let c = ThresholdExpr::parse(" P(90) < 0.05s ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_parse_all_statistics_and_operators() {
        let cases = [
            ("avg<=200", Statistic::Avg, Comparison::Le),
            ("min>1", Statistic::Min, Comparison::Gt),
            ("max>=3s", Statistic::Max, Comparison::Ge),
            ("med==5", Statistic::Med, Comparison::Eq),
            ("count!=0", Statistic::Count, Comparison::Ne),
            ("sum<100", Statistic::Sum, Comparison::Lt),
            ("p(99.9)<250us", Statistic::Percentile(99.9), Comparison::Lt),
            ("failureRate < 0.01", Statistic::Rate, Comparison::Lt),
        ];

        for (text, statistic, comparison) in cases {
            let expr = ThresholdExpr::parse(text).unwrap();
            assert_eq!(expr.statistic, statistic, "{}", text);
            assert_eq!(expr.comparison, comparison, "{}", text);
        }
        assert_eq!(ThresholdExpr::parse("max>=3s").unwrap().bound, 3000.0);
        assert_eq!(ThresholdExpr::parse("p(99.9)<250us").unwrap().bound, 0.25);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ThresholdExpr::parse("  "), Err(ThresholdParseError::Empty));
        assert!(matches!(
            ThresholdExpr::parse("p(90) 50"),
            Err(ThresholdParseError::MissingOperator(_))
        ));
        assert!(matches!(
            ThresholdExpr::parse("stddev<5"),
            Err(ThresholdParseError::UnknownStatistic(_))
        ));
        assert!(matches!(
            ThresholdExpr::parse("p(120)<5"),
            Err(ThresholdParseError::InvalidPercentile(_))
        ));
        assert!(matches!(
            ThresholdExpr::parse("avg<fast"),
            Err(ThresholdParseError::InvalidBound(_))
        ));
        assert!(matches!(
            ThresholdExpr::parse("rate<5ms"),
            Err(ThresholdParseError::UnitNotAllowed { .. })
        ));
    }

    #[test]
    fn test_comparison_holds() {
        assert!(Comparison::Lt.holds(1.0, 2.0));
        assert!(!Comparison::Lt.holds(2.0, 2.0));
        assert!(Comparison::Le.holds(2.0, 2.0));
        assert!(Comparison::Gt.holds(3.0, 2.0));
        assert!(Comparison::Ge.holds(2.0, 2.0));
        assert!(Comparison::Eq.holds(2.0, 2.0));
        assert!(Comparison::Ne.holds(1.0, 2.0));
    }

    #[test]
    fn test_display_round_trips() {
        let expr = ThresholdExpr::parse("p90 <= 50ms").unwrap();
        assert_eq!(expr.to_string(), "p(90)<=50");
        assert_eq!(ThresholdExpr::parse(&expr.to_string()).unwrap(), expr);
    }
}
