use serde::Serialize;
use statrs::distribution::{Binomial, ChiSquared, ContinuousCDF, DiscreteCDF};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VarBacktestError {
    #[error("empty sample")]
    EmptySample,
    #[error("series length mismatch: {var} VaR estimates vs {pnl} P&L values")]
    LengthMismatch { var: usize, pnl: usize },
    #[error("confidence must be in (0, 1), got {0}")]
    InvalidConfidence(f64),
    #[error("significance must be in (0, 1), got {0}")]
    InvalidSignificance(f64),
    #[error("non-finite value at index {index}")]
    NonFinite { index: usize },
    #[error("distribution error: {0}")]
    Distribution(String),
}

/// Basel-style zone from the cumulative binomial probability of seeing at
/// most the observed number of exceptions under the model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrafficLightZone {
    Green,
    Yellow,
    Red,
}

impl TrafficLightZone {
    pub const GREEN_BELOW: f64 = 0.95;
    pub const YELLOW_BELOW: f64 = 0.9999;

    pub fn from_cumulative(p: f64) -> Self {
        if p < Self::GREEN_BELOW {
            TrafficLightZone::Green
        } else if p < Self::YELLOW_BELOW {
            TrafficLightZone::Yellow
        } else {
            TrafficLightZone::Red
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct LikelihoodRatioTest {
    pub statistic: f64,
    pub degrees_of_freedom: u32,
    pub p_value: f64,
    /// Null hypothesis rejected at the engine's significance level.
    pub reject: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VarBacktestResult {
    pub observations: usize,
    pub exceptions: usize,
    pub expected_exceptions: f64,
    pub exception_rate: f64,
    pub kupiec_pof: LikelihoodRatioTest,
    pub christoffersen_independence: LikelihoodRatioTest,
    pub conditional_coverage: LikelihoodRatioTest,
    pub zone: TrafficLightZone,
    pub zone_cumulative_probability: f64,
    /// Indices of the exception periods.
    pub exception_indices: Vec<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct VarBacktestEngine {
    confidence: f64,
    significance: f64,
}

impl VarBacktestEngine {
    /// `confidence` is the VaR level (e.g. 0.99). Tests reject at 5%.
    pub fn new(confidence: f64) -> Result<Self, VarBacktestError> {
        Self::with_significance(confidence, 0.05)
    }

    pub fn with_significance(confidence: f64, significance: f64) -> Result<Self, VarBacktestError> {
        if !(confidence > 0.0 && confidence < 1.0) {
            return Err(VarBacktestError::InvalidConfidence(confidence));
        }
        if !(significance > 0.0 && significance < 1.0) {
            return Err(VarBacktestError::InvalidSignificance(significance));
        }
        Ok(Self {
            confidence,
            significance,
        })
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Exception flags: a period is an exception when its loss (`-pnl`)
    /// exceeds the VaR estimate. VaR is a positive loss threshold.
    pub fn exceptions(var: &[f64], pnl: &[f64]) -> Result<Vec<bool>, VarBacktestError> {
        if var.len() != pnl.len() {
            return Err(VarBacktestError::LengthMismatch {
                var: var.len(),
                pnl: pnl.len(),
            });
        }
        var.iter()
            .zip(pnl)
            .enumerate()
            .map(|(i, (v, p))| {
                if !v.is_finite() || !p.is_finite() {
                    return Err(VarBacktestError::NonFinite { index: i });
                }
                Ok(-p > v.abs())
            })
            .collect()
    }

    pub fn run(&self, var: &[f64], pnl: &[f64]) -> Result<VarBacktestResult, VarBacktestError> {
        let hits = Self::exceptions(var, pnl)?;
        self.evaluate(&hits)
    }

    /// Evaluate an already computed exception series.
    pub fn evaluate(&self, hits: &[bool]) -> Result<VarBacktestResult, VarBacktestError> {
        let n = hits.len();
        if n == 0 {
            return Err(VarBacktestError::EmptySample);
        }
        let p = 1.0 - self.confidence;
        let x = hits.iter().filter(|h| **h).count();

        let pof = kupiec_statistic(n, x, p);
        let ind = christoffersen_statistic(hits);
        let kupiec_pof = self.lr_test(pof, 1)?;
        let christoffersen_independence = self.lr_test(ind, 1)?;
        let conditional_coverage = self.lr_test(pof + ind, 2)?;

        let binom = Binomial::new(p, n as u64).map_err(|e| VarBacktestError::Distribution(e.to_string()))?;
        let cumulative = binom.cdf(x as u64);

        Ok(VarBacktestResult {
            observations: n,
            exceptions: x,
            expected_exceptions: n as f64 * p,
            exception_rate: x as f64 / n as f64,
            kupiec_pof,
            christoffersen_independence,
            conditional_coverage,
            zone: TrafficLightZone::from_cumulative(cumulative),
            zone_cumulative_probability: cumulative,
            exception_indices: hits
                .iter()
                .enumerate()
                .filter(|(_, h)| **h)
                .map(|(i, _)| i)
                .collect(),
        })
    }

    fn lr_test(&self, statistic: f64, df: u32) -> Result<LikelihoodRatioTest, VarBacktestError> {
        let chi = ChiSquared::new(f64::from(df)).map_err(|e| VarBacktestError::Distribution(e.to_string()))?;
        let statistic = statistic.max(0.0);
        let p_value = (1.0 - chi.cdf(statistic)).clamp(0.0, 1.0);
        Ok(LikelihoodRatioTest {
            statistic,
            degrees_of_freedom: df,
            p_value,
            reject: p_value < self.significance,
        })
    }
}

/// `k * ln(q)` with the `0 * ln(0) = 0` convention.
fn xlny(k: f64, q: f64) -> f64 {
    if k == 0.0 {
        0.0
    } else {
        k * q.ln()
    }
}

/// Kupiec proportion-of-failures LR statistic.
fn kupiec_statistic(n: usize, x: usize, p: f64) -> f64 {
    let (n, x) = (n as f64, x as f64);
    let phat = x / n;
    let null = xlny(n - x, 1.0 - p) + xlny(x, p);
    let alt = xlny(n - x, 1.0 - phat) + xlny(x, phat);
    -2.0 * (null - alt)
}

/// Christoffersen first-order Markov independence LR statistic.
fn christoffersen_statistic(hits: &[bool]) -> f64 {
    let (mut n00, mut n01, mut n10, mut n11) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for w in hits.windows(2) {
        match (w[0], w[1]) {
            (false, false) => n00 += 1.0,
            (false, true) => n01 += 1.0,
            (true, false) => n10 += 1.0,
            (true, true) => n11 += 1.0,
        }
    }
    let total = n00 + n01 + n10 + n11;
    if total == 0.0 {
        return 0.0;
    }
    let pi0 = if n00 + n01 > 0.0 { n01 / (n00 + n01) } else { 0.0 };
    let pi1 = if n10 + n11 > 0.0 { n11 / (n10 + n11) } else { 0.0 };
    let pi = (n01 + n11) / total;

    let restricted = xlny(n00 + n10, 1.0 - pi) + xlny(n01 + n11, pi);
    let unrestricted = xlny(n00, 1.0 - pi0) + xlny(n01, pi0) + xlny(n10, 1.0 - pi1) + xlny(n11, pi1);
    -2.0 * (restricted - unrestricted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(n: usize, at: &[usize]) -> Vec<bool> {
        let mut h = vec![false; n];
        for i in at {
            h[*i] = true;
        }
        h
    }

    #[test]
    fn exact_expected_rate_is_not_rejected() {
        let e = VarBacktestEngine::new(0.95).unwrap();
        let r = e.evaluate(&hits(100, &[10, 30, 50, 70, 90])).unwrap();
        assert_eq!(r.exceptions, 5);
        assert!(r.kupiec_pof.statistic.abs() < 1e-9);
        assert!((r.kupiec_pof.p_value - 1.0).abs() < 1e-9);
        assert!(!r.kupiec_pof.reject);
    }

    #[test]
    fn far_too_many_exceptions_rejects() {
        let e = VarBacktestEngine::new(0.99).unwrap();
        let at: Vec<usize> = (0..250).step_by(10).collect();
        let r = e.evaluate(&hits(250, &at)).unwrap();
        assert_eq!(r.exceptions, 25);
        assert!(r.kupiec_pof.reject);
        assert_eq!(r.zone, TrafficLightZone::Red);
    }

    #[test]
    fn clustered_exceptions_fail_independence() {
        let e = VarBacktestEngine::new(0.95).unwrap();
        let r = e.evaluate(&hits(200, &[100, 101, 102, 103, 104, 105, 106, 107, 108, 109])).unwrap();
        assert!(r.christoffersen_independence.reject);
        assert!(r.conditional_coverage.statistic >= r.kupiec_pof.statistic);
    }

    #[test]
    fn zero_exceptions_is_green() {
        let e = VarBacktestEngine::new(0.99).unwrap();
        let r = e.evaluate(&hits(250, &[])).unwrap();
        assert_eq!(r.zone, TrafficLightZone::Green);
        assert_eq!(r.christoffersen_independence.statistic, 0.0);
        assert!(r.kupiec_pof.statistic.is_finite());
    }

    #[test]
    fn loss_beyond_var_is_an_exception() {
        let flags = VarBacktestEngine::exceptions(&[10.0, 10.0, 10.0], &[-11.0, -10.0, 5.0]).unwrap();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn bad_inputs() {
        assert!(VarBacktestEngine::new(1.0).is_err());
        let e = VarBacktestEngine::new(0.99).unwrap();
        assert_eq!(e.run(&[], &[]), Err(VarBacktestError::EmptySample));
        assert_eq!(
            e.run(&[1.0], &[]),
            Err(VarBacktestError::LengthMismatch { var: 1, pnl: 0 })
        );
        assert_eq!(
            e.run(&[1.0, f64::NAN], &[0.0, 0.0]),
            Err(VarBacktestError::NonFinite { index: 1 })
        );
    }
}
