//! rgx-risk
//!
//! VaR model validation: given a series of VaR estimates and the realized
//! P&L for the same periods, count exceptions and test them for correct
//! frequency (Kupiec POF), independence (Christoffersen) and both at once
//! (conditional coverage), then place the result in a traffic-light zone.
//!
//! Pure functions of their inputs. No IO, no clock.

mod var_backtest;

pub use var_backtest::{
    LikelihoodRatioTest, TrafficLightZone, VarBacktestEngine, VarBacktestError, VarBacktestResult,
};
