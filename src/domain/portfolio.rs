//! Portfolio state and equity tracking for a single-position run.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::position::{Position, Trade};

/// Mark-to-market snapshot taken after a bar is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: NaiveDateTime,
    /// `cash + position_value`.
    pub equity: f64,
    /// Signed units held: positive long, negative short, 0 when flat.
    pub position_size: f64,
    pub cash: f64,
    pub position_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    pub position: Option<Position>,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Portfolio {
            cash: initial_capital,
            initial_capital,
            position: None,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn open(&mut self, position: Position) {
        self.position = Some(position);
    }

    pub fn take_position(&mut self) -> Option<Position> {
        self.position.take()
    }

    pub fn record_trade(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    pub fn total_equity(&self, price: f64) -> f64 {
        self.cash + self.position.as_ref().map_or(0.0, |p| p.market_value(price))
    }

    /// Append an equity point valued at `price`.
    pub fn mark(&mut self, time: NaiveDateTime, price: f64) {
        let (position_size, position_value) = match &self.position {
            Some(p) => (p.side.sign() * p.quantity, p.market_value(price)),
            None => (0.0, 0.0),
        };
        self.equity_curve.push(EquityPoint {
            time,
            equity: self.cash + position_value,
            position_size,
            cash: self.cash,
            position_value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pine::Side;
    use chrono::NaiveDate;

    fn time(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn sample_position(side: Side, quantity: f64) -> Position {
        Position {
            side,
            quantity,
            entry_price: 100.0,
            fill_price: 100.0,
            entry_time: time(15),
            entry_bar: 0,
            entry_commission: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            entry_reason: String::new(),
        }
    }

    #[test]
    fn new_portfolio() {
        let portfolio = Portfolio::new(100000.0);
        assert!((portfolio.cash - 100000.0).abs() < f64::EPSILON);
        assert!(!portfolio.has_position());
        assert!(portfolio.trades.is_empty());
        assert!(portfolio.equity_curve.is_empty());
    }

    #[test]
    fn open_and_take_position() {
        let mut portfolio = Portfolio::new(100000.0);
        portfolio.open(sample_position(Side::Long, 10.0));
        assert!(portfolio.has_position());
        let taken = portfolio.take_position();
        assert_eq!(taken.map(|p| p.quantity), Some(10.0));
        assert!(!portfolio.has_position());
        assert!(portfolio.take_position().is_none());
    }

    #[test]
    fn total_equity_with_position() {
        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.cash = 90_000.0;
        portfolio.open(sample_position(Side::Long, 100.0));
        assert!((portfolio.total_equity(110.0) - 101_000.0).abs() < 1e-9);
    }

    #[test]
    fn mark_records_reconciled_point() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio.cash = 5_000.0;
        portfolio.open(sample_position(Side::Short, 50.0));
        portfolio.mark(time(16), 90.0);
        let point = &portfolio.equity_curve[0];
        assert!((point.position_size + 50.0).abs() < f64::EPSILON);
        assert!((point.position_value - 5_500.0).abs() < 1e-9);
        assert!((point.equity - (point.cash + point.position_value)).abs() < 1e-9);
    }

    #[test]
    fn mark_when_flat() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio.mark(time(1), 42.0);
        let point = &portfolio.equity_curve[0];
        assert_eq!(point.position_size, 0.0);
        assert!((point.equity - 10_000.0).abs() < f64::EPSILON);
    }
}
