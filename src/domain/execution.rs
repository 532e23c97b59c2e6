//! Trade execution and fill simulation.
//!
//! Orders fill at the bar close with slippage applied against the trader:
//! buys fill above the close, sells below. All rates are fractions
//! (`0.001` = 0.1%).

use chrono::NaiveDateTime;

use super::pine::Side;
use super::portfolio::Portfolio;
use super::position::{Position, Trade};

/// Fill and sizing settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub commission_rate: f64,
    pub slippage_rate: f64,
    /// Upper bound on the fraction of equity committed to one position.
    pub max_position_size: f64,
    /// Fraction of equity at risk per trade; only binds when a stop is set.
    pub risk_per_trade: f64,
    /// Stop distance as a fraction of the fill; 0 disables.
    pub stop_loss_pct: f64,
    /// Target distance as a fraction of the fill; 0 disables.
    pub take_profit_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_rate: 0.0,
            slippage_rate: 0.0,
            max_position_size: 1.0,
            risk_per_trade: 1.0,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
        }
    }
}

pub fn calculate_commission(trade_value: f64, config: &ExecutionConfig) -> f64 {
    trade_value * config.commission_rate
}

/// Execution price for a buy (`buying == true`) or sell at `market_price`.
pub fn apply_slippage(market_price: f64, slippage_rate: f64, buying: bool) -> f64 {
    if buying {
        market_price * (1.0 + slippage_rate)
    } else {
        market_price * (1.0 - slippage_rate)
    }
}

/// Fraction of equity to commit: `min(max_position_size, risk_per_trade / stop)`.
pub fn position_fraction(config: &ExecutionConfig) -> f64 {
    if config.stop_loss_pct > 0.0 {
        config
            .max_position_size
            .min(config.risk_per_trade / config.stop_loss_pct)
    } else {
        config.max_position_size
    }
}

/// Result of an entry attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryResult {
    Entered {
        quantity: f64,
        fill_price: f64,
        commission: f64,
    },
    InsufficientCapital,
}

/// What opened or closed a position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill<'a> {
    pub market_price: f64,
    pub time: NaiveDateTime,
    pub bar: usize,
    pub reason: &'a str,
}

/// Open a position on a flat portfolio.
///
/// 1. Apply slippage to the close
/// 2. Size the position so that notional plus commission is
///    `position_fraction × equity`; cash never goes negative
/// 3. Debit notional and commission (a short escrows its notional)
/// 4. Derive stop-loss/take-profit prices from the fill
pub fn enter(portfolio: &mut Portfolio, side: Side, fill: Fill<'_>, config: &ExecutionConfig) -> EntryResult {
    if portfolio.has_position() {
        return EntryResult::InsufficientCapital;
    }

    let fill_price = apply_slippage(fill.market_price, config.slippage_rate, side == Side::Long);
    let budget = position_fraction(config) * portfolio.cash;
    let quantity = budget / (fill_price * (1.0 + config.commission_rate));

    if !quantity.is_finite() || quantity <= 0.0 {
        return EntryResult::InsufficientCapital;
    }

    let cost = quantity * fill_price;
    let commission = calculate_commission(cost, config);
    portfolio.cash -= cost + commission;

    let sign = side.sign();
    let stop_loss = if config.stop_loss_pct > 0.0 {
        fill_price * (1.0 - sign * config.stop_loss_pct)
    } else {
        0.0
    };
    let take_profit = if config.take_profit_pct > 0.0 {
        fill_price * (1.0 + sign * config.take_profit_pct)
    } else {
        0.0
    };

    portfolio.open(Position {
        side,
        quantity,
        entry_price: fill.market_price,
        fill_price,
        entry_time: fill.time,
        entry_bar: fill.bar,
        entry_commission: commission,
        stop_loss,
        take_profit,
        entry_reason: fill.reason.to_string(),
    });

    EntryResult::Entered {
        quantity,
        fill_price,
        commission,
    }
}

/// Close the open position, settle cash and record the trade.
pub fn exit_position(portfolio: &mut Portfolio, fill: Fill<'_>, config: &ExecutionConfig) -> Option<Trade> {
    let position = portfolio.take_position()?;

    let exit_fill = apply_slippage(fill.market_price, config.slippage_rate, !position.is_long());
    let exit_value = position.quantity * exit_fill;
    let exit_commission = calculate_commission(exit_value, config);

    match position.side {
        Side::Long => portfolio.cash += exit_value - exit_commission,
        Side::Short => {
            // return the escrowed notional plus the short's profit
            let entry_notional = position.quantity * position.fill_price;
            portfolio.cash += entry_notional + (entry_notional - exit_value) - exit_commission;
        }
    }

    let quantity = position.quantity;
    let commission = position.entry_commission + exit_commission;
    let slippage_cost = quantity
        * ((position.fill_price - position.entry_price).abs() + (exit_fill - fill.market_price).abs());
    let pnl = (fill.market_price - position.entry_price) * quantity * position.side.sign()
        - commission
        - slippage_cost;
    let entry_notional = quantity * position.entry_price;

    let trade = Trade {
        side: position.side,
        entry_time: position.entry_time,
        exit_time: fill.time,
        entry_price: position.entry_price,
        exit_price: fill.market_price,
        quantity,
        commission,
        slippage_cost,
        pnl,
        pnl_pct: if entry_notional > 0.0 {
            pnl / entry_notional * 100.0
        } else {
            0.0
        },
        bars_held: fill.bar.saturating_sub(position.entry_bar),
        duration_secs: (fill.time - position.entry_time).num_seconds(),
        entry_reason: position.entry_reason,
        exit_reason: fill.reason.to_string(),
    };
    portfolio.record_trade(trade.clone());
    Some(trade)
}

/// Stop-loss or take-profit label when the close triggers one.
pub fn check_triggers(portfolio: &Portfolio, price: f64) -> Option<&'static str> {
    let position = portfolio.position.as_ref()?;
    if position.should_stop_loss(price) {
        Some("stop loss")
    } else if position.should_take_profit(price) {
        Some("take profit")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn make_config() -> ExecutionConfig {
        ExecutionConfig {
            commission_rate: 0.001,
            slippage_rate: 0.0005,
            max_position_size: 0.25,
            risk_per_trade: 1.0,
            stop_loss_pct: 0.05,
            take_profit_pct: 0.10,
        }
    }

    fn fill(price: f64, bar: usize, reason: &str) -> Fill<'_> {
        Fill {
            market_price: price,
            time: NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                + chrono::Duration::days(bar as i64),
            bar,
            reason,
        }
    }

    #[test]
    fn calculate_commission_is_rate_of_value() {
        let commission = calculate_commission(10_000.0, &make_config());
        assert!((commission - 10.0).abs() < 1e-9);
    }

    #[test]
    fn slippage_is_adverse() {
        assert!((apply_slippage(100.0, 0.0005, true) - 100.05).abs() < 1e-9);
        assert!((apply_slippage(100.0, 0.0005, false) - 99.95).abs() < 1e-9);
    }

    #[test]
    fn fraction_uses_risk_when_stop_is_set() {
        let config = ExecutionConfig {
            max_position_size: 1.0,
            risk_per_trade: 0.02,
            stop_loss_pct: 0.05,
            ..Default::default()
        };
        assert!((position_fraction(&config) - 0.4).abs() < 1e-12);

        let no_stop = ExecutionConfig {
            stop_loss_pct: 0.0,
            ..config
        };
        assert!((position_fraction(&no_stop) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn enter_long_sizes_within_budget() {
        let mut portfolio = Portfolio::new(100_000.0);
        let config = make_config();
        match enter(&mut portfolio, Side::Long, fill(100.0, 0, "entry"), &config) {
            EntryResult::Entered {
                quantity,
                fill_price,
                commission,
            } => {
                assert!((fill_price - 100.05).abs() < 1e-9);
                let spent = quantity * fill_price + commission;
                assert!((spent - 25_000.0).abs() < 1e-6);
                assert!((portfolio.cash - 75_000.0).abs() < 1e-6);
                let pos = portfolio.position.as_ref().unwrap();
                assert!((pos.stop_loss - 100.05 * 0.95).abs() < 1e-9);
                assert!((pos.take_profit - 100.05 * 1.10).abs() < 1e-9);
            }
            EntryResult::InsufficientCapital => panic!("expected entry to succeed"),
        }
    }

    #[test]
    fn enter_with_no_cash_fails() {
        let mut portfolio = Portfolio::new(0.0);
        let result = enter(&mut portfolio, Side::Long, fill(100.0, 0, "entry"), &make_config());
        assert_eq!(result, EntryResult::InsufficientCapital);
        assert!(!portfolio.has_position());
    }

    #[test]
    fn short_stop_is_above_fill() {
        let mut portfolio = Portfolio::new(10_000.0);
        enter(&mut portfolio, Side::Short, fill(100.0, 0, "entry"), &make_config());
        let pos = portfolio.position.as_ref().unwrap();
        assert!((pos.fill_price - 99.95).abs() < 1e-9);
        assert!(pos.stop_loss > pos.fill_price);
        assert!(pos.take_profit < pos.fill_price);
    }

    #[test]
    fn long_round_trip_pnl_identity_and_cash() {
        let mut portfolio = Portfolio::new(10_000.0);
        let config = make_config();
        enter(&mut portfolio, Side::Long, fill(100.0, 0, "in"), &config);
        let trade = exit_position(&mut portfolio, fill(110.0, 5, "out"), &config).unwrap();

        let expected = (trade.exit_price - trade.entry_price) * trade.quantity - trade.commission - trade.slippage_cost;
        assert_eq!(trade.pnl, expected);
        assert!((portfolio.cash - (10_000.0 + trade.pnl)).abs() < 1e-6);
        assert_eq!(trade.bars_held, 5);
        assert_eq!(trade.duration_secs, 5 * 86_400);
        assert_eq!(trade.entry_reason, "in");
        assert_eq!(trade.exit_reason, "out");
        assert_eq!(portfolio.trades.len(), 1);
    }

    #[test]
    fn short_round_trip_profits_from_decline() {
        let mut portfolio = Portfolio::new(10_000.0);
        let config = ExecutionConfig {
            max_position_size: 1.0,
            ..Default::default()
        };
        enter(&mut portfolio, Side::Short, fill(100.0, 0, "in"), &config);
        let trade = exit_position(&mut portfolio, fill(90.0, 1, "out"), &config).unwrap();
        assert!((trade.pnl - 1_000.0).abs() < 1e-6);
        assert!((portfolio.cash - 11_000.0).abs() < 1e-6);
    }

    #[test]
    fn exit_without_position_is_none() {
        let mut portfolio = Portfolio::new(10_000.0);
        assert!(exit_position(&mut portfolio, fill(100.0, 0, "out"), &make_config()).is_none());
    }

    #[test]
    fn triggers_check_stop_before_target() {
        let mut portfolio = Portfolio::new(10_000.0);
        let config = make_config();
        assert_eq!(check_triggers(&portfolio, 1.0), None);
        enter(&mut portfolio, Side::Long, fill(100.0, 0, "in"), &config);
        assert_eq!(check_triggers(&portfolio, 90.0), Some("stop loss"));
        assert_eq!(check_triggers(&portfolio, 120.0), Some("take profit"));
        assert_eq!(check_triggers(&portfolio, 101.0), None);
    }
}
