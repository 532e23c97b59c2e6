//! Position tracking and closed trade records.

use crate::domain::pine::Side;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// The single open position of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    /// Units held, always positive; direction comes from `side`.
    pub quantity: f64,
    /// Bar close at entry, before slippage.
    pub entry_price: f64,
    /// Execution price after slippage.
    pub fill_price: f64,
    pub entry_time: NaiveDateTime,
    pub entry_bar: usize,
    pub entry_commission: f64,
    /// Stop price; 0 disables.
    pub stop_loss: f64,
    /// Target price; 0 disables.
    pub take_profit: f64,
    pub entry_reason: String,
}

impl Position {
    pub fn is_long(&self) -> bool {
        self.side == Side::Long
    }

    /// Value of the position at `price`.
    ///
    /// A short escrows its entry notional, so it is worth that notional plus
    /// the open profit.
    pub fn market_value(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => self.quantity * price,
            Side::Short => self.quantity * (2.0 * self.fill_price - price),
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.side.sign() * self.quantity * (price - self.fill_price)
    }

    pub fn should_stop_loss(&self, price: f64) -> bool {
        if self.stop_loss == 0.0 {
            return false;
        }
        if self.is_long() {
            price <= self.stop_loss
        } else {
            price >= self.stop_loss
        }
    }

    pub fn should_take_profit(&self, price: f64) -> bool {
        if self.take_profit == 0.0 {
            return false;
        }
        if self.is_long() {
            price >= self.take_profit
        } else {
            price <= self.take_profit
        }
    }
}

/// A closed round trip. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    /// Bar close at entry; fills differ by the slippage recorded in `slippage_cost`.
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    /// Entry plus exit commission.
    pub commission: f64,
    pub slippage_cost: f64,
    /// `(exit - entry) * quantity * sign - commission - slippage_cost`.
    pub pnl: f64,
    /// `pnl` as a percentage of the entry notional.
    pub pnl_pct: f64,
    pub bars_held: usize,
    pub duration_secs: i64,
    pub entry_reason: String,
    pub exit_reason: String,
}

impl Trade {
    pub fn holding_duration(&self) -> chrono::Duration {
        self.exit_time - self.entry_time
    }
}
