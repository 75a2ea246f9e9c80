use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    pub instrument: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub turnover: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    StrongBuy,
    Buy,
    Hold,
    Sell,
    StrongSell,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::StrongBuy => "strong_buy",
            SignalAction::Buy => "buy",
            SignalAction::Hold => "hold",
            SignalAction::Sell => "sell",
            SignalAction::StrongSell => "strong_sell",
        }
    }

    pub fn is_bullish_or_neutral(&self) -> bool {
        matches!(
            self,
            SignalAction::StrongBuy | SignalAction::Buy | SignalAction::Hold
        )
    }

    pub fn is_bearish(&self) -> bool {
        matches!(self, SignalAction::Sell | SignalAction::StrongSell)
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strong_buy" => Ok(SignalAction::StrongBuy),
            "buy" => Ok(SignalAction::Buy),
            "hold" | "neutral" => Ok(SignalAction::Hold),
            "sell" => Ok(SignalAction::Sell),
            "strong_sell" => Ok(SignalAction::StrongSell),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

/// Emotional cycle label reported by the signal provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Despair,
    Hesitation,
    Frenzy,
    #[default]
    Unknown,
}

impl MarketPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketPhase::Despair => "despair",
            MarketPhase::Hesitation => "hesitation",
            MarketPhase::Frenzy => "frenzy",
            MarketPhase::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Uptrend,
    Downtrend,
    Sideways,
    #[default]
    Unknown,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Uptrend => "uptrend",
            TrendDirection::Downtrend => "downtrend",
            TrendDirection::Sideways => "sideways",
            TrendDirection::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TrendInfo {
    pub direction: TrendDirection,
    pub confirmed: bool,
    /// Normalized slope of the trend reference (fractional change per period).
    #[serde(default)]
    pub slope: f64,
    /// Number of consecutive periods the trend has held.
    #[serde(default)]
    pub duration_periods: usize,
}

impl TrendInfo {
    pub fn is_confirmed_uptrend(&self) -> bool {
        self.confirmed && self.direction == TrendDirection::Uptrend
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub action: SignalAction,
    pub score: f64,
    pub confidence: f64,
    pub phase: MarketPhase,
    pub trend: TrendInfo,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    Bull,
    Range,
    Bear,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Bull => "bull",
            MarketRegime::Range => "range",
            MarketRegime::Bear => "bear",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "buy",
            TradeDirection::Sell => "sell",
        }
    }
}

/// A single executed trade. Appended to the trade log and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub date: DateTime<Utc>,
    pub instrument: String,
    pub direction: TradeDirection,
    pub price: f64,
    pub shares: i64,
    pub gross_amount: f64,
    pub commission: f64,
    pub reason: String,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

impl Fill {
    /// Signed effect of the fill on the cash balance.
    pub fn cash_delta(&self) -> f64 {
        match self.direction {
            TradeDirection::Buy => -(self.gross_amount + self.commission),
            TradeDirection::Sell => self.gross_amount - self.commission,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    StopLoss,
    TrailingStop,
    PartialStop,
    PartialStopFinal,
    TakeProfit,
    TimeStop,
    TrendBreak,
    Advisory,
    CircuitBreaker,
    Rebalance,
    EndOfBacktest,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::StopLoss => "stop_loss",
            ExitKind::TrailingStop => "trailing_stop",
            ExitKind::PartialStop => "partial_stop",
            ExitKind::PartialStopFinal => "partial_stop_final",
            ExitKind::TakeProfit => "take_profit",
            ExitKind::TimeStop => "time_stop",
            ExitKind::TrendBreak => "trend_break",
            ExitKind::Advisory => "advisory",
            ExitKind::CircuitBreaker => "circuit_breaker",
            ExitKind::Rebalance => "rebalance",
            ExitKind::EndOfBacktest => "end_of_backtest",
        }
    }

    /// Exits that count towards the re-entry cooldown.
    pub fn is_stop_loss(&self) -> bool {
        matches!(
            self,
            ExitKind::StopLoss | ExitKind::PartialStopFinal | ExitKind::CircuitBreaker
        )
    }
}

/// An open holding. Owned exclusively by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub trade_id: u64,
    pub instrument: String,
    pub shares: i64,
    pub cost_basis: f64,
    pub entry_date: DateTime<Utc>,
    pub entry_step: usize,
    pub highest_price: f64,
    pub peak_return: f64,
    pub pyramid_adds: u32,
    pub last_add_date: Option<DateTime<Utc>>,
    pub last_add_step: Option<usize>,
    pub partially_exited: bool,
    pub partial_exits: u32,
    pub mark_price: f64,
    pub invested_capital: f64,
    pub commissions_paid: f64,
    pub realized_pnl: f64,
    pub shares_sold: i64,
    pub entry_weight: f64,
    pub entry_score: f64,
    pub entry_phase: MarketPhase,
    pub entry_trend: TrendDirection,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.shares as f64 * self.mark_price
    }

    pub fn cost_value(&self) -> f64 {
        self.shares as f64 * self.cost_basis
    }

    pub fn unrealized_return_at(&self, price: f64) -> f64 {
        if self.cost_basis <= 0.0 {
            return 0.0;
        }
        (price - self.cost_basis) / self.cost_basis
    }

    pub fn unrealized_return(&self) -> f64 {
        self.unrealized_return_at(self.mark_price)
    }

    pub fn held_periods(&self, step: usize) -> usize {
        step.saturating_sub(self.entry_step)
    }
}

/// Metadata carried from the rebalancer onto a new position.
#[derive(Debug, Clone, Default)]
pub struct EntryContext {
    pub weight: f64,
    pub score: f64,
    pub phase: MarketPhase,
    pub trend: TrendDirection,
    pub reason: String,
}

/// A completed round trip, built when a position is fully closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub trade_id: u64,
    pub instrument: String,
    pub entry_date: DateTime<Utc>,
    pub exit_date: DateTime<Utc>,
    pub cost_basis: f64,
    pub exit_price: f64,
    pub shares: i64,
    pub pnl: f64,
    pub return_pct: f64,
    pub holding_periods: usize,
    pub exit_kind: ExitKind,
    pub exit_reason: String,
    pub pyramid_adds: u32,
    pub partial_exits: u32,
    pub peak_return_pct: f64,
    pub entry_weight: f64,
    pub entry_score: f64,
    pub entry_phase: MarketPhase,
    pub entry_trend: TrendDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub date: DateTime<Utc>,
    pub cash: f64,
    pub positions_value: f64,
    pub total_equity: f64,
    pub open_positions: usize,
    pub invested_ratio: f64,
    pub max_position_weight: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Data,
    Admission,
    Sizing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingBar,
    InsufficientHistory,
    SignalUnavailable,
    PositionCap,
    SectorCap,
    CorrelatedHolding,
    Cooldown,
    SectorCooldown,
    TrendGate,
    DespairPhase,
    AlreadyHeld,
    NoOpenPosition,
    BelowMinimumNotional,
    InsufficientCash,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::MissingBar => "missing_bar",
            SkipReason::InsufficientHistory => "insufficient_history",
            SkipReason::SignalUnavailable => "signal_unavailable",
            SkipReason::PositionCap => "position_cap",
            SkipReason::SectorCap => "sector_cap",
            SkipReason::CorrelatedHolding => "correlated_holding",
            SkipReason::Cooldown => "cooldown",
            SkipReason::SectorCooldown => "sector_cooldown",
            SkipReason::TrendGate => "trend_gate",
            SkipReason::DespairPhase => "despair_phase",
            SkipReason::AlreadyHeld => "already_held",
            SkipReason::NoOpenPosition => "no_open_position",
            SkipReason::BelowMinimumNotional => "below_minimum_notional",
            SkipReason::InsufficientCash => "insufficient_cash",
        }
    }

    pub fn category(&self) -> EventCategory {
        match self {
            SkipReason::MissingBar
            | SkipReason::InsufficientHistory
            | SkipReason::SignalUnavailable => EventCategory::Data,
            SkipReason::PositionCap
            | SkipReason::SectorCap
            | SkipReason::CorrelatedHolding
            | SkipReason::Cooldown
            | SkipReason::SectorCooldown
            | SkipReason::TrendGate
            | SkipReason::DespairPhase
            | SkipReason::AlreadyHeld
            | SkipReason::NoOpenPosition => EventCategory::Admission,
            SkipReason::BelowMinimumNotional | SkipReason::InsufficientCash => {
                EventCategory::Sizing
            }
        }
    }
}

/// Non-fatal condition recorded against the step it happened in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub date: DateTime<Utc>,
    pub instrument: String,
    pub category: EventCategory,
    pub reason: SkipReason,
    pub details: Option<String>,
}

impl StepEvent {
    pub fn new(
        date: DateTime<Utc>,
        instrument: &str,
        reason: SkipReason,
        details: Option<String>,
    ) -> Self {
        Self {
            date,
            instrument: instrument.to_string(),
            category: reason.category(),
            reason,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentStats {
    pub trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_return_pct: f64,
    pub avg_holding_periods: f64,
    pub avg_entry_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioPerformance {
    pub total_return_pct: f64,
    pub annual_return_pct: f64,
    pub benchmark_return_pct: f64,
    pub excess_return_pct: f64,
    pub volatility_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub profit_factor: f64,
    pub avg_holding_periods: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
    pub avg_position_count: f64,
    pub avg_invested_ratio: f64,
    pub cash_period_ratio: f64,
    pub multi_position_ratio: f64,
    pub heavy_position_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub instruments: Vec<String>,
    pub initial_cash: f64,
    pub final_equity: f64,
    pub performance: PortfolioPerformance,
    pub equity_curve: Vec<Snapshot>,
    pub trade_log: Vec<Fill>,
    pub closed_trades: Vec<ClosedTrade>,
    pub open_positions: Vec<Position>,
    pub events: Vec<StepEvent>,
    pub per_instrument_stats: BTreeMap<String, InstrumentStats>,
    pub allocation_changes: usize,
    pub created_at: DateTime<Utc>,
}
