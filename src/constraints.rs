use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::config::{BacktestConfig, ConstraintConfig, CooldownConfig, InstrumentProfile};
use crate::ledger::Ledger;
use crate::models::{ExitKind, MarketPhase, MarketRegime, Signal, SkipReason};

#[derive(Debug, Clone, PartialEq)]
pub struct CooldownRecord {
    pub last_stop_step: usize,
    pub last_stop_date: DateTime<Utc>,
    pub consecutive_stops: u32,
}

/// Stop-loss history per instrument and per sector for one run.
#[derive(Debug, Clone, Default)]
pub struct CooldownBook {
    instruments: HashMap<String, CooldownRecord>,
    sector_stops: HashMap<String, Vec<usize>>,
}

impl CooldownBook {
    pub fn record_exit(
        &mut self,
        instrument: &str,
        sector: Option<&str>,
        kind: ExitKind,
        pnl: f64,
        step: usize,
        date: DateTime<Utc>,
    ) {
        if kind.is_stop_loss() {
            let record = self
                .instruments
                .entry(instrument.to_string())
                .or_insert(CooldownRecord {
                    last_stop_step: step,
                    last_stop_date: date,
                    consecutive_stops: 0,
                });
            record.last_stop_step = step;
            record.last_stop_date = date;
            record.consecutive_stops += 1;
            if let Some(sector) = sector {
                self.sector_stops
                    .entry(sector.to_string())
                    .or_default()
                    .push(step);
            }
        } else if pnl > 0.0 {
            if let Some(record) = self.instruments.get_mut(instrument) {
                record.consecutive_stops = 0;
            }
        }
    }

    pub fn record(&self, instrument: &str) -> Option<&CooldownRecord> {
        self.instruments.get(instrument)
    }

    /// First step at which the instrument may be entered again.
    pub fn instrument_blocked_until(
        &self,
        instrument: &str,
        config: &CooldownConfig,
    ) -> Option<usize> {
        let record = self.instruments.get(instrument)?;
        if record.consecutive_stops == 0 {
            return None;
        }
        Some(record.last_stop_step + config.periods_for(record.consecutive_stops))
    }

    /// First step at which the sector opens again, when enough recent stops occurred.
    pub fn sector_blocked_until(
        &self,
        sector: &str,
        step: usize,
        config: &CooldownConfig,
    ) -> Option<usize> {
        if config.sector_stop_threshold == 0 {
            return None;
        }
        let stops = self.sector_stops.get(sector)?;
        let recent: Vec<usize> = stops
            .iter()
            .copied()
            .filter(|s| step.saturating_sub(*s) <= config.sector_window_periods)
            .collect();
        if recent.len() < config.sector_stop_threshold {
            return None;
        }
        recent
            .last()
            .map(|last| last + config.sector_cooldown_periods)
    }
}

pub struct EntryRequest<'a> {
    pub instrument: &'a str,
    pub signal: Option<&'a Signal>,
    pub desired_notional: f64,
    pub is_addition: bool,
    pub step: usize,
    pub regime: MarketRegime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub max_notional: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: SkipReason,
    pub details: String,
}

impl Rejection {
    fn new(reason: SkipReason, details: String) -> Self {
        Self { reason, details }
    }
}

/// Portfolio-level admission rules for entries and additions.
pub struct ConstraintManager {
    config: ConstraintConfig,
    profiles: HashMap<String, InstrumentProfile>,
    min_trade_notional: f64,
    cooldowns: CooldownBook,
}

impl ConstraintManager {
    pub fn new(config: &BacktestConfig) -> Self {
        Self {
            config: config.constraints.clone(),
            profiles: config.instruments.clone(),
            min_trade_notional: config.execution.min_trade_notional,
            cooldowns: CooldownBook::default(),
        }
    }

    pub fn cooldowns(&self) -> &CooldownBook {
        &self.cooldowns
    }

    fn sector_of(&self, instrument: &str) -> Option<&str> {
        self.profiles
            .get(instrument)
            .and_then(|profile| profile.sector.as_deref())
    }

    pub fn record_exit(
        &mut self,
        instrument: &str,
        kind: ExitKind,
        pnl: f64,
        step: usize,
        date: DateTime<Utc>,
    ) {
        let sector = self
            .profiles
            .get(instrument)
            .and_then(|profile| profile.sector.clone());
        self.cooldowns
            .record_exit(instrument, sector.as_deref(), kind, pnl, step, date);
    }

    pub fn admit(&self, request: &EntryRequest, ledger: &Ledger) -> Result<Admission, Rejection> {
        let instrument = request.instrument;
        let cooldown = &self.config.cooldown;

        if let Some(until) = self.cooldowns.instrument_blocked_until(instrument, cooldown) {
            if request.step < until {
                return Err(Rejection::new(
                    SkipReason::Cooldown,
                    format!("blocked until step {} after stop-loss", until),
                ));
            }
        }

        let sector = self.sector_of(instrument);
        if let Some(sector) = sector {
            if let Some(until) = self
                .cooldowns
                .sector_blocked_until(sector, request.step, cooldown)
            {
                if request.step < until {
                    return Err(Rejection::new(
                        SkipReason::SectorCooldown,
                        format!("sector {} blocked until step {}", sector, until),
                    ));
                }
            }
        }

        if let Some(profile) = self.profiles.get(instrument) {
            if profile.trend_only {
                self.check_trend_gate(request.signal)?;
            }
            if profile.no_despair_buy
                && request.signal.map(|s| s.phase) == Some(MarketPhase::Despair)
            {
                return Err(Rejection::new(
                    SkipReason::DespairPhase,
                    "entries disabled during despair phase".to_string(),
                ));
            }
        }

        if !request.is_addition {
            let limit = self.config.max_positions.for_regime(request.regime);
            let held = ledger.positions().len();
            if held >= limit {
                return Err(Rejection::new(
                    SkipReason::PositionCap,
                    format!(
                        "{} positions held, {} regime allows {}",
                        held,
                        request.regime.as_str(),
                        limit
                    ),
                ));
            }

            if let Some(other) = self.correlated_holding(instrument, ledger) {
                return Err(Rejection::new(
                    SkipReason::CorrelatedHolding,
                    format!("correlated with held {}", other),
                ));
            }
        }

        let mut max_notional = request.desired_notional;
        if let Some(sector) = sector {
            let headroom = self.sector_headroom(sector, ledger);
            if headroom < self.min_trade_notional || headroom <= 0.0 {
                return Err(Rejection::new(
                    SkipReason::SectorCap,
                    format!("sector {} headroom {:.2}", sector, headroom.max(0.0)),
                ));
            }
            max_notional = max_notional.min(headroom);
        }

        Ok(Admission { max_notional })
    }

    /// Remaining notional before `sector` reaches its cap of total equity.
    pub fn sector_headroom(&self, sector: &str, ledger: &Ledger) -> f64 {
        let exposure: f64 = ledger
            .positions()
            .values()
            .filter(|position| self.sector_of(&position.instrument) == Some(sector))
            .map(|position| position.market_value())
            .sum();
        self.config.sector_cap * ledger.total_equity() - exposure
    }

    fn correlated_holding(&self, instrument: &str, ledger: &Ledger) -> Option<String> {
        self.config
            .correlated_groups
            .iter()
            .filter(|group| group.iter().any(|member| member == instrument))
            .flat_map(|group| group.iter())
            .find(|member| member.as_str() != instrument && ledger.is_held(member))
            .cloned()
    }

    fn check_trend_gate(&self, signal: Option<&Signal>) -> Result<(), Rejection> {
        let gate = &self.config.trend_gate;
        let Some(signal) = signal else {
            return Err(Rejection::new(
                SkipReason::TrendGate,
                "no signal for trend-only instrument".to_string(),
            ));
        };
        let trend = &signal.trend;
        if !trend.is_confirmed_uptrend() {
            return Err(Rejection::new(
                SkipReason::TrendGate,
                format!(
                    "trend {} (confirmed: {})",
                    trend.direction.as_str(),
                    trend.confirmed
                ),
            ));
        }
        if trend.slope < gate.min_slope || trend.duration_periods < gate.min_duration_periods {
            return Err(Rejection::new(
                SkipReason::TrendGate,
                format!(
                    "slope {:.5} / duration {} below gate",
                    trend.slope, trend.duration_periods
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::models::{EntryContext, SignalAction, TrendDirection, TrendInfo};
    use chrono::{Duration, TimeZone};

    fn create_date(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    fn execution() -> ExecutionConfig {
        ExecutionConfig {
            slippage_rate: 0.0,
            commission_rate: 0.0,
            min_commission: 0.0,
            lot_size: 100,
            min_trade_notional: 1_000.0,
        }
    }

    fn config() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.execution = execution();
        config.constraints.sector_cap = 0.30;
        config.constraints.cooldown = CooldownConfig {
            base_periods: 3,
            growth_factor: 2.0,
            max_periods: 20,
            sector_stop_threshold: 2,
            sector_window_periods: 10,
            sector_cooldown_periods: 5,
        };
        config.constraints.correlated_groups = vec![vec!["AAA".to_string(), "CCC".to_string()]];
        for (id, sector) in [("AAA", "tech"), ("BBB", "tech"), ("CCC", "energy")] {
            config.instruments.insert(
                id.to_string(),
                InstrumentProfile {
                    sector: Some(sector.to_string()),
                    ..Default::default()
                },
            );
        }
        config
    }

    fn request(instrument: &str, step: usize) -> EntryRequest<'_> {
        EntryRequest {
            instrument,
            signal: None,
            desired_notional: 50_000.0,
            is_addition: false,
            step,
            regime: MarketRegime::Bull,
        }
    }

    fn open(ledger: &mut Ledger, id: &str, notional: f64) {
        ledger
            .open(id, create_date(0), 0, 10.0, notional, &EntryContext::default())
            .unwrap();
    }

    #[test]
    fn cooldown_blocks_until_period_elapses() {
        let config = config();
        let mut manager = ConstraintManager::new(&config);
        let ledger = Ledger::new(100_000.0, execution());
        manager.record_exit("CCC", ExitKind::StopLoss, -500.0, 10, create_date(10));

        for step in 10..13 {
            let err = manager.admit(&request("CCC", step), &ledger).unwrap_err();
            assert_eq!(err.reason, SkipReason::Cooldown);
        }
        assert!(manager.admit(&request("CCC", 13), &ledger).is_ok());
    }

    #[test]
    fn consecutive_stops_lengthen_cooldown_and_profit_resets() {
        let config = config();
        let mut manager = ConstraintManager::new(&config);
        manager.record_exit("CCC", ExitKind::StopLoss, -1.0, 0, create_date(0));
        manager.record_exit("CCC", ExitKind::PartialStopFinal, -1.0, 5, create_date(5));
        let cooldown = &config.constraints.cooldown;
        assert_eq!(
            manager
                .cooldowns()
                .instrument_blocked_until("CCC", cooldown),
            Some(11)
        );
        manager.record_exit("CCC", ExitKind::TakeProfit, 250.0, 20, create_date(20));
        assert_eq!(
            manager
                .cooldowns()
                .instrument_blocked_until("CCC", cooldown),
            None
        );
    }

    #[test]
    fn repeated_sector_stops_block_the_sector() {
        let config = config();
        let mut manager = ConstraintManager::new(&config);
        let ledger = Ledger::new(100_000.0, execution());
        manager.record_exit("AAA", ExitKind::StopLoss, -1.0, 2, create_date(2));
        assert!(manager.admit(&request("BBB", 3), &ledger).is_ok());
        manager.record_exit("AAA", ExitKind::CircuitBreaker, -1.0, 4, create_date(4));

        let err = manager.admit(&request("BBB", 6), &ledger).unwrap_err();
        assert_eq!(err.reason, SkipReason::SectorCooldown);
        assert!(manager.admit(&request("BBB", 9), &ledger).is_ok());
    }

    #[test]
    fn sector_cap_trims_to_headroom_then_rejects() {
        let config = config();
        let manager = ConstraintManager::new(&config);
        let mut ledger = Ledger::new(100_000.0, execution());

        let admission = manager.admit(&request("AAA", 0), &ledger).unwrap();
        assert!((admission.max_notional - 30_000.0).abs() < 1e-9);

        open(&mut ledger, "AAA", admission.max_notional);
        let err = manager.admit(&request("BBB", 0), &ledger).unwrap_err();
        assert_eq!(err.reason, SkipReason::SectorCap);
    }

    #[test]
    fn position_cap_and_correlation_only_gate_new_entries() {
        let mut config = config();
        config.constraints.max_positions.bull = 1;
        let manager = ConstraintManager::new(&config);
        let mut ledger = Ledger::new(100_000.0, execution());
        open(&mut ledger, "AAA", 10_000.0);

        let err = manager.admit(&request("CCC", 0), &ledger).unwrap_err();
        assert_eq!(err.reason, SkipReason::PositionCap);

        let mut relaxed = config.clone();
        relaxed.constraints.max_positions.bull = 3;
        let relaxed_manager = ConstraintManager::new(&relaxed);
        let err = relaxed_manager
            .admit(&request("CCC", 0), &ledger)
            .unwrap_err();
        assert_eq!(err.reason, SkipReason::CorrelatedHolding);

        let mut addition = request("AAA", 0);
        addition.is_addition = true;
        assert!(manager.admit(&addition, &ledger).is_ok());
    }

    #[test]
    fn trend_only_instruments_need_confirmed_uptrend() {
        let mut config = config();
        config.instruments.insert(
            "GOLD".to_string(),
            InstrumentProfile {
                trend_only: true,
                ..Default::default()
            },
        );
        let manager = ConstraintManager::new(&config);
        let ledger = Ledger::new(100_000.0, execution());

        let weak = Signal {
            action: SignalAction::Buy,
            score: 2.0,
            confidence: 0.5,
            phase: MarketPhase::Unknown,
            trend: TrendInfo {
                direction: TrendDirection::Uptrend,
                confirmed: true,
                slope: 0.001,
                duration_periods: 2,
            },
        };
        let mut req = request("GOLD", 0);
        req.signal = Some(&weak);
        assert_eq!(
            manager.admit(&req, &ledger).unwrap_err().reason,
            SkipReason::TrendGate
        );

        let strong = Signal {
            trend: TrendInfo {
                duration_periods: 8,
                ..weak.trend.clone()
            },
            ..weak.clone()
        };
        req.signal = Some(&strong);
        assert!(manager.admit(&req, &ledger).is_ok());
    }
}
