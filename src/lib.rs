pub mod allocation;
pub mod bar_utils;
pub mod commands;
pub mod config;
pub mod constraints;
pub mod data_context;
pub mod engine;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod param_utils;
pub mod performance;
pub mod risk;
pub mod strategy;
pub mod strategy_utils;
pub mod sweep;
pub mod trading_rules;
