/// Budget figures and manual reset, read straight from the store
use anyhow::Result;
use rewire_core::{config::EngineConfig, BudgetEngine, SystemClock};
use rewire_storage::{BudgetState, Database};
use std::sync::Arc;

use super::helpers::{format_duration_ms, format_units, rule};

fn open_engine() -> Result<BudgetEngine> {
    let db = Database::new(None)?;
    let config = EngineConfig::load_default()?;
    Ok(BudgetEngine::new(
        Arc::new(db),
        Arc::new(SystemClock),
        config.budget,
    ))
}

pub fn handle_budget_command() -> Result<()> {
    let engine = open_engine()?;
    let state = engine.snapshot()?;
    let multiplier = engine.current_multiplier()?;
    let wait_seconds = engine.wait_seconds()?;

    println!("Attention Budget");
    println!("{}", rule(40));
    print_state(&state);
    println!("Next entry:       {multiplier:.2}x, {wait_seconds}s wait");
    if !engine.has_budget()? {
        println!("\nBudget exhausted. Every forbidden second deepens the debt.");
    }
    Ok(())
}

pub fn handle_reset_command() -> Result<()> {
    let engine = open_engine()?;
    let state = engine.reset_all_stats()?;
    println!("Budget reset.");
    println!("{}", rule(40));
    print_state(&state);
    Ok(())
}

fn print_state(state: &BudgetState) {
    println!("Remaining:        {}", format_units(state.remaining_units));
    println!("Sessions today:   {}", state.daily_session_count);
    println!(
        "Forbidden today:  {}",
        format_duration_ms(state.daily_forbidden_time_ms)
    );
    println!("Compulsion index: {:.2}", state.compulsion_index);
    println!("Cost factor:      {:.2}", state.cost_factor_base);
    if let Some(at) = state.last_forbidden_at {
        println!(
            "Last forbidden:   {}",
            at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }
}
