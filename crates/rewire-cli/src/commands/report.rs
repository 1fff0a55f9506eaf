/// Session log report
use anyhow::Result;
use chrono::{Duration, Local, NaiveTime, Utc};
use rewire_storage::{Database, SessionRecord};
use tabled::{Table, Tabled};

use super::helpers::{format_duration_ms, rule, truncate_str};

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "App")]
    package: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Length")]
    length: String,
    #[tabled(rename = "Forbidden")]
    forbidden: String,
    #[tabled(rename = "Units")]
    units: i64,
    #[tabled(rename = "Ended by")]
    reason: String,
}

impl From<&SessionRecord> for SessionRow {
    fn from(record: &SessionRecord) -> Self {
        Self {
            package: truncate_str(&record.package, 32),
            started: record
                .started_at
                .with_timezone(&Local)
                .format("%m-%d %H:%M")
                .to_string(),
            length: format_duration_ms(record.duration_seconds().saturating_mul(1000)),
            forbidden: format_duration_ms(record.forbidden_ms),
            units: record.units_charged,
            reason: record.reason.to_string(),
        }
    }
}

pub fn handle_report_command(period: &str) -> Result<()> {
    let end = Utc::now();
    let start = match period {
        "today" => Local::now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_local_timezone(Local)
            .earliest()
            .map_or(end - Duration::days(1), |start| start.with_timezone(&Utc)),
        "week" => end - Duration::days(7),
        _ => {
            println!("Unknown period: {period}. Use 'today' or 'week'");
            return Ok(());
        }
    };

    let db = Database::new(None)?;
    let sessions = db.get_sessions(start, end)?;

    if sessions.is_empty() {
        println!("No sessions recorded for period: {period}");
        return Ok(());
    }

    println!("\nSession Report: {period}");
    println!("{}", rule(28));

    let rows: Vec<SessionRow> = sessions.iter().map(SessionRow::from).collect();
    println!("\n{}", Table::new(rows));

    let forbidden_ms: i64 = sessions.iter().map(|s| s.forbidden_ms).sum();
    let units: i64 = sessions.iter().map(|s| s.units_charged).sum();
    println!(
        "\n{} session(s), {} forbidden, {units} DU charged",
        sessions.len(),
        format_duration_ms(forbidden_ms)
    );

    Ok(())
}
