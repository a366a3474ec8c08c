use chrono::Utc;

/// Current wall-clock time as fractional unix seconds, the timestamp
/// representation used throughout the task tables and worker registry.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Current local time as "HH:MM", the granularity of worker schedules.
pub fn local_hhmm() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}

/// Current local weekday, Monday = 0.
pub fn local_weekday() -> u32 {
    use chrono::Datelike;
    chrono::Local::now().weekday().num_days_from_monday()
}
