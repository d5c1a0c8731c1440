use bikeprep::{
    fetch_weather_readings, init_logging, log_job_finish, log_job_start, logging_config_from_env,
    persist_weather_readings, pipeline_config_from_env, reference_in_timezone, run_fusion,
    run_training_split, window_from, LocalObjectStore, ReqwestBlockingClient,
    SqliteReadingStore,
};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use tracing::info;

const JOB: &str = "fusion_job";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = logging_config_from_env();
    init_logging(&log_config)?;

    let config = pipeline_config_from_env()?;
    let reference = match reference_override()? {
        Some(reference) => reference,
        None => reference_in_timezone(Utc::now(), config.tz()?),
    };
    let window = window_from(reference, config.lookback_days, config.offset_days);
    log_job_start(JOB, &log_config, &window);

    let store = SqliteReadingStore::open(&config.store_path, config.page_size)?
        .with_entity_field(config.entity_field.as_str());
    let objects = LocalObjectStore::new(&config.storage_root);
    let http = ReqwestBlockingClient::new(config.http_timeout_ms)?;

    let weather = fetch_weather_readings(&http, &config.weather_query(), &window)?;
    let weather_key = persist_weather_readings(&config, &objects, &window, &weather)?;
    info!(
        component = JOB,
        event = "weather.persisted",
        key = %weather_key,
        rows = weather.len()
    );

    let fusion = run_fusion(&config, &window, &store, weather, &objects)?;
    let split = run_training_split(&config, &fusion.partitions, &objects)?;

    info!(
        component = JOB,
        event = "job.report",
        fusion = %serde_json::to_string(&fusion.report)?,
        split = %serde_json::to_string(&split)?
    );
    log_job_finish(
        JOB,
        fusion.report.persisted.len() + split.persisted.len(),
        fusion.report.notices.len() + split.notices.len(),
    );
    Ok(())
}

/// `BIKEPREP_REFERENCE_DATE=YYYY-MM-DD` pins the schedule for backfills.
fn reference_override() -> Result<Option<NaiveDateTime>, Box<dyn std::error::Error>> {
    let Ok(raw) = std::env::var("BIKEPREP_REFERENCE_DATE") else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|err| format!("BIKEPREP_REFERENCE_DATE={trimmed:?} is invalid: {err}"))?;
    Ok(date.and_hms_opt(0, 0, 0))
}
