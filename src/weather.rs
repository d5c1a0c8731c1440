//! Hourly weather ingestion from an open-meteo style forecast API.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::records::RawReading;
use crate::schedule::{FetchWindow, DATE_FORMAT};

pub const DEFAULT_WEATHER_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_LATITUDE: f64 = 52.52;
pub const DEFAULT_LONGITUDE: f64 = 13.41;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 15_000;

/// Legacy label the hourly time axis is exported under.
pub const WEATHER_TIME_LABEL: &str = "Time";
const TIME_SERIES: &str = "time";

/// API variable -> output column.
pub const HOURLY_VARIABLES: [(&str, &str); 6] = [
    ("temperature_2m", "Temperature"),
    ("relativehumidity_2m", "Humidity"),
    ("windspeed_10m", "Wind_Speed"),
    ("precipitation", "Precipitation"),
    ("visibility", "Visibility"),
    ("snowfall", "Snowfall"),
];

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("invalid weather payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("weather payload has no '{0}' series")]
    MissingSeries(String),
    #[error("series '{series}' has {actual} values but the time axis has {expected}")]
    SeriesLengthMismatch {
        series: String,
        expected: usize,
        actual: usize,
    },
}

pub trait HttpJsonClient {
    fn get_json(&self, url: &str) -> Result<JsonValue, WeatherError>;
}

pub struct ReqwestBlockingClient {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingClient {
    pub fn new(timeout_ms: u64) -> Result<Self, WeatherError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| WeatherError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpJsonClient for ReqwestBlockingClient {
    fn get_json(&self, url: &str) -> Result<JsonValue, WeatherError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| WeatherError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WeatherError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        let bytes = response.bytes().map_err(|err| WeatherError::HttpRequest {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherQuery {
    pub base_url: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for WeatherQuery {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_WEATHER_BASE_URL.to_string(),
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
        }
    }
}

/// Request URL covering the inclusive `[start_date, end_date]` of `window`.
pub fn weather_request_url(query: &WeatherQuery, window: &FetchWindow) -> String {
    let hourly: Vec<&str> = HOURLY_VARIABLES.iter().map(|(api, _)| *api).collect();
    format!(
        "{}?latitude={}&longitude={}&start_date={}&end_date={}&hourly={}",
        query.base_url.trim_end_matches('?'),
        query.latitude,
        query.longitude,
        window.start_date.format(DATE_FORMAT),
        window.end_date.format(DATE_FORMAT),
        hourly.join(",")
    )
}

/// One weather reading per entry of `hourly.time`. Variables absent from the
/// payload are skipped; null samples become empty cells.
pub fn weather_readings_from_hourly(payload: &JsonValue) -> Result<Vec<RawReading>, WeatherError> {
    let hourly = payload
        .get("hourly")
        .ok_or_else(|| WeatherError::MissingSeries("hourly".to_string()))?;
    let times = series(hourly, TIME_SERIES)?
        .ok_or_else(|| WeatherError::MissingSeries(TIME_SERIES.to_string()))?;

    let mut columns: Vec<(&str, &Vec<JsonValue>)> = Vec::new();
    for (api_name, column) in HOURLY_VARIABLES {
        if let Some(values) = series(hourly, api_name)? {
            if values.len() != times.len() {
                return Err(WeatherError::SeriesLengthMismatch {
                    series: api_name.to_string(),
                    expected: times.len(),
                    actual: values.len(),
                });
            }
            columns.push((column, values));
        }
    }

    let readings = times
        .iter()
        .enumerate()
        .map(|(idx, time)| {
            let mut row = BTreeMap::new();
            row.insert(WEATHER_TIME_LABEL.to_string(), cell_text(time));
            for (column, values) in &columns {
                row.insert(column.to_string(), cell_text(&values[idx]));
            }
            RawReading::weather(row)
        })
        .collect();
    Ok(readings)
}

pub fn fetch_weather_readings(
    client: &dyn HttpJsonClient,
    query: &WeatherQuery,
    window: &FetchWindow,
) -> Result<Vec<RawReading>, WeatherError> {
    let url = weather_request_url(query, window);
    let payload = client.get_json(&url)?;
    let readings = weather_readings_from_hourly(&payload)?;
    info!(
        component = "weather",
        event = "weather.fetch.finish",
        window = %window.label(),
        rows = readings.len()
    );
    Ok(readings)
}

fn series<'a>(hourly: &'a JsonValue, name: &str) -> Result<Option<&'a Vec<JsonValue>>, WeatherError> {
    match hourly.get(name) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Array(values)) => Ok(Some(values)),
        Some(_) => Err(WeatherError::MissingSeries(name.to_string())),
    }
}

fn cell_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::cell::RefCell;

    struct MockClient {
        payload: JsonValue,
        requested: RefCell<Vec<String>>,
    }

    impl HttpJsonClient for MockClient {
        fn get_json(&self, url: &str) -> Result<JsonValue, WeatherError> {
            self.requested.borrow_mut().push(url.to_string());
            Ok(self.payload.clone())
        }
    }

    fn window() -> FetchWindow {
        FetchWindow {
            start_date: NaiveDate::from_ymd_opt(2023, 9, 10).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2023, 9, 23).unwrap(),
        }
    }

    #[test]
    fn url_covers_window_and_hourly_variables() {
        let url = weather_request_url(&WeatherQuery::default(), &window());
        assert_eq!(
            url,
            "https://api.open-meteo.com/v1/forecast?latitude=52.52&longitude=13.41\
             &start_date=2023-09-10&end_date=2023-09-23\
             &hourly=temperature_2m,relativehumidity_2m,windspeed_10m,precipitation,visibility,snowfall"
        );
    }

    #[test]
    fn hourly_payload_becomes_renamed_weather_readings() {
        let payload = json!({
            "hourly": {
                "time": ["2023-09-10T08:00", "2023-09-10T09:00"],
                "temperature_2m": [15.0, 16.5],
                "relativehumidity_2m": [80, null],
                "windspeed_10m": [3.2, 4.1]
            }
        });
        let rows = weather_readings_from_hourly(&payload).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity_id, "weather");
        assert_eq!(rows[0].attributes["Time"], "2023-09-10T08:00");
        assert_eq!(rows[0].attributes["Temperature"], "15.0");
        assert_eq!(rows[1].attributes["Humidity"], "");
        assert!(!rows[0].attributes.contains_key("Snowfall"));
    }

    #[test]
    fn mismatched_series_length_is_rejected() {
        let payload = json!({
            "hourly": { "time": ["2023-09-10T08:00"], "temperature_2m": [1.0, 2.0] }
        });
        let err = weather_readings_from_hourly(&payload).unwrap_err();
        assert!(matches!(
            err,
            WeatherError::SeriesLengthMismatch { expected: 1, actual: 2, .. }
        ));
    }

    #[test]
    fn missing_time_axis_is_rejected() {
        let err = weather_readings_from_hourly(&json!({ "hourly": {} })).unwrap_err();
        assert!(matches!(err, WeatherError::MissingSeries(name) if name == "time"));
    }

    #[test]
    fn fetch_requests_window_url_once() {
        let client = MockClient {
            payload: json!({ "hourly": { "time": ["2023-09-10T08:00"] } }),
            requested: RefCell::new(Vec::new()),
        };
        let rows = fetch_weather_readings(&client, &WeatherQuery::default(), &window()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(client.requested.borrow().len(), 1);
        assert!(client.requested.borrow()[0].contains("start_date=2023-09-10"));
    }
}
