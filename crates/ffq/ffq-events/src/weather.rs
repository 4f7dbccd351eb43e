#![forbid(unsafe_code)]

use crate::{FixedStr, ItemKind, Sentinel};
use std::str::FromStr;

/// Reserved city name carried by the end-of-stream reading.
pub const SENTINEL_CITY: &str = "##BENCHMARK_END##";

/// One air-quality / weather observation, as read from the CSV feed.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct WeatherReading {
    pub timestamp: FixedStr<33>,
    pub city: FixedStr<64>,
    pub aqi: i32,
    pub weather_icon: FixedStr<32>,
    pub wind_speed: f32,
    pub humidity: i32,
    pub valid: bool,
    pub kind: ItemKind,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("header line")]
    Header,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid {field} '{value}'")]
    InvalidNumber { field: &'static str, value: String },
}

fn number<T: FromStr>(field: &'static str, raw: Option<&str>) -> Result<T, ParseError> {
    let raw = raw.ok_or(ParseError::MissingField(field))?.trim();
    raw.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

impl WeatherReading {
    /// Parses `timestamp,city,aqi,weather_icon,wind_speed,humidity`.
    pub fn parse_csv_line(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        if line.starts_with("timestamp") {
            return Err(ParseError::Header);
        }

        let mut fields = line.split(',');
        let timestamp = fields.next().ok_or(ParseError::MissingField("timestamp"))?;
        let city = fields.next().ok_or(ParseError::MissingField("city"))?;
        let aqi = number("aqi", fields.next())?;
        let weather_icon = fields.next().ok_or(ParseError::MissingField("weather_icon"))?;
        let wind_speed = number("wind_speed", fields.next())?;
        let humidity = number("humidity", fields.next())?;

        Ok(Self {
            timestamp: FixedStr::new(timestamp.trim()),
            city: FixedStr::new(city.trim()),
            aqi,
            weather_icon: FixedStr::new(weather_icon.trim()),
            wind_speed,
            humidity,
            valid: true,
            kind: ItemKind::DATA,
        })
    }

    /// Deterministic synthetic reading for test runs.
    pub fn synthetic(n: u32) -> Self {
        let n_i = n as i32;
        Self {
            timestamp: FixedStr::new(&format!("Item-{n}")),
            city: FixedStr::new(&format!("City-{}", n % 100)),
            aqi: n_i % 500,
            weather_icon: FixedStr::new(&format!("Icon-{}", n % 10)),
            wind_speed: (n % 100) as f32,
            humidity: n_i % 100,
            valid: true,
            kind: ItemKind::DATA,
        }
    }
}

impl Sentinel for WeatherReading {
    fn sentinel() -> Self {
        Self {
            timestamp: FixedStr::new("9999-12-31T23:59:59.999999+00:00"),
            city: FixedStr::new(SENTINEL_CITY),
            aqi: -1,
            weather_icon: FixedStr::new("none"),
            wind_speed: -1.0,
            humidity: -1,
            valid: true,
            kind: ItemKind::SENTINEL,
        }
    }

    #[inline]
    fn is_sentinel(&self) -> bool {
        self.valid && self.kind == ItemKind::SENTINEL && self.city.as_str() == SENTINEL_CITY
    }
}
