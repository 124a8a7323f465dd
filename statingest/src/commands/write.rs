//! Submit one point to a running server

use anyhow::{Context, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use statingest_types::{Measurement, Resolution};

#[derive(Debug, clap::Parser)]
#[clap(visible_alias = "w")]
pub(crate) struct Config {
    /// The host URL of the running statingest server
    #[clap(
        long = "host",
        env = "STATINGEST_HOST_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    host_url: reqwest::Url,

    /// Resolution to submit the point at
    #[clap(short = 'r', long = "resolution", default_value = "minute")]
    resolution: Resolution,

    /// Name of the series
    #[clap(short = 's', long = "series")]
    series: String,

    /// RFC 3339 timestamp of the point, now if omitted
    #[clap(short = 't', long = "timestamp")]
    timestamp: Option<DateTime<Utc>>,

    /// A measurement as `id=value`, may be repeated
    #[clap(
        short = 'm',
        long = "measurement",
        required = true,
        value_parser = parse_measurement
    )]
    measurements: Vec<Measurement>,
}

fn parse_measurement(s: &str) -> Result<Measurement, String> {
    let (id, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=value, got '{s}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{id}': {e}"))?;
    Ok(Measurement::new(id.trim(), value))
}

impl Config {
    fn body(&self) -> Value {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        serde_json::json!({
            "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            "measurements": self.measurements,
        })
    }

    fn url(&self) -> anyhow::Result<reqwest::Url> {
        self.host_url
            .join(&format!(
                "{}/{}",
                self.resolution,
                utf8_percent_encode(&self.series, NON_ALPHANUMERIC)
            ))
            .context("cannot build the write URL")
    }
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let url = config.url()?;
    let response = reqwest::Client::new()
        .post(url.clone())
        .json(&config.body())
        .send()
        .await
        .with_context(|| format!("cannot reach {url}"))?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .with_context(|| format!("unreadable response from {url} ({status})"))?;

    if !status.is_success() {
        bail!(
            "server rejected the point ({status}): {}",
            body["message"].as_str().unwrap_or("no message")
        );
    }

    println!("{} {}", body["status"].as_str().unwrap_or("ok"), url.path());
    if let Some(stale) = body["rollup"]["stale"].as_array() {
        for s in stale {
            println!(
                "stale aggregate {}: {}",
                s["key"]["resolution"].as_str().unwrap_or("?"),
                s["error"].as_str().unwrap_or("?")
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn measurement_flags() {
        assert_eq!(
            parse_measurement("antall=2.5").unwrap(),
            Measurement::new("antall", 2.5)
        );
        assert!(parse_measurement("antall").is_err());
        assert!(parse_measurement("antall=lots").is_err());
    }

    #[test]
    fn builds_url_and_body() {
        let config = Config::parse_from([
            "write",
            "--host",
            "http://localhost:9999",
            "--resolution",
            "hours",
            "--series",
            "test",
            "--timestamp",
            "2024-01-01T10:15:00+01:00",
            "-m",
            "antall=2",
            "-m",
            "vekt=0.5",
        ]);

        assert_eq!(
            config.url().unwrap().as_str(),
            "http://localhost:9999/hour/test"
        );
        assert_eq!(
            config.body(),
            serde_json::json!({
                "timestamp": "2024-01-01T09:15:00Z",
                "measurements": [
                    {"id": "antall", "value": 2.0},
                    {"id": "vekt", "value": 0.5},
                ],
            })
        );
    }

    #[test]
    fn series_is_percent_encoded() {
        let series = "my series?#/ø";
        let config = Config::parse_from([
            "write",
            "--host",
            "http://localhost:9999",
            "--series",
            series,
            "-m",
            "antall=1",
        ]);

        let url = config.url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9999/minute/my%20series%3F%23%2F%C3%B8"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let segment = url.path_segments().unwrap().next_back().unwrap();
        assert_eq!(
            percent_encoding::percent_decode_str(segment)
                .decode_utf8()
                .unwrap(),
            series
        );
    }

    #[test]
    fn requires_a_measurement() {
        assert!(Config::try_parse_from(["write", "--series", "test"]).is_err());
    }
}
