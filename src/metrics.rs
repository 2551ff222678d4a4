/// Prometheus text scraping: fetch an exposition body over HTTP and pull out
/// the integer value of a single named series.
use std::future::Future;
use std::time::Duration;

/// Errors that can occur while fetching or parsing a metric.
#[derive(Debug)]
pub enum MetricsError {
    /// The HTTP request failed (connect, timeout, body read).
    Http { source: reqwest::Error },
    /// The endpoint answered with a non-success status.
    Status { status: reqwest::StatusCode },
    /// The matching line did not carry a valid integer.
    Parse {
        key: String,
        value: String,
        source: std::num::ParseIntError,
    },
    /// No line in the body matched the key.
    NotFound { key: String },
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::Http { source } => write!(f, "metrics request failed: {}", source),
            MetricsError::Status { status } => {
                write!(f, "metrics endpoint returned {}", status)
            }
            MetricsError::Parse { key, value, source } => {
                write!(f, "invalid value {:?} for datapoint {:?}: {}", value, key, source)
            }
            MetricsError::NotFound { key } => {
                write!(f, "could not find datapoint {:?} in metrics data", key)
            }
        }
    }
}

impl std::error::Error for MetricsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetricsError::Http { source } => Some(source),
            MetricsError::Parse { source, .. } => Some(source),
            MetricsError::Status { .. } | MetricsError::NotFound { .. } => None,
        }
    }
}

/// Something that can report the current value of the tracked counter.
pub trait MetricSource: Send {
    fn fetch(&mut self) -> impl Future<Output = Result<i64, MetricsError>> + Send;
}

/// Fetches one metric from a Prometheus exposition endpoint.
pub struct PrometheusClient {
    url: String,
    key: String,
    client: reqwest::Client,
}

impl PrometheusClient {
    /// Build a client for `key` at `url`. Every request is bounded by `timeout`.
    pub fn new(url: &str, key: &str, timeout: Duration) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetricsError::Http { source: e })?;
        Ok(Self {
            url: url.to_string(),
            key: key.to_string(),
            client,
        })
    }

    /// Fetch the body and extract the current value.
    pub async fn get(&self) -> Result<i64, MetricsError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MetricsError::Http { source: e })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(MetricsError::Status { status });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| MetricsError::Http { source: e })?;
        let value = extract_metric(&body, &self.key)?;
        tracing::debug!(metric = %self.key, value, "fetched metric");
        Ok(value)
    }
}

impl MetricSource for PrometheusClient {
    fn fetch(&mut self) -> impl Future<Output = Result<i64, MetricsError>> + Send {
        self.get()
    }
}

/// Return the integer value of `key` in a Prometheus text body.
///
/// Comment lines (`#`) are skipped. A line matches when it starts with the key
/// followed by a space, or by `{` for a labeled series, in which case the value
/// is whatever follows the last `}`. The first matching line wins.
pub fn extract_metric(body: &str, key: &str) -> Result<i64, MetricsError> {
    let key_and_space = format!("{key} ");
    let key_and_labels = format!("{key}{{");

    for line in body.lines() {
        if line.starts_with('#') {
            continue;
        }
        if !line.starts_with(&key_and_space) && !line.starts_with(&key_and_labels) {
            continue;
        }

        let rest = line[key.len()..].trim();
        let value = if rest.starts_with('{') {
            match rest.rfind('}') {
                Some(p) if p < rest.len() - 1 => rest[p + 1..].trim(),
                _ => continue,
            }
        } else {
            rest
        };

        return value.parse::<i64>().map_err(|e| MetricsError::Parse {
            key: key.to_string(),
            value: value.to_string(),
            source: e,
        });
    }

    Err(MetricsError::NotFound {
        key: key.to_string(),
    })
}
