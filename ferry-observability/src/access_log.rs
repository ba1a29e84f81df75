use serde::{Deserialize, Serialize};

/// Structured access log entry, emitted as one JSON line per request.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duration_ms: f64,
    pub site: Option<String>,
}

/// An RFC 3339 timestamp for the current instant.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl AccessLogEntry {
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(line) => tracing::info!(target: "access_log", "{}", line),
            Err(e) => tracing::warn!(error = %e, "failed to serialize access log entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_json() {
        let entry = AccessLogEntry {
            timestamp: "2024-01-01T00:00:00Z".into(),
            client_ip: "10.1.2.3".into(),
            method: "GET".into(),
            uri: "/index.html".into(),
            status: 200,
            bytes_in: 120,
            bytes_out: 4096,
            duration_ms: 1.5,
            site: Some("example".into()),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["uri"], "/index.html");
        assert_eq!(parsed["site"], "example");
    }
}
