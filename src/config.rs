use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

pub const DEFAULT_COLLECTOR_URL: &str = "http://127.0.0.1:7070/events";
pub const DEFAULT_REQUEST_BODY_LIMIT: usize = 2000;
pub const DEFAULT_RESPONSE_BODY_LIMIT: usize = 5000;
pub const DEFAULT_API_RESPONSE_BODY_LIMIT: usize = 10000;
pub const DEFAULT_DIFF_LINE_CAP: usize = 30;
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);

/// Knobs shared by every capture component. The byte caps only bound the
/// payload size sent to the collector.
#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub collector_url: Url,
    pub session_id: String,
    pub request_body_limit: usize,
    pub response_body_limit: usize,
    pub api_response_body_limit: usize,
    pub diff_line_cap: usize,
    pub snapshot_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            collector_url: Url::parse(DEFAULT_COLLECTOR_URL)
                .expect("default collector url is valid"),
            session_id: format!("session-{}", now_millis()),
            request_body_limit: DEFAULT_REQUEST_BODY_LIMIT,
            response_body_limit: DEFAULT_RESPONSE_BODY_LIMIT,
            api_response_body_limit: DEFAULT_API_RESPONSE_BODY_LIMIT,
            diff_line_cap: DEFAULT_DIFF_LINE_CAP,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
        }
    }
}

/// Milliseconds since the unix epoch, saturating to zero for clocks set
/// before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
