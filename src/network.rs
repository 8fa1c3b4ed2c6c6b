//! Attribution of browser network traffic to the actions that were open
//! while it happened. A request seen while several actions overlap belongs
//! to all of them, so every lifecycle event is applied to every open
//! action's accumulator.

use std::collections::HashMap;

use url::Url;

use crate::body::{is_textual, truncate};
use crate::event::{
    NetworkRequestRecord, RequestId, RequestOutcome, ResourceCategory,
};
use crate::feed::{RequestSent, ResponseReceived};

#[derive(Clone, Debug)]
struct InFlightRequest {
    method: String,
    url: String,
    resource_type: String,
    start_time: u64,
    request_body: Option<String>,
    status: Option<u16>,
    status_text: String,
    textual: bool,
}

/// Requests one action has seen: those still open and those already closed.
#[derive(Clone, Debug, Default)]
pub struct NetworkAccumulator {
    in_flight: HashMap<RequestId, InFlightRequest>,
    completed: Vec<NetworkRequestRecord>,
}

impl NetworkAccumulator {
    pub fn request_sent(&mut self, event: &RequestSent, body_limit: usize) {
        self.in_flight.insert(
            event.request.clone(),
            InFlightRequest {
                method: event.method.clone(),
                url: event.url.clone(),
                resource_type: event.resource_type.clone(),
                start_time: event.timestamp,
                request_body: event
                    .post_data
                    .as_deref()
                    .map(|body| truncate(body, body_limit)),
                status: None,
                status_text: String::new(),
                textual: false,
            },
        );
    }

    pub fn response_received(&mut self, event: &ResponseReceived) {
        if let Some(request) = self.in_flight.get_mut(&event.request) {
            request.status = Some(event.status);
            request.status_text = event.status_text.clone();
            request.textual =
                event.content_type.as_deref().is_some_and(is_textual);
        }
    }

    /// Closes the request. Returns true when it was open here and its body
    /// is worth fetching.
    pub fn request_finished(
        &mut self,
        request: &RequestId,
        timestamp: u64,
    ) -> bool {
        let Some(open) = self.in_flight.remove(request) else {
            return false;
        };
        let textual = open.textual;
        let status = open.status;
        let status_text = open.status_text.clone();
        self.completed.push(record(
            Some(request.clone()),
            open,
            status,
            status_text,
            Some(timestamp),
            RequestOutcome::Completed,
        ));
        textual
    }

    pub fn request_failed(
        &mut self,
        request: &RequestId,
        timestamp: u64,
        error_text: &str,
    ) {
        let Some(open) = self.in_flight.remove(request) else {
            return;
        };
        let status_text = if error_text.is_empty() {
            "failed".to_string()
        } else {
            error_text.to_string()
        };
        self.completed.push(record(
            Some(request.clone()),
            open,
            Some(0),
            status_text,
            Some(timestamp),
            RequestOutcome::Failed,
        ));
    }

    /// Attaches a body to the most recent closed record of `request`.
    pub fn attach_response_body(&mut self, request: &RequestId, body: &str) {
        if let Some(record) = self
            .completed
            .iter_mut()
            .rev()
            .find(|record| record.request_id.as_ref() == Some(request))
        {
            record.response_body = Some(body.to_string());
        }
    }

    pub fn holds(&self, request: &RequestId) -> bool {
        self.in_flight.contains_key(request)
    }

    /// Closed records followed by still-open requests, the latter marked
    /// pending and ordered by start time.
    pub fn into_records(self) -> Vec<NetworkRequestRecord> {
        let NetworkAccumulator {
            in_flight,
            mut completed,
        } = self;
        let mut open = in_flight.into_iter().collect::<Vec<_>>();
        open.sort_by_key(|(_, request)| request.start_time);
        for (request_id, request) in open {
            completed.push(record(
                Some(request_id),
                request,
                None,
                "pending".to_string(),
                None,
                RequestOutcome::Pending,
            ));
        }
        completed
    }
}

fn record(
    request_id: Option<RequestId>,
    request: InFlightRequest,
    status: Option<u16>,
    status_text: String,
    end_time: Option<u64>,
    outcome: RequestOutcome,
) -> NetworkRequestRecord {
    let (host, path) = split_url(&request.url);
    NetworkRequestRecord {
        request_id,
        method: request.method,
        host,
        path,
        status,
        status_text,
        start_time: request.start_time,
        end_time,
        duration: end_time.map(|end| end.saturating_sub(request.start_time)),
        category: ResourceCategory::from_resource_type(&request.resource_type),
        resource_type: request.resource_type,
        request_body: request.request_body,
        response_body: None,
        outcome,
        url: request.url,
    }
}

/// Host and path-with-query of `url`. Unparseable URLs keep the raw string
/// as the path.
pub fn split_url(url: &str) -> (Option<String>, String) {
    match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().map(|host| match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            });
            let path = match parsed.query() {
                Some(query) => format!("{}?{}", parsed.path(), query),
                None => parsed.path().to_string(),
            };
            (host, path)
        }
        Err(_) => (None, url.to_string()),
    }
}

/// Human-readable digest of an action's traffic: a count line, then one line
/// per non-static request.
pub fn summarize(records: &[NetworkRequestRecord]) -> String {
    if records.is_empty() {
        return "no network activity".to_string();
    }
    let static_count = records
        .iter()
        .filter(|record| record.category == ResourceCategory::Static)
        .count();
    let mut lines = vec![format!(
        "{} request{} ({} static)",
        records.len(),
        if records.len() == 1 { "" } else { "s" },
        static_count
    )];
    for record in records
        .iter()
        .filter(|record| record.category != ResourceCategory::Static)
    {
        let outcome = match (record.outcome, record.status) {
            (RequestOutcome::Pending, _) => "pending".to_string(),
            (RequestOutcome::Failed, _) => "failed".to_string(),
            (RequestOutcome::Completed, Some(status)) => status.to_string(),
            (RequestOutcome::Completed, None) => "no status".to_string(),
        };
        match record.duration {
            Some(duration) => lines.push(format!(
                "{} {} -> {} ({} ms)",
                record.method, record.path, outcome, duration
            )),
            None => lines.push(format!(
                "{} {} -> {}",
                record.method, record.path, outcome
            )),
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    fn sent(
        id: &str,
        method: &str,
        url: &str,
        kind: &str,
        at: u64,
    ) -> RequestSent {
        RequestSent {
            request: RequestId(id.to_string()),
            method: method.to_string(),
            url: url.to_string(),
            resource_type: kind.to_string(),
            post_data: None,
            timestamp: at,
        }
    }

    fn received(id: &str, status: u16, content_type: &str) -> ResponseReceived {
        ResponseReceived {
            request: RequestId(id.to_string()),
            status,
            status_text: "OK".to_string(),
            content_type: Some(content_type.to_string()),
        }
    }

    #[test]
    fn test_finished_request_is_recorded() {
        let mut accumulator = NetworkAccumulator::default();
        let id = RequestId("r1".to_string());
        accumulator.request_sent(
            &sent(
                "r1",
                "GET",
                "http://shop.test:8080/api/cart?x=1",
                "XHR",
                100,
            ),
            2000,
        );
        accumulator.response_received(&received("r1", 200, "application/json"));
        assert!(accumulator.request_finished(&id, 145));
        assert!(!accumulator.holds(&id));
        accumulator.attach_response_body(&id, r#"{"items":[]}"#);

        let records = accumulator.into_records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, Some(200));
        assert_eq!(record.duration, Some(45));
        assert_eq!(record.host.as_deref(), Some("shop.test:8080"));
        assert_eq!(record.path, "/api/cart?x=1");
        assert_eq!(record.category, ResourceCategory::Api);
        assert_eq!(record.outcome, RequestOutcome::Completed);
        assert_eq!(record.response_body.as_deref(), Some(r#"{"items":[]}"#));
    }

    #[test]
    fn test_failed_request_has_status_zero() {
        let mut accumulator = NetworkAccumulator::default();
        let id = RequestId("r1".to_string());
        accumulator.request_sent(
            &sent("r1", "POST", "http://shop.test/api/order", "Fetch", 0),
            2000,
        );
        accumulator.request_failed(&id, 30, "net::ERR_CONNECTION_REFUSED");
        let records = accumulator.into_records();
        assert_eq!(records[0].status, Some(0));
        assert_eq!(records[0].status_text, "net::ERR_CONNECTION_REFUSED");
        assert_eq!(records[0].outcome, RequestOutcome::Failed);
    }

    #[test]
    fn test_open_request_is_flushed_as_pending() {
        let mut accumulator = NetworkAccumulator::default();
        accumulator.request_sent(
            &sent("r2", "GET", "http://shop.test/slow", "XHR", 20),
            2000,
        );
        accumulator.request_sent(
            &sent("r1", "GET", "http://shop.test/fast", "XHR", 10),
            2000,
        );
        let records = accumulator.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/fast");
        assert!(
            records
                .iter()
                .all(|record| record.outcome == RequestOutcome::Pending
                    && record.status.is_none()
                    && record.status_text == "pending")
        );
    }

    #[test]
    fn test_reused_request_id_is_not_conflated() {
        let mut accumulator = NetworkAccumulator::default();
        let id = RequestId("r1".to_string());
        accumulator.request_sent(
            &sent("r1", "GET", "http://shop.test/a", "Document", 0),
            2000,
        );
        accumulator.request_finished(&id, 5);
        // A late duplicate finish for a closed request is ignored.
        assert!(!accumulator.request_finished(&id, 9));
        accumulator.request_sent(
            &sent("r1", "GET", "http://shop.test/b", "Document", 10),
            2000,
        );
        let records = accumulator.into_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/a");
        assert_eq!(records[1].path, "/b");
        assert_eq!(records[1].outcome, RequestOutcome::Pending);
    }

    #[test]
    fn test_request_body_is_capped() {
        let mut accumulator = NetworkAccumulator::default();
        let mut event = sent("r1", "POST", "http://shop.test/api", "Fetch", 0);
        event.post_data = Some("a".repeat(5000));
        accumulator.request_sent(&event, 2000);
        let records = accumulator.into_records();
        assert_eq!(
            records[0].request_body.as_ref().map(String::len),
            Some(2000)
        );
    }

    #[test]
    fn test_malformed_url_falls_back_to_raw() {
        assert_eq!(
            split_url("not a url"),
            (None, "not a url".to_string())
        );
    }

    #[test]
    fn test_summary() {
        let mut accumulator = NetworkAccumulator::default();
        accumulator.request_sent(
            &sent("r1", "GET", "http://shop.test/api/cart", "XHR", 0),
            2000,
        );
        accumulator.request_sent(
            &sent("r2", "GET", "http://shop.test/app.js", "Script", 0),
            2000,
        );
        accumulator.request_sent(
            &sent("r3", "POST", "http://shop.test/api/order", "Fetch", 5),
            2000,
        );
        accumulator.request_sent(
            &sent("r4", "GET", "http://shop.test/api/slow", "XHR", 6),
            2000,
        );
        accumulator.response_received(&received("r1", 200, "application/json"));
        accumulator.request_finished(&RequestId("r1".to_string()), 45);
        accumulator.request_finished(&RequestId("r2".to_string()), 50);
        accumulator.request_failed(&RequestId("r3".to_string()), 125, "");

        assert_snapshot!(summarize(&accumulator.into_records()), @r"
        4 requests (1 static)
        GET /api/cart -> 200 (45 ms)
        POST /api/order -> failed (120 ms)
        GET /api/slow -> pending
        ");
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(summarize(&[]), "no network activity");
    }
}
