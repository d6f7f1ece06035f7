//! Scripted HTTP endpoint built on wiremock.

use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

/// Path every test endpoint listens on.
pub const ENDPOINT_PATH: &str = "/datastream";

/// A POST endpoint whose responses are scripted per request.
pub struct MockEndpoint {
    server: MockServer,
}

impl MockEndpoint {
    /// Starts a new endpoint on a random port.
    pub async fn start() -> Self {
        Self { server: MockServer::start().await }
    }

    /// Full URL of the endpoint.
    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), ENDPOINT_PATH)
    }

    /// Creates a response sequence builder.
    pub fn sequence(&self) -> ResponseSequence<'_> {
        ResponseSequence { server: &self.server, steps: Vec::new(), fallback: None }
    }

    /// Answers every request with `status`.
    pub async fn always(&self, status: u16) {
        self.sequence().then_always(status).build().await;
    }

    /// Requests received so far, in arrival order.
    pub async fn received_requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(RecordedRequest::from)
            .collect()
    }

    /// Bodies received so far, in arrival order.
    pub async fn received_bodies(&self) -> Vec<Bytes> {
        self.received_requests().await.into_iter().map(|request| request.body).collect()
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let requests = self.received_requests().await;
        assert_eq!(
            requests.len(),
            expected,
            "Expected {} requests, received {}",
            expected,
            requests.len()
        );
    }
}

/// A request as seen by the endpoint.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw body bytes.
    pub body: Bytes,
}

impl From<Request> for RecordedRequest {
    fn from(request: Request) -> Self {
        Self {
            method: request.method.to_string(),
            path: request.url.path().to_string(),
            headers: request.headers,
            body: Bytes::from(request.body),
        }
    }
}

struct Step {
    status: u16,
    delay: Option<Duration>,
}

/// Builder for per-request responses. Each step answers exactly one request,
/// in order; the fallback answers everything after.
pub struct ResponseSequence<'a> {
    server: &'a MockServer,
    steps: Vec<Step>,
    fallback: Option<u16>,
}

impl ResponseSequence<'_> {
    /// Answers the next request with `status`.
    pub fn respond(mut self, status: u16) -> Self {
        self.steps.push(Step { status, delay: None });
        self
    }

    /// Answers the next request with `status` after `delay`.
    pub fn respond_after(mut self, status: u16, delay: Duration) -> Self {
        self.steps.push(Step { status, delay: Some(delay) });
        self
    }

    /// Answers every request after the scripted steps with `status`.
    pub fn then_always(mut self, status: u16) -> Self {
        self.fallback = Some(status);
        self
    }

    /// Mounts the sequence.
    pub async fn build(self) {
        for step in self.steps {
            let mut response = ResponseTemplate::new(step.status);
            if let Some(delay) = step.delay {
                response = response.set_delay(delay);
            }
            Mock::given(method("POST"))
                .and(path(ENDPOINT_PATH))
                .respond_with(response)
                .up_to_n_times(1)
                .mount(self.server)
                .await;
        }

        if let Some(status) = self.fallback {
            Mock::given(method("POST"))
                .and(path(ENDPOINT_PATH))
                .respond_with(ResponseTemplate::new(status))
                .mount(self.server)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn endpoint_url_points_at_datastream() {
        let endpoint = MockEndpoint::start().await;
        assert!(endpoint.url().starts_with("http://"));
        assert!(endpoint.url().ends_with(ENDPOINT_PATH));
    }

    #[tokio::test]
    async fn sequence_steps_answer_one_request_each() {
        let endpoint = MockEndpoint::start().await;
        endpoint.sequence().respond(503).then_always(200).build().await;

        let statuses = post_three_times(&endpoint).await;
        assert_eq!(statuses, vec![503, 200, 200]);
        endpoint.assert_request_count(3).await;
    }

    /// Posts three times over a raw socket and returns the status codes.
    async fn post_three_times(endpoint: &MockEndpoint) -> Vec<u16> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let url = endpoint.server.uri();
        let authority = url.trim_start_matches("http://").to_string();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let mut stream = tokio::net::TcpStream::connect(&authority).await.unwrap();
            let request = format!(
                "POST {ENDPOINT_PATH} HTTP/1.1\r\nHost: {authority}\r\n\
                 Content-Length: 2\r\nConnection: close\r\n\r\n{{}}"
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            let status = response.split_whitespace().nth(1).unwrap().parse().unwrap();
            statuses.push(status);
        }
        statuses
    }
}
