use crate::types::{ErrorKind, RequestResult};
use reqwest::{Client, Method};
use std::time::Instant;

/// Issue one request and time it end to end, body included. Never fails:
/// transport problems come back as a `RequestResult` carrying an `ErrorKind`.
pub async fn execute_request(
    client: &Client,
    url: &str,
    method: &Method,
    headers: &[(String, String)],
    body: Option<&str>,
    capture_body: bool,
) -> RequestResult {
    let start = Instant::now();

    let mut request = client.request(method.clone(), url);

    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }

    if let Some(body_str) = body {
        request = request.body(body_str.to_string());
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status().as_u16();

            let (bytes_received, response_body) = if capture_body {
                match response.text().await {
                    Ok(text) => (text.len() as u64, Some(text)),
                    Err(err) => {
                        let latency_us = start.elapsed().as_micros() as u64;
                        return RequestResult::error(latency_us, ErrorKind::from_reqwest_error(&err));
                    }
                }
            } else {
                // Consume body to allow connection reuse
                match response.bytes().await {
                    Ok(bytes) => (bytes.len() as u64, None),
                    Err(err) => {
                        let latency_us = start.elapsed().as_micros() as u64;
                        return RequestResult::error(latency_us, ErrorKind::from_reqwest_error(&err));
                    }
                }
            };

            let latency_us = start.elapsed().as_micros() as u64;
            RequestResult::success(latency_us, status, bytes_received, response_body)
        }
        Err(err) => {
            let latency_us = start.elapsed().as_micros() as u64;
            let kind = ErrorKind::from_reqwest_error(&err);
            RequestResult::error(latency_us, kind)
        }
    }
}
