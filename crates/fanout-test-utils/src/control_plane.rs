//! Scripted control plane

use async_trait::async_trait;
use fanout_core::{ApiRequest, ApiTransport, Method, TransportError};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Reply = Result<String, TransportError>;

/// Control-plane fake keyed by `(method, endpoint)`.
///
/// Each key holds a queue of replies. Replies are popped in order; the last
/// one sticks, so a single scripted status answers every later poll.
/// Unscripted calls get a transport error.
#[derive(Default)]
pub struct MockControlPlane {
    replies: Mutex<HashMap<(String, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: Method, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry((method.to_string(), endpoint.to_string()))
            .or_default()
            .push_back(reply);
    }

    /// Script a JSON reply
    pub fn respond(&self, method: Method, endpoint: &str, body: Value) -> &Self {
        self.push(method, endpoint, Ok(body.to_string()));
        self
    }

    /// Script a raw (possibly non-JSON) reply
    pub fn respond_raw(&self, method: Method, endpoint: &str, body: &str) -> &Self {
        self.push(method, endpoint, Ok(body.to_string()));
        self
    }

    /// Script a transport failure
    pub fn fail(&self, method: Method, endpoint: &str, error: TransportError) -> &Self {
        self.push(method, endpoint, Err(error));
        self
    }

    /// Script a status sequence for `GET /api/v1/instances/{id}`
    pub fn statuses(&self, id: &str, statuses: &[&str], ip: Option<&str>) -> &Self {
        let endpoint = format!("/api/v1/instances/{id}");
        for status in statuses {
            let ip = if *status == "active" { ip } else { None };
            self.respond(Method::Get, &endpoint, instance_body(id, status, ip));
        }
        self
    }

    /// Every request seen, in order
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests matching `method` and `endpoint`
    pub fn count(&self, method: Method, endpoint: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.endpoint == endpoint)
            .count()
    }

    /// Number of launch calls issued
    pub fn launch_count(&self) -> usize {
        self.count(Method::Post, "/api/v1/instance-operations/launch")
    }

    /// Decoded JSON bodies of every launch call, in order
    pub fn launch_payloads(&self) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.endpoint == "/api/v1/instance-operations/launch")
            .filter_map(|r| r.body.as_deref())
            .filter_map(|b| serde_json::from_str(b).ok())
            .collect()
    }
}

#[async_trait]
impl ApiTransport for MockControlPlane {
    async fn send(&self, request: ApiRequest) -> Result<String, TransportError> {
        let key = (request.method.to_string(), request.endpoint.clone());
        self.requests.lock().unwrap().push(request);

        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if queue.len() == 1 => queue.front().unwrap().clone(),
            _ => Err(TransportError::connection(format!(
                "no scripted reply for {} {}",
                key.0, key.1
            ))),
        }
    }
}

/// `{"data": {...instance...}}` in the vendor's shape
pub fn instance_body(id: &str, status: &str, ip: Option<&str>) -> Value {
    json!({
        "data": {
            "id": id,
            "name": format!("test-{id}"),
            "status": status,
            "ip": ip,
            "region": { "name": "us-east-1", "description": "Virginia, USA" },
            "instance_type": { "name": "gpu_1x_a10", "description": "1x A10 (24 GB PCIe)" },
            "ssh_key_names": ["test-key"]
        }
    })
}

/// `{"data": {"instance_ids": [...]}}`
pub fn launch_body(ids: &[&str]) -> Value {
    json!({ "data": { "instance_ids": ids } })
}

/// Vendor error envelope
pub fn error_body(code: &str, message: &str, suggestion: Option<&str>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(suggestion) = suggestion {
        error["suggestion"] = json!(suggestion);
    }
    json!({ "error": error })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, endpoint: &str) -> ApiRequest {
        ApiRequest {
            method,
            endpoint: endpoint.to_string(),
            url: format!("http://mock{endpoint}"),
            api_key: "k".to_string(),
            body: None,
        }
    }

    #[tokio::test]
    async fn test_last_reply_sticks() {
        let plane = MockControlPlane::new();
        plane.statuses("i-1", &["booting", "active"], Some("1.2.3.4"));

        let first = plane.send(request(Method::Get, "/api/v1/instances/i-1")).await.unwrap();
        let second = plane.send(request(Method::Get, "/api/v1/instances/i-1")).await.unwrap();
        let third = plane.send(request(Method::Get, "/api/v1/instances/i-1")).await.unwrap();

        assert!(first.contains("booting"));
        assert!(second.contains("active"));
        assert!(third.contains("active"));
        assert_eq!(plane.count(Method::Get, "/api/v1/instances/i-1"), 3);
    }

    #[tokio::test]
    async fn test_unscripted_call_is_transport_error() {
        let plane = MockControlPlane::new();
        let result = plane.send(request(Method::Get, "/api/v1/instances")).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert_eq!(plane.requests().len(), 1);
    }
}
