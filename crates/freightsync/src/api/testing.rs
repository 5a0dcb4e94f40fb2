//! Scripted [`RemoteApi`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use super::RemoteApi;
use crate::error::{Error, Result};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Reply {
    /// 2xx with this body.
    Json(Value),
    /// Non-2xx with this status, mapped the way `HttpApi` maps it.
    Status(u16),
    /// The request never reached the server.
    Offline,
}

/// A request the fake received.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
}

/// Answers requests from per-route reply queues.
///
/// When a route has no scripted reply left, GET answers `[]` and every
/// other verb answers `{}`.
#[derive(Debug, Default)]
pub struct FakeApi {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
}

fn route_key(method: &Method, endpoint: &str) -> String {
    format!("{method} {endpoint}")
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for `method endpoint`.
    pub fn reply(&self, method: Method, endpoint: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(route_key(&method, endpoint))
            .or_default()
            .push_back(reply);
        self
    }

    /// Queue the same reply `times` times.
    pub fn reply_times(&self, method: Method, endpoint: &str, reply: Reply, times: usize) -> &Self {
        for _ in 0..times {
            self.reply(method.clone(), endpoint, reply.clone());
        }
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        self.calls.lock().unwrap().push(Call {
            method: method.clone(),
            endpoint: endpoint.to_string(),
            body: body.cloned(),
        });

        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&route_key(&method, endpoint))
            .and_then(VecDeque::pop_front);

        match scripted {
            Some(Reply::Json(value)) => Ok(value),
            Some(Reply::Status(401)) => Err(Error::SessionExpired),
            Some(Reply::Status(403)) => Err(Error::PermissionDenied),
            Some(Reply::Status(404)) => Err(Error::NotFound {
                endpoint: endpoint.to_string(),
            }),
            Some(Reply::Status(status)) => Err(Error::api(status, "scripted failure")),
            Some(Reply::Offline) => Err(Error::Offline),
            None if method == Method::GET => Ok(json!([])),
            None => Ok(json!({})),
        }
    }
}
