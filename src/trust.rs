// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Trust service client for wand registration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{RegistrationError, REGISTRATION_FAILED};

const SUCCESS_FALLBACK: &str = "Wand registered";

/// Body of `POST /wand/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWandRequest {
    #[serde(rename = "primaryUUID")]
    pub primary_uuid: String,
    pub pub_key: String,
    pub wand_name: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RegisterWandRequest {
    /// The string a signature covers.
    pub fn signed_message(&self) -> String {
        format!("{}{}{}", self.timestamp, self.primary_uuid, self.pub_key)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterWandResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// The external service that records wand keys as authorized coordinators.
#[async_trait]
pub trait TrustService: Send + Sync {
    /// Register a wand. `Ok` carries the service's message.
    async fn register_wand(&self, request: &RegisterWandRequest)
        -> Result<String, RegistrationError>;
}

/// Turn a trust service HTTP response into a registration outcome.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<String, RegistrationError> {
    let parsed: Option<RegisterWandResponse> = serde_json::from_slice(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|r| r.message.clone())
        .filter(|m| !m.trim().is_empty());

    match parsed {
        Some(response) if status == 200 && response.success => {
            Ok(message.unwrap_or_else(|| SUCCESS_FALLBACK.to_string()))
        }
        _ => Err(RegistrationError::Rejected {
            message: message.unwrap_or_else(|| REGISTRATION_FAILED.to_string()),
        }),
    }
}

/// HTTP implementation.
pub struct HttpTrustService {
    client: Client,
    base_url: String,
}

impl HttpTrustService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("planetnine-ble/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn register_url(&self) -> String {
        format!("{}/wand/register", self.base_url)
    }
}

#[async_trait]
impl TrustService for HttpTrustService {
    async fn register_wand(
        &self,
        request: &RegisterWandRequest,
    ) -> Result<String, RegistrationError> {
        let url = self.register_url();
        debug!("POST {} for wand {}", url, request.pub_key);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| RegistrationError::Unreachable(e.to_string()))?;

        if status != StatusCode::OK {
            debug!("Trust service answered {}", status);
        }
        interpret_response(status.as_u16(), &body)
    }
}
