//! Outbound HTTP calls made by the sending side of a transfer.
//!
//! Three calls, three timeout tiers on three separate `reqwest::Client`s:
//! fetch a peer's `/info`, negotiate `/send-request`, and stream a file to
//! `/send`. A short negotiation timeout and a long streaming timeout on
//! the same client would mean one of the two is always wrong.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::ClientError;
use crate::types::{DeviceInfo, TransferOffer};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const SEND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Deserialize)]
struct SendRequestAccepted {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// The outbound half of the HTTP plane, used by whichever side of a
/// transfer is pushing bytes.
pub struct TransferClient {
    send_request_client: Client,
    send_client: Client,
    info_client: Client,
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self {
            send_request_client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(SEND_REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client configuration is always valid"),
            send_client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(SEND_TIMEOUT)
                .build()
                .expect("reqwest client configuration is always valid"),
            info_client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client configuration is always valid"),
        }
    }

    fn base_url(protocol: &str, ip: &str, port: u16) -> String {
        format!("{protocol}://{ip}:{port}/api/localsend/v1")
    }

    pub async fn fetch_info(
        &self,
        protocol: &str,
        ip: &str,
        port: u16,
    ) -> Result<DeviceInfo, ClientError> {
        let url = format!("{}/info", Self::base_url(protocol, ip, port));
        let info = self
            .info_client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<DeviceInfo>()
            .await?;
        Ok(info)
    }

    /// Negotiates a transfer, returning the sessionId a 200-accepted
    /// response carries. A 403 maps to [`ClientError::Declined`]; any other
    /// non-2xx maps to [`ClientError::UnexpectedStatus`].
    pub async fn send_request(
        &self,
        protocol: &str,
        ip: &str,
        port: u16,
        offer: &TransferOffer,
    ) -> Result<String, ClientError> {
        let url = format!("{}/send-request", Self::base_url(protocol, ip, port));
        let response = self
            .send_request_client
            .post(url)
            .json(offer)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {
                let accepted: SendRequestAccepted = response.json().await?;
                Ok(accepted.session_id)
            }
            StatusCode::FORBIDDEN => Err(ClientError::Declined),
            status => Err(ClientError::UnexpectedStatus(status)),
        }
    }

    /// Streams `body` to the peer's `/send` endpoint for one file within
    /// an already-accepted session.
    pub async fn send_file(
        &self,
        protocol: &str,
        ip: &str,
        port: u16,
        session_id: &str,
        file_id: &str,
        body: Vec<u8>,
    ) -> Result<(), ClientError> {
        let url = format!("{}/send", Self::base_url(protocol, ip, port));
        let response = self
            .send_client
            .post(url)
            .header("X-Session-ID", session_id)
            .header("X-File-ID", file_id)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::UnexpectedStatus(response.status()))
        }
    }
}
