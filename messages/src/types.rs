//! Typed protocol payloads.

use idnet_types::{Height, NodeId, RequestId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// All message types in the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    ConsentRequest,
    ConsentResponse,
    DataRequest,
    DataResponse,
    ErrorResponse,
    RequestClosed,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::ConsentRequest,
        MessageType::ConsentResponse,
        MessageType::DataRequest,
        MessageType::DataResponse,
        MessageType::ErrorResponse,
        MessageType::RequestClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConsentRequest => "consent_request",
            MessageType::ConsentResponse => "consent_response",
            MessageType::DataRequest => "data_request",
            MessageType::DataResponse => "data_response",
            MessageType::ErrorResponse => "error_response",
            MessageType::RequestClosed => "request_closed",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relying party asks an identity provider to obtain the user's consent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentRequest {
    pub request_id: RequestId,
    pub requester: NodeId,
    pub namespace: String,
    pub identifier: String,
    pub request_message: String,
    pub min_ial: f32,
    pub min_aal: f32,
    pub request_timeout_secs: u64,
    /// Ledger height at which the request was created.
    pub expected_height: Option<Height>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsentStatus {
    Accepted,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentResponse {
    pub request_id: RequestId,
    pub responder: NodeId,
    pub status: ConsentStatus,
    pub ial: f32,
    pub aal: f32,
    /// Ledger height of the transaction recording this response.
    pub expected_height: Option<Height>,
}

/// A relying party asks an authentication service for data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataRequest {
    pub request_id: RequestId,
    pub requester: NodeId,
    pub service_id: String,
    pub request_params: String,
    pub expected_height: Option<Height>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataResponse {
    pub request_id: RequestId,
    pub responder: NodeId,
    pub service_id: String,
    pub data: String,
    pub expected_height: Option<Height>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub request_id: RequestId,
    pub reporter: NodeId,
    pub code: u32,
    pub message: String,
}

/// The requester closed the request on the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestClosed {
    pub request_id: RequestId,
    pub closed_by: NodeId,
    pub expected_height: Option<Height>,
}

/// Any message that can travel inside an envelope.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    ConsentRequest(ConsentRequest),
    ConsentResponse(ConsentResponse),
    DataRequest(DataRequest),
    DataResponse(DataResponse),
    ErrorResponse(ErrorResponse),
    RequestClosed(RequestClosed),
}

impl ProtocolMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolMessage::ConsentRequest(_) => MessageType::ConsentRequest,
            ProtocolMessage::ConsentResponse(_) => MessageType::ConsentResponse,
            ProtocolMessage::DataRequest(_) => MessageType::DataRequest,
            ProtocolMessage::DataResponse(_) => MessageType::DataResponse,
            ProtocolMessage::ErrorResponse(_) => MessageType::ErrorResponse,
            ProtocolMessage::RequestClosed(_) => MessageType::RequestClosed,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            ProtocolMessage::ConsentRequest(m) => &m.request_id,
            ProtocolMessage::ConsentResponse(m) => &m.request_id,
            ProtocolMessage::DataRequest(m) => &m.request_id,
            ProtocolMessage::DataResponse(m) => &m.request_id,
            ProtocolMessage::ErrorResponse(m) => &m.request_id,
            ProtocolMessage::RequestClosed(m) => &m.request_id,
        }
    }

    /// The ledger height this message depends on, if any.
    pub fn expected_height(&self) -> Option<Height> {
        match self {
            ProtocolMessage::ConsentRequest(m) => m.expected_height,
            ProtocolMessage::ConsentResponse(m) => m.expected_height,
            ProtocolMessage::DataRequest(m) => m.expected_height,
            ProtocolMessage::DataResponse(m) => m.expected_height,
            ProtocolMessage::ErrorResponse(_) => None,
            ProtocolMessage::RequestClosed(m) => m.expected_height,
        }
    }

    /// Serialize the inner payload to JSON (the envelope records the type).
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            ProtocolMessage::ConsentRequest(m) => serde_json::to_vec(m),
            ProtocolMessage::ConsentResponse(m) => serde_json::to_vec(m),
            ProtocolMessage::DataRequest(m) => serde_json::to_vec(m),
            ProtocolMessage::DataResponse(m) => serde_json::to_vec(m),
            ProtocolMessage::ErrorResponse(m) => serde_json::to_vec(m),
            ProtocolMessage::RequestClosed(m) => serde_json::to_vec(m),
        }
    }
}

macro_rules! impl_from_payload {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for ProtocolMessage {
                fn from(m: $variant) -> Self {
                    ProtocolMessage::$variant(m)
                }
            }
        )*
    };
}

impl_from_payload!(
    ConsentRequest,
    ConsentResponse,
    DataRequest,
    DataResponse,
    ErrorResponse,
    RequestClosed,
);
