//! Schema validation for decoded payloads.
//!
//! A node registers the shapes it accepts. Validation parses the JSON body
//! strictly into the registered type (unknown fields are rejected) and then
//! checks field-level constraints. Any failure is a hard rejection.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::types::{
    ConsentRequest, ConsentResponse, DataRequest, DataResponse, ErrorResponse, MessageType,
    ProtocolMessage, RequestClosed,
};

/// Upper bound for any free-text field.
pub const MAX_TEXT_LEN: usize = 8 * 1024;
/// Upper bound for a data response body.
pub const MAX_DATA_LEN: usize = 1024 * 1024;

const ALLOWED_IAL: [f32; 5] = [1.1, 1.2, 1.3, 2.1, 3.0];
const ALLOWED_AAL: [f32; 4] = [1.0, 2.1, 2.2, 3.0];

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("no schema registered for message type {0}")]
    UnknownType(MessageType),

    #[error("payload does not match {message_type} shape: {reason}")]
    Shape {
        message_type: MessageType,
        reason: String,
    },

    #[error("field `{field}` is required")]
    MissingField { field: &'static str },

    #[error("field `{field}` exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("field `{field}` has invalid value: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Field-level constraints beyond the structural shape.
pub trait Validate {
    fn validate(&self) -> Result<(), SchemaError>;
}

fn require(field: &'static str, value: &str) -> Result<(), SchemaError> {
    if value.is_empty() {
        return Err(SchemaError::MissingField { field });
    }
    Ok(())
}

fn bounded(field: &'static str, value: &str, max: usize) -> Result<(), SchemaError> {
    if value.len() > max {
        return Err(SchemaError::TooLong { field, max });
    }
    Ok(())
}

fn one_of(field: &'static str, value: f32, allowed: &[f32]) -> Result<(), SchemaError> {
    if allowed.iter().any(|a| (a - value).abs() < f32::EPSILON) {
        Ok(())
    } else {
        Err(SchemaError::InvalidValue {
            field,
            reason: format!("{value} not in {allowed:?}"),
        })
    }
}

impl Validate for ConsentRequest {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("requester", self.requester.as_str())?;
        require("namespace", &self.namespace)?;
        require("identifier", &self.identifier)?;
        bounded("request_message", &self.request_message, MAX_TEXT_LEN)?;
        one_of("min_ial", self.min_ial, &ALLOWED_IAL)?;
        one_of("min_aal", self.min_aal, &ALLOWED_AAL)?;
        if self.request_timeout_secs == 0 {
            return Err(SchemaError::InvalidValue {
                field: "request_timeout_secs",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ConsentResponse {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("responder", self.responder.as_str())?;
        one_of("ial", self.ial, &ALLOWED_IAL)?;
        one_of("aal", self.aal, &ALLOWED_AAL)
    }
}

impl Validate for DataRequest {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("requester", self.requester.as_str())?;
        require("service_id", &self.service_id)?;
        bounded("request_params", &self.request_params, MAX_TEXT_LEN)
    }
}

impl Validate for DataResponse {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("responder", self.responder.as_str())?;
        require("service_id", &self.service_id)?;
        bounded("data", &self.data, MAX_DATA_LEN)
    }
}

impl Validate for ErrorResponse {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("reporter", self.reporter.as_str())?;
        bounded("message", &self.message, MAX_TEXT_LEN)
    }
}

impl Validate for RequestClosed {
    fn validate(&self) -> Result<(), SchemaError> {
        require("request_id", self.request_id.as_str())?;
        require("closed_by", self.closed_by.as_str())
    }
}

type Shape = fn(MessageType, &[u8]) -> Result<ProtocolMessage, SchemaError>;

fn parse_shape<T>(message_type: MessageType, body: &[u8]) -> Result<ProtocolMessage, SchemaError>
where
    T: DeserializeOwned + Validate + Into<ProtocolMessage>,
{
    let payload: T = serde_json::from_slice(body).map_err(|e| SchemaError::Shape {
        message_type,
        reason: e.to_string(),
    })?;
    payload.validate()?;
    Ok(payload.into())
}

/// The set of message shapes this node accepts.
pub struct SchemaRegistry {
    shapes: HashMap<MessageType, Shape>,
}

impl SchemaRegistry {
    /// A registry accepting nothing; add shapes with [`SchemaRegistry::register`].
    pub fn empty() -> Self {
        Self {
            shapes: HashMap::new(),
        }
    }

    /// A registry accepting every known message type.
    pub fn all() -> Self {
        let mut registry = Self::empty();
        for message_type in MessageType::ALL {
            registry.register(message_type);
        }
        registry
    }

    pub fn register(&mut self, message_type: MessageType) {
        let shape: Shape = match message_type {
            MessageType::ConsentRequest => parse_shape::<ConsentRequest>,
            MessageType::ConsentResponse => parse_shape::<ConsentResponse>,
            MessageType::DataRequest => parse_shape::<DataRequest>,
            MessageType::DataResponse => parse_shape::<DataResponse>,
            MessageType::ErrorResponse => parse_shape::<ErrorResponse>,
            MessageType::RequestClosed => parse_shape::<RequestClosed>,
        };
        self.shapes.insert(message_type, shape);
    }

    pub fn accepts(&self, message_type: MessageType) -> bool {
        self.shapes.contains_key(&message_type)
    }

    /// Parse and validate `body` as the declared `message_type`.
    pub fn validate(
        &self,
        message_type: MessageType,
        body: &[u8],
    ) -> Result<ProtocolMessage, SchemaError> {
        let shape = self
            .shapes
            .get(&message_type)
            .ok_or(SchemaError::UnknownType(message_type))?;
        shape(message_type, body)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idnet_types::{NodeId, RequestId};

    fn consent_request() -> ConsentRequest {
        ConsentRequest {
            request_id: RequestId::new("r1"),
            requester: NodeId::new("rp-1"),
            namespace: "citizen_id".into(),
            identifier: "1234567890123".into(),
            request_message: "Please confirm your identity".into(),
            min_ial: 2.1,
            min_aal: 2.2,
            request_timeout_secs: 3600,
            expected_height: Some(100),
        }
    }

    #[test]
    fn valid_payload_passes() {
        let body = serde_json::to_vec(&consent_request()).unwrap();
        let msg = SchemaRegistry::all()
            .validate(MessageType::ConsentRequest, &body)
            .unwrap();
        assert_eq!(msg, ProtocolMessage::ConsentRequest(consent_request()));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let mut registry = SchemaRegistry::empty();
        registry.register(MessageType::DataResponse);
        let body = serde_json::to_vec(&consent_request()).unwrap();
        assert_eq!(
            registry.validate(MessageType::ConsentRequest, &body),
            Err(SchemaError::UnknownType(MessageType::ConsentRequest))
        );
    }

    #[test]
    fn mismatched_shape_is_rejected() {
        let body = serde_json::to_vec(&consent_request()).unwrap();
        let err = SchemaRegistry::all()
            .validate(MessageType::DataRequest, &body)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Shape { .. }));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut value = serde_json::to_value(consent_request()).unwrap();
        value["extra"] = serde_json::json!(true);
        let body = serde_json::to_vec(&value).unwrap();
        let err = SchemaRegistry::all()
            .validate(MessageType::ConsentRequest, &body)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Shape { .. }));
    }

    #[test]
    fn empty_request_id_is_missing() {
        let mut req = consent_request();
        req.request_id = RequestId::new("");
        assert_eq!(
            req.validate(),
            Err(SchemaError::MissingField { field: "request_id" })
        );
    }

    #[test]
    fn out_of_range_ial_is_invalid() {
        let mut req = consent_request();
        req.min_ial = 9.9;
        assert!(matches!(
            req.validate(),
            Err(SchemaError::InvalidValue { field: "min_ial", .. })
        ));
    }
}
