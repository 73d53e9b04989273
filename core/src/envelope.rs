use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, RpcError, TidewireError};

// Wire field names, as spelled by the serde attributes below.
#[cfg(test)]
mod keys {
    pub const RESPONSE: &str = "response";
    pub const OK: &str = "ok";
    pub const DATA: &str = "data";
    pub const ERROR_CODE: &str = "errorCode";
    pub const ERROR_REASON: &str = "errorReason";
}

/// Request envelope: `{"request":true, "id":..., "method":..., "data":...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub request: bool,
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Response envelope.
///
/// A successful response carries `data`; a failed one carries `errorCode` and
/// `errorReason` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub response: bool,
    pub id: u32,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(
        rename = "errorCode",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_code: Option<i32>,
    #[serde(
        rename = "errorReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_reason: Option<String>,
}

impl Response {
    /// Converts the response into the outcome handed to the requester.
    ///
    /// # Examples
    ///
    /// ```
    /// use tidewire_core::envelope::{decode_response, encode_response_err};
    ///
    /// let bytes = encode_response_err(7, 404, "Not found").unwrap();
    /// let err = decode_response(&bytes).unwrap().into_result().unwrap_err();
    /// assert_eq!(err.code, 404);
    /// assert_eq!(err.reason, "Not found");
    /// ```
    pub fn into_result(self) -> std::result::Result<Value, RpcError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(RpcError::remote(
                self.error_code.unwrap_or_default(),
                self.error_reason.unwrap_or_default(),
            ))
        }
    }
}

/// Notification envelope: `{"notification":true, "method":..., "data":...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default)]
    pub notification: bool,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

/// Result of sniffing the tag fields of a raw message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    /// No tag, or more than one tag, was set
    Unknown,
}

/// A fully decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

// Only the tags; every other field is ignored while classifying.
#[derive(Deserialize)]
struct Probe {
    #[serde(default)]
    request: bool,
    #[serde(default)]
    response: bool,
    #[serde(default)]
    notification: bool,
}

fn to_data<P: Serialize + ?Sized>(payload: &P) -> Result<Value> {
    serde_json::to_value(payload).map_err(TidewireError::Encoding)
}

fn to_bytes<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(TidewireError::Encoding)
}

/// Encodes a request envelope.
///
/// Fails with [`TidewireError::Encoding`] when the payload cannot be serialized;
/// nothing is produced in that case.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tidewire_core::envelope::{decode_request, encode_request};
///
/// let bytes = encode_request(42, "offer", &json!({"sdp": "x"})).unwrap();
/// let req = decode_request(&bytes).unwrap();
/// assert!(req.request);
/// assert_eq!(req.id, 42);
/// assert_eq!(req.method, "offer");
/// assert_eq!(req.data, json!({"sdp": "x"}));
/// ```
pub fn encode_request<P: Serialize + ?Sized>(id: u32, method: &str, payload: &P) -> Result<Vec<u8>> {
    to_bytes(&Request {
        request: true,
        id,
        method: method.to_string(),
        data: to_data(payload)?,
    })
}

/// Encodes a successful response to request `id`.
pub fn encode_response_ok<P: Serialize + ?Sized>(id: u32, payload: &P) -> Result<Vec<u8>> {
    to_bytes(&Response {
        response: true,
        id,
        ok: true,
        data: Some(to_data(payload)?),
        error_code: None,
        error_reason: None,
    })
}

/// Encodes a failed response to request `id`.
pub fn encode_response_err(id: u32, code: i32, reason: &str) -> Result<Vec<u8>> {
    to_bytes(&Response {
        response: true,
        id,
        ok: false,
        data: None,
        error_code: Some(code),
        error_reason: Some(reason.to_string()),
    })
}

/// Encodes a notification.
pub fn encode_notification<P: Serialize + ?Sized>(method: &str, payload: &P) -> Result<Vec<u8>> {
    to_bytes(&Notification {
        notification: true,
        method: method.to_string(),
        data: to_data(payload)?,
    })
}

/// Classifies a raw message by its tag fields.
///
/// Malformed bytes (not a JSON object) are a [`TidewireError::Decoding`]; a
/// well-formed object with zero or several tags is [`MessageKind::Unknown`].
///
/// # Examples
///
/// ```
/// use tidewire_core::envelope::{classify, MessageKind};
///
/// assert_eq!(classify(br#"{"notification":true,"method":"m"}"#).unwrap(), MessageKind::Notification);
/// assert_eq!(classify(br#"{"request":true,"response":true}"#).unwrap(), MessageKind::Unknown);
/// assert!(classify(b"not json").is_err());
/// ```
pub fn classify(bytes: &[u8]) -> Result<MessageKind> {
    let probe: Probe =
        serde_json::from_slice(bytes).map_err(|e| TidewireError::Decoding(e.to_string()))?;
    let kind = match (probe.request, probe.response, probe.notification) {
        (true, false, false) => MessageKind::Request,
        (false, true, false) => MessageKind::Response,
        (false, false, true) => MessageKind::Notification,
        _ => MessageKind::Unknown,
    };
    Ok(kind)
}

fn decode_shape<'a, T: Deserialize<'a>>(bytes: &'a [u8], what: &str) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TidewireError::Decoding(format!("{what}: {e}")))
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    decode_shape(bytes, "request")
}

pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    decode_shape(bytes, "response")
}

pub fn decode_notification(bytes: &[u8]) -> Result<Notification> {
    decode_shape(bytes, "notification")
}

/// Classifies and then decodes the tag-specific shape.
pub fn decode(bytes: &[u8]) -> Result<Inbound> {
    match classify(bytes)? {
        MessageKind::Request => decode_request(bytes).map(Inbound::Request),
        MessageKind::Response => decode_response(bytes).map(Inbound::Response),
        MessageKind::Notification => decode_notification(bytes).map(Inbound::Notification),
        MessageKind::Unknown => Err(TidewireError::Decoding(
            "message carries no single request/response/notification tag".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_omits_data() {
        let bytes = encode_response_err(9, 500, "boom").unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw[keys::RESPONSE], json!(true));
        assert_eq!(raw[keys::ERROR_CODE], json!(500));
        assert_eq!(raw[keys::ERROR_REASON], json!("boom"));
        assert!(raw.get(keys::DATA).is_none());
    }

    #[test]
    fn test_ok_response_keeps_null_data() {
        let bytes = encode_response_ok(9, &Value::Null).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw[keys::OK], json!(true));
        assert!(raw.get(keys::DATA).is_some());
        assert_eq!(decode_response(&bytes).unwrap().into_result(), Ok(Value::Null));
    }
}
