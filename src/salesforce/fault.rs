//! Decoding of error bodies into [`Error`] values.
//!
//! Non-2xx responses carry either an XML fault envelope or a JSON list of
//! error objects. Anything that fails to decode falls back to the raw body.

use reqwest::{Method, StatusCode};
use serde::Deserialize;

use crate::error::{ApiError, ApiErrors, Error};

/// Fault code that marks an expired or revoked session.
pub const INVALID_SESSION_ID: &str = "InvalidSessionId";

/// Fault code returned when an object cannot be used with the bulk API.
pub const INVALID_ENTITY: &str = "InvalidEntity";

/// `{exceptionCode, exceptionMessage}` fault, as XML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FaultEnvelope {
    #[serde(rename = "exceptionCode", alias = "ExceptionCode", default)]
    pub code: String,
    #[serde(rename = "exceptionMessage", alias = "ExceptionMessage", default)]
    pub message: String,
}

impl FaultEnvelope {
    pub fn from_xml(body: &str) -> Option<Self> {
        quick_xml::de::from_str(body).ok()
    }

    pub fn from_json(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }

    /// Decodes `body` as XML or JSON depending on `xml`, defaulting to empty.
    pub fn decode(body: &str, xml: bool) -> Self {
        let parsed = if xml {
            Self::from_xml(body)
        } else {
            Self::from_json(body)
        };
        parsed.unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.message.is_empty()
    }

    pub fn is_invalid_session(&self) -> bool {
        self.code == INVALID_SESSION_ID
    }

    /// Converts a fault found in place of a bulk descriptor into an error.
    ///
    /// An empty fault means the server returned nothing usable, which is
    /// reported as `NotFound` for `what`.
    pub fn into_bulk_error(self, what: &str) -> Error {
        if self.is_empty() {
            Error::NotFound(what.to_string())
        } else if self.is_invalid_session() {
            Error::SessionExpired
        } else if self.code == INVALID_ENTITY {
            Error::InvalidBulkObject
        } else {
            Error::Fault {
                code: self.code,
                message: self.message,
            }
        }
    }
}

/// Returns true for verbs whose error lists are reported in full.
fn aggregates_errors(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// Classifies a non-2xx, non-auth response body.
///
/// `xml` selects the fault envelope decoder; otherwise a JSON error list is
/// expected, with a JSON fault object as second choice.
pub(crate) fn classify_error_body(
    method: &Method,
    status: StatusCode,
    xml: bool,
    body: &[u8],
) -> Error {
    let text = String::from_utf8_lossy(body);
    let raw = || Error::Http {
        status: status.as_u16(),
        body: text.to_string(),
    };

    if xml {
        return match FaultEnvelope::from_xml(&text) {
            Some(fault) if fault.is_invalid_session() => Error::SessionExpired,
            Some(fault) if !fault.is_empty() => Error::Fault {
                code: fault.code,
                message: fault.message,
            },
            _ => raw(),
        };
    }

    if let Ok(mut errors) = serde_json::from_str::<Vec<ApiError>>(&text) {
        if errors.is_empty() {
            return raw();
        }
        if errors.iter().any(|e| e.error_code == INVALID_SESSION_ID) {
            return Error::SessionExpired;
        }
        if !aggregates_errors(method) {
            errors.truncate(1);
        }
        return Error::Api(ApiErrors(errors));
    }

    match FaultEnvelope::from_json(&text) {
        Some(fault) if fault.is_invalid_session() => Error::SessionExpired,
        Some(fault) if !fault.is_empty() => Error::Fault {
            code: fault.code,
            message: fault.message,
        },
        _ => raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const XML_FAULT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<error xmlns="http://www.force.com/2009/06/asyncapi/dataload">
    <exceptionCode>InvalidJob</exceptionCode>
    <exceptionMessage>Unable to find object: Nope</exceptionMessage>
</error>"#;

    const XML_INVALID_SESSION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<error xmlns="http://www.force.com/2009/06/asyncapi/dataload">
    <exceptionCode>InvalidSessionId</exceptionCode>
    <exceptionMessage>Invalid session id</exceptionMessage>
</error>"#;

    const JSON_ERRORS: &str = r#"[
        {"message": "Required fields are missing: [Name]", "errorCode": "REQUIRED_FIELD_MISSING", "fields": ["Name"]},
        {"message": "bad value", "errorCode": "INVALID_FIELD", "fields": []}
    ]"#;

    #[test]
    fn xml_fault_is_decoded() {
        let err = classify_error_body(
            &Method::GET,
            StatusCode::BAD_REQUEST,
            true,
            XML_FAULT.as_bytes(),
        );

        match err {
            Error::Fault { code, message } => {
                assert_eq!(code, "InvalidJob");
                assert_eq!(message, "Unable to find object: Nope");
            }
            other => panic!("expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn xml_invalid_session_is_session_expired() {
        let err = classify_error_body(
            &Method::POST,
            StatusCode::BAD_REQUEST,
            true,
            XML_INVALID_SESSION.as_bytes(),
        );
        assert!(matches!(err, Error::SessionExpired));
    }

    #[test]
    fn get_surfaces_first_error_only() {
        let err = classify_error_body(
            &Method::GET,
            StatusCode::BAD_REQUEST,
            false,
            JSON_ERRORS.as_bytes(),
        );

        match err {
            Error::Api(errors) => {
                assert_eq!(errors.0.len(), 1);
                assert_eq!(errors.0[0].error_code, "REQUIRED_FIELD_MISSING");
            }
            other => panic!("expected Api, got {:?}", other),
        }
    }

    #[test]
    fn patch_aggregates_every_error_with_fields() {
        let err = classify_error_body(
            &Method::PATCH,
            StatusCode::BAD_REQUEST,
            false,
            JSON_ERRORS.as_bytes(),
        );

        match &err {
            Error::Api(errors) => assert_eq!(errors.0.len(), 2),
            other => panic!("expected Api, got {:?}", other),
        }
        let rendered = err.to_string();
        assert!(rendered.contains("[Code: REQUIRED_FIELD_MISSING]"));
        assert!(rendered.contains("Fields: [Name]"));
        assert!(rendered.contains("[Code: INVALID_FIELD]"));
    }

    #[test]
    fn json_fault_object_is_second_choice() {
        let body = r#"{"exceptionCode":"InvalidBatch","exceptionMessage":"Records not processed"}"#;
        let err = classify_error_body(&Method::POST, StatusCode::BAD_REQUEST, false, body.as_bytes());

        assert!(matches!(err, Error::Fault { ref code, .. } if code == "InvalidBatch"));
    }

    #[test]
    fn undecodable_body_falls_back_to_raw_text() {
        let err = classify_error_body(
            &Method::GET,
            StatusCode::INTERNAL_SERVER_ERROR,
            false,
            b"upstream exploded",
        );

        match err {
            Error::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "upstream exploded");
            }
            other => panic!("expected Http, got {:?}", other),
        }
    }

    #[test]
    fn empty_error_list_falls_back_to_raw_text() {
        let err = classify_error_body(&Method::GET, StatusCode::NOT_FOUND, false, b"[]");
        assert!(matches!(err, Error::Http { status: 404, .. }));
    }

    #[test]
    fn garbage_xml_falls_back_to_raw_text() {
        let err = classify_error_body(&Method::GET, StatusCode::BAD_GATEWAY, true, b"<<<");
        assert!(matches!(err, Error::Http { status: 502, .. }));
    }

    #[test]
    fn bulk_error_mapping() {
        assert!(matches!(
            FaultEnvelope::default().into_bulk_error("job"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            FaultEnvelope {
                code: INVALID_ENTITY.into(),
                message: "Entity 'Foo' is not supported".into()
            }
            .into_bulk_error("job"),
            Error::InvalidBulkObject
        ));
        assert!(matches!(
            FaultEnvelope {
                code: "InvalidJob".into(),
                message: "closed".into()
            }
            .into_bulk_error("job"),
            Error::Fault { .. }
        ));
    }

    #[test]
    fn decode_picks_format() {
        let fault = FaultEnvelope::decode(XML_FAULT, true);
        assert_eq!(fault.code, "InvalidJob");

        let fault = FaultEnvelope::decode(r#"{"exceptionCode":"X","exceptionMessage":"Y"}"#, false);
        assert_eq!(fault.code, "X");

        assert!(FaultEnvelope::decode("not a fault", false).is_empty());
    }
}
