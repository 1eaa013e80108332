use super::error;
use super::transaction::{Enveloped, ResponseTransaction};
use crate::errors::{AscomError, AscomErrorCode, AscomResult};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use std::fmt::Debug;

/// Response payload flattened to a JSON map, so transaction and error
/// fields can be merged in uniformly before the envelope goes out.
#[derive(Default, Debug, Clone, Serialize)]
#[serde(transparent)]
pub(crate) struct OpaqueResponse(pub(crate) serde_json::Map<String, serde_json::Value>);

impl OpaqueResponse {
    pub(crate) fn new<T: Debug + Serialize>(payload: T) -> Self {
        match serde_json::to_value(&payload) {
            // Struct payloads supply envelope fields of their own.
            Ok(serde_json::Value::Object(fields)) => Self(fields),
            // Unit results contribute nothing beyond the envelope itself.
            Ok(serde_json::Value::Null) => Self::default(),
            // Scalars and arrays go out as the `Value` field.
            Ok(scalar) => {
                let mut fields = serde_json::Map::with_capacity(1);
                fields.insert("Value".to_owned(), scalar);
                Self(fields)
            }
            // A payload that refuses to serialize still has to produce a
            // well-formed envelope; build the error fields by hand.
            Err(err) => {
                tracing::error!(%err, payload = ?payload, "response payload failed to serialize");
                let mut fields = serde_json::Map::with_capacity(2);
                fields.insert(
                    "ErrorNumber".to_owned(),
                    serde_json::Value::from(AscomErrorCode::UNSPECIFIED.0),
                );
                fields.insert(
                    "ErrorMessage".to_owned(),
                    serde_json::Value::from(format!("could not serialize response: {err}")),
                );
                Self(fields)
            }
        }
    }
}

/// Wrapper forcing a payload to serialize under the `Value` key even when
/// it is itself an object (e.g. the server description).
#[derive(Debug, Serialize)]
pub(crate) struct ValueResponse<T> {
    #[serde(rename = "Value")]
    pub(crate) value: T,
}

impl<T> From<T> for ValueResponse<T> {
    fn from(value: T) -> Self {
        Self { value }
    }
}

pub(crate) trait Response: Sized {
    fn into_axum(self, transaction: ResponseTransaction) -> axum::response::Response;
}

impl Response for OpaqueResponse {
    fn into_axum(self, transaction: ResponseTransaction) -> axum::response::Response {
        Json(Enveloped {
            transaction,
            payload: self,
        })
        .into_response()
    }
}

impl Response for AscomResult<OpaqueResponse> {
    fn into_axum(self, transaction: ResponseTransaction) -> axum::response::Response {
        match self {
            Ok(mut response) => {
                response.0.extend(OpaqueResponse::new(AscomError::none()).0);
                response
            }
            Err(err) => {
                tracing::error!(%err, "Alpaca method returned an error");
                OpaqueResponse::new(err)
            }
        }
        .into_axum(transaction)
    }
}

impl Response for error::Result<OpaqueResponse> {
    fn into_axum(self, transaction: ResponseTransaction) -> axum::response::Response {
        match self {
            Ok(response) => AscomResult::Ok(response).into_axum(transaction),
            Err(error::Error::Ascom(err)) => {
                AscomResult::<OpaqueResponse>::Err(err).into_axum(transaction)
            }
            Err(err) => (StatusCode::BAD_REQUEST, format!("{err:#}")).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;

    #[test]
    fn scalars_are_wrapped_into_the_value_field() {
        let response = OpaqueResponse::new(42_i32);
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!(42)));

        let response = OpaqueResponse::new(());
        assert!(response.0.is_empty());

        let response = OpaqueResponse::new(Vec::<String>::new());
        assert_eq!(response.0.get("Value"), Some(&serde_json::json!([])));
    }

    #[test]
    fn success_envelope_carries_zero_error_number() {
        let mut ok = OpaqueResponse::new(true);
        ok.0.extend(OpaqueResponse::new(AscomError::none()).0);
        assert_eq!(ok.0.get("ErrorNumber"), Some(&serde_json::json!(0)));
        assert_eq!(ok.0.get("ErrorMessage"), Some(&serde_json::json!("")));
        assert_eq!(ok.0.get("Value"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn failure_envelope_carries_the_mapped_error_number() {
        let err = AscomError::from(DriverError::InvalidValue(
            "move of 10000 steps exceeds the maximum increment 5000".to_owned(),
        ));
        let response = OpaqueResponse::new(err);
        assert_eq!(response.0.get("ErrorNumber"), Some(&serde_json::json!(1026)));
        assert!(response.0.get("Value").is_none());
    }
}
