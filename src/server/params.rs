use super::error::{Error, Result};
use axum::extract::{FromRequest, Request};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::Form;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

/// Key type for GET query parameters, which Alpaca matches without regard
/// to case. PUT form fields stay case-sensitive and use plain `String`.
#[derive(Debug, Clone, Eq)]
pub(crate) struct CaseInsensitiveKey(String);

impl From<String> for CaseInsensitiveKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl PartialEq for CaseInsensitiveKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Hash for CaseInsensitiveKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl<'de> Deserialize<'de> for CaseInsensitiveKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

/// Parameters we haven't interpreted yet, in arrival order.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
#[serde(bound(deserialize = "Key: Deserialize<'de> + Hash + Eq"))]
pub(crate) struct OpaqueParams<Key: Hash + Eq>(IndexMap<Key, String>);

impl<Key: Hash + Eq + From<String> + Debug> OpaqueParams<Key> {
    pub(crate) fn maybe_extract<T: DeserializeOwned>(
        &mut self,
        name: &'static str,
    ) -> Result<Option<T>> {
        self.0
            .swap_remove(&Key::from(name.to_owned()))
            .map(|value| serde_plain::from_str(&value))
            .transpose()
            .map_err(|err| Error::BadParameter { name, err })
    }

    pub(crate) fn extract<T: DeserializeOwned>(&mut self, name: &'static str) -> Result<T> {
        self.maybe_extract(name)?
            .ok_or(Error::MissingParameter { name })
    }

    fn finish(self) {
        if !self.0.is_empty() {
            tracing::warn!("Unused parameters: {:?}", self.0.keys());
        }
    }
}

#[derive(Debug)]
pub(crate) enum ActionParams {
    Get(OpaqueParams<CaseInsensitiveKey>),
    Put(OpaqueParams<String>),
}

impl ActionParams {
    pub(crate) fn finish_extraction(self) {
        match self {
            Self::Get(params) => params.finish(),
            Self::Put(params) => params.finish(),
        }
    }
}

#[async_trait::async_trait]
impl<S: Send + Sync> FromRequest<S> for ActionParams {
    type Rejection = axum::response::Response;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        match *req.method() {
            Method::GET => Ok(Self::Get(
                Form::from_request(req, state)
                    .await
                    .map_err(IntoResponse::into_response)?
                    .0,
            )),
            Method::PUT => Ok(Self::Put(
                Form::from_request(req, state)
                    .await
                    .map_err(IntoResponse::into_response)?
                    .0,
            )),
            _ => Err((StatusCode::METHOD_NOT_ALLOWED, "Method not allowed").into_response()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_params(pairs: &[(&str, &str)]) -> OpaqueParams<CaseInsensitiveKey> {
        OpaqueParams(
            pairs
                .iter()
                .map(|(k, v)| (CaseInsensitiveKey((*k).to_owned()), (*v).to_owned()))
                .collect(),
        )
    }

    #[test]
    fn get_parameters_match_case_insensitively() {
        let mut params = get_params(&[("clienttransactionid", "7")]);
        let id: Option<u32> = params.maybe_extract("ClientTransactionID").expect("parse");
        assert_eq!(id, Some(7));
    }

    #[test]
    fn missing_and_malformed_parameters_are_distinguished() {
        let mut params = get_params(&[("Position", "not-a-number")]);
        assert!(matches!(
            params.extract::<i32>("Position"),
            Err(Error::BadParameter {
                name: "Position",
                ..
            })
        ));
        assert!(matches!(
            params.extract::<i32>("Position"),
            Err(Error::MissingParameter { name: "Position" })
        ));
    }
}
