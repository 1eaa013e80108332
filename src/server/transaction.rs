use super::params::ActionParams;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

/// Backs `ServerTransactionID`: one process-wide counter, starting at 1
/// because the field must be nonzero.
static SERVER_TRANSACTION_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Transaction half of an outgoing envelope: the client's transaction id
/// echoed back when one was supplied, plus a fresh server-side id.
#[derive(Debug, Serialize, Clone, Copy)]
pub(crate) struct ResponseTransaction {
    #[serde(rename = "ClientTransactionID")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) client_transaction_id: Option<NonZeroU32>,

    #[serde(rename = "ServerTransactionID")]
    pub(crate) server_transaction_id: NonZeroU32,
}

impl ResponseTransaction {
    pub(crate) fn new(client_transaction_id: Option<NonZeroU32>) -> Self {
        let next = SERVER_TRANSACTION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self {
            client_transaction_id,
            server_transaction_id: NonZeroU32::new(next)
                .expect("server transaction counter wrapped"),
        }
    }
}

/// Finished wire shape of a response: transaction ids flattened alongside
/// the payload's own envelope fields.
#[derive(Debug, Serialize)]
pub(crate) struct Enveloped<T> {
    #[serde(flatten)]
    pub(crate) transaction: ResponseTransaction,
    #[serde(flatten)]
    pub(crate) payload: T,
}

/// Transaction ids peeled off an incoming request before dispatch sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestTransaction {
    pub(crate) client_id: Option<NonZeroU32>,
    pub(crate) client_transaction_id: Option<NonZeroU32>,
}

impl RequestTransaction {
    pub(crate) fn extract(params: &mut ActionParams) -> anyhow::Result<Self> {
        Ok(Self {
            client_id: take_id(params, "ClientID")?,
            client_transaction_id: take_id(params, "ClientTransactionID")?,
        })
    }
}

/// Removes one id parameter from the map. A zero id is treated the same as
/// an absent one; some clients send it as filler.
fn take_id(
    params: &mut ActionParams,
    name: &'static str,
) -> anyhow::Result<Option<NonZeroU32>> {
    let raw: Option<u32> = match params {
        ActionParams::Get(map) => map.maybe_extract(name)?,
        ActionParams::Put(map) => map.maybe_extract(name)?,
    };
    Ok(raw.and_then(NonZeroU32::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_transaction_ids_increase() {
        let first = ResponseTransaction::new(None);
        let second = ResponseTransaction::new(None);
        assert!(second.server_transaction_id > first.server_transaction_id);
    }

    #[test]
    fn client_transaction_id_is_echoed_only_when_present() {
        let with = ResponseTransaction {
            client_transaction_id: NonZeroU32::new(5),
            server_transaction_id: NonZeroU32::new(9).expect("nonzero"),
        };
        let json = serde_json::to_value(with).expect("serialize");
        assert_eq!(json["ClientTransactionID"], 5);
        assert_eq!(json["ServerTransactionID"], 9);

        let without = ResponseTransaction {
            client_transaction_id: None,
            server_transaction_id: NonZeroU32::new(9).expect("nonzero"),
        };
        let json = serde_json::to_value(without).expect("serialize");
        assert!(json.get("ClientTransactionID").is_none());
    }
}
