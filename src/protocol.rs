use crate::types::{LogDocument, Transaction};
use serde::{Deserialize, Serialize};

pub type RequestId = u64;

/// Everything that travels over a peer connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the connecting side.
    Hello { user: String, password: String },
    Welcome,
    Rejected { reason: String },
    Request { id: RequestId, body: SyncRequest },
    Response { id: RequestId, body: SyncResponse },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncRequest {
    /// Send your full transaction log.
    GetLog,
    /// Send the current transaction (and content) of one key.
    Fetch { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncResponse {
    Log { entries: LogDocument },
    File(FetchReply),
    NotFound { key: String },
    Error { message: String },
}

/// Answer to [`SyncRequest::Fetch`]. `payload` is present iff the
/// transaction is not a deletion.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchReply {
    pub key: String,
    pub transaction: Transaction,
    #[serde(default, with = "base64_payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
}

impl std::fmt::Debug for FetchReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchReply")
            .field("key", &self.key)
            .field("transaction", &self.transaction)
            .field("payload", &self.payload.as_ref().map(Vec::len))
            .finish()
    }
}

mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|text| STANDARD.decode(text).map_err(serde::de::Error::custom))
            .transpose()
    }
}
