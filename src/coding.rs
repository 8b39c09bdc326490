use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::CodingError;

/// The encoding used for job payloads and results.
///
/// Every task declares the coding of its payload type; the queue stores the
/// encoded bytes in the job document and decodes them again before invoking
/// the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coding {
    /// JSON encoding via `serde_json`.
    Json,
    /// BSON encoding via `bson`.
    Bson,
}

impl Coding {
    /// Encode the specified value into a byte sequence.
    pub fn marshal<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodingError> {
        match self {
            Coding::Json => Ok(serde_json::to_vec(value)?),
            Coding::Bson => Ok(bson::to_vec(value)?),
        }
    }

    /// Decode a value from the provided byte sequence.
    pub fn unmarshal<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodingError> {
        match self {
            Coding::Json => Ok(serde_json::from_slice(data)?),
            Coding::Bson => Ok(bson::from_slice(data)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Payload {
        data: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        let payload = Payload {
            data: "data".into(),
            count: 7,
        };
        let bytes = Coding::Json.marshal(&payload).unwrap();
        let decoded: Payload = Coding::Json.unmarshal(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn bson_round_trip() {
        let payload = Payload {
            data: "data".into(),
            count: 7,
        };
        let bytes = Coding::Bson.marshal(&payload).unwrap();
        let decoded: Payload = Coding::Bson.unmarshal(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn codings_are_not_interchangeable() {
        let payload = Payload {
            data: "data".into(),
            count: 7,
        };
        let bytes = Coding::Json.marshal(&payload).unwrap();
        assert!(Coding::Bson.unmarshal::<Payload>(&bytes).is_err());
    }
}
