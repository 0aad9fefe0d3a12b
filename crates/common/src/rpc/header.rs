use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{RpcError, Status};

/// Terminates every header line
pub const DELIMITER: u8 = b'\n';
/// Largest header line accepted
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;

/// `{cmd, timestamp, args}` sent by the initiator of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub cmd: String,
    pub timestamp: i64,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// `{code, msg, info}` sent back by the handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub code: u16,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub info: Value,
}

impl ResponseHeader {
    pub fn new(status: Status, msg: impl Into<String>) -> Self {
        Self {
            code: status.code(),
            msg: msg.into(),
            info: Value::Null,
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok, "ok")
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_code(self.code)
    }

    pub fn is_ok(&self) -> bool {
        self.code == Status::Ok.code()
    }

    /// The error a non-200 response stands for
    pub fn into_error(self) -> RpcError {
        RpcError::Remote {
            code: self.code,
            msg: self.msg,
        }
    }
}

/// Encode a header as one JSON line
pub fn encode_line<T: Serialize>(header: &T) -> Result<Vec<u8>, RpcError> {
    let mut line = serde_json::to_vec(header)?;
    line.push(DELIMITER);
    Ok(line)
}

/// Decode a JSON header line (delimiter optional)
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> Result<T, RpcError> {
    let trimmed = line.strip_suffix(&[DELIMITER]).unwrap_or(line);
    serde_json::from_slice(trimmed).map_err(|e| RpcError::MalformedHeader(e.to_string()))
}

/// Turn a command into the argument map of a request header
pub fn to_args<T: Serialize>(command: &T) -> Result<Map<String, Value>, RpcError> {
    match serde_json::to_value(command)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(RpcError::Encoding(format!(
            "command arguments must be an object, got {other}"
        ))),
    }
}

/// Binary fields inside JSON headers travel as base64 strings
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    /// Same encoding for a list of binary values
    pub mod list {
        use super::*;
        use serde::ser::SerializeSeq;

        pub fn serialize<S: Serializer>(
            items: &[Vec<u8>],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(items.len()))?;
            for item in items {
                seq.serialize_element(&STANDARD.encode(item))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Vec<u8>>, D::Error> {
            Vec::<String>::deserialize(deserializer)?
                .into_iter()
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}

/// Decode the `info` of a successful response
pub fn parse_info<T: for<'de> Deserialize<'de>>(response: &ResponseHeader) -> Result<T, RpcError> {
    serde_json::from_value(response.info.clone())
        .map_err(|e| RpcError::Encoding(format!("response info: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_a_single_line() {
        let mut args = Map::new();
        args.insert("note".into(), Value::String("line one\nline two".into()));
        let header = RequestHeader {
            cmd: "ping".into(),
            timestamp: 42,
            args,
        };
        let line = encode_line(&header).unwrap();
        assert_eq!(line.iter().filter(|b| **b == DELIMITER).count(), 1);
        assert_eq!(decode_line::<RequestHeader>(&line).unwrap(), header);
    }

    #[test]
    fn garbage_is_a_malformed_header() {
        assert!(matches!(
            decode_line::<ResponseHeader>(b"{not json\n"),
            Err(RpcError::MalformedHeader(_))
        ));
    }
}
