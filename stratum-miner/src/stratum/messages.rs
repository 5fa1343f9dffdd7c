//! Stratum message types and JSON serialization.
//!
//! Stratum is line-delimited JSON-RPC without a version field. Replies carry
//! no method, so they can only be interpreted by remembering which request an
//! id belongs to (see [`RequestKind`]). Incoming lines are classified by
//! [`Incoming::parse`]; outgoing requests and replies are built from the
//! `Serialize` envelopes here so field order on the wire is stable.

use bitcoin::hashes::Hash;
use bitcoin::TxMerkleNode;
use serde::Serialize;
use serde_json::Value;

use super::error::{StratumError, StratumResult};
use crate::work::Extranonce2;

/// Kind of a client-issued request, remembered per id to route the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Subscribe,
    Authorize,
    Submit,
}

impl RequestKind {
    pub fn method(&self) -> &'static str {
        match self {
            RequestKind::Subscribe => "mining.subscribe",
            RequestKind::Authorize => "mining.authorize",
            RequestKind::Submit => "mining.submit",
        }
    }
}

/// Client-issued request envelope. Ids go out as decimal strings.
#[derive(Debug, Serialize)]
pub struct ClientRequest<'a> {
    pub id: String,
    pub method: &'a str,
    pub params: Value,
}

/// Reply to a request issued by the server.
#[derive(Debug, Serialize)]
pub struct ClientReply {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

/// Serialize an envelope as one wire line, newline included.
pub fn to_line<T: Serialize>(message: &T) -> StratumResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Server methods this client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMethod {
    Notify,
    SetDifficulty,
    GetVersion,
}

impl ServerMethod {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "mining.notify" => Some(ServerMethod::Notify),
            "mining.set_difficulty" => Some(ServerMethod::SetDifficulty),
            "client.get_version" => Some(ServerMethod::GetVersion),
            _ => None,
        }
    }
}

/// One classified incoming line.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Request or notification from the server.
    Request {
        /// Server id, kept verbatim so replies echo it in the same form
        id: Value,
        method: String,
        params: Vec<Value>,
    },

    /// Reply to one of our requests.
    Reply {
        id: u64,
        result: Value,
        error: Option<PoolErrorReply>,
    },
}

impl Incoming {
    /// Parse and classify one line.
    ///
    /// A non-null `method` makes the line a server request; anything else is
    /// a reply and must carry an id we can read as an unsigned integer.
    pub fn parse(line: &str) -> StratumResult<Self> {
        let value: Value = serde_json::from_str(line)?;
        let object = value
            .as_object()
            .ok_or_else(|| StratumError::InvalidMessage("message is not an object".to_string()))?;

        match object.get("method") {
            Some(Value::Null) | None => {}
            Some(Value::String(method)) => {
                let id = object.get("id").cloned().unwrap_or(Value::Null);
                if !id.is_null() {
                    parse_id(&id)?;
                }
                let params = match object.get("params") {
                    Some(Value::Array(params)) => params.clone(),
                    _ => {
                        return Err(StratumError::InvalidMessage(format!(
                            "{} params not an array",
                            method
                        )))
                    }
                };
                return Ok(Incoming::Request {
                    id,
                    method: method.clone(),
                    params,
                });
            }
            Some(other) => {
                return Err(StratumError::InvalidMessage(format!(
                    "method is not a string: {}",
                    other
                )))
            }
        }

        let id = object
            .get("id")
            .ok_or_else(|| StratumError::InvalidMessage("reply without id".to_string()))
            .and_then(parse_id)?;
        let error = match object.get("error") {
            Some(Value::Null) | None => None,
            Some(error) => Some(PoolErrorReply::from_value(error)?),
        };
        let result = object.get("result").cloned().unwrap_or(Value::Null);

        Ok(Incoming::Reply { id, result, error })
    }
}

/// Read a message id, which pools send either as a number or a digit string.
pub fn parse_id(id: &Value) -> StratumResult<u64> {
    match id {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| StratumError::InvalidMessage(format!("id not an unsigned integer: {}", n))),
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s
            .parse()
            .map_err(|_| StratumError::InvalidMessage(format!("id out of range: {}", s))),
        other => Err(StratumError::InvalidMessage(format!(
            "id not numeric: {}",
            other
        ))),
    }
}

/// Error carried by a reply.
///
/// MPOS-style pools send `[code, message, traceback]`, P2Pool sends
/// `{"code": .., "message": ..}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolErrorReply {
    pub code: i64,
    pub message: String,
}

impl PoolErrorReply {
    pub fn from_value(error: &Value) -> StratumResult<Self> {
        let (code, message) = match error {
            Value::Array(items) => (items.first(), items.get(1)),
            Value::Object(map) => (map.get("code"), map.get("message")),
            other => {
                return Err(StratumError::InvalidMessage(format!(
                    "unrecognized error format: {}",
                    other
                )))
            }
        };

        let code = code
            .and_then(Value::as_i64)
            .ok_or_else(|| StratumError::InvalidMessage("error code not an integer".to_string()))?;
        let message = match message {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        Ok(Self { code, message })
    }
}

impl std::fmt::Display for PoolErrorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Result of `mining.subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeReply {
    /// Session id from the first subscription pair, if the pool sent one
    pub session_id: Option<String>,
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: u8,
}

impl SubscribeReply {
    /// Parse `[[subscriptions...], extranonce1, extranonce2_size]`.
    pub fn from_result(result: &Value) -> Result<Self, String> {
        let items = result.as_array().ok_or("subscribe result not an array")?;
        if items.len() < 3 {
            return Err("subscribe result too short".to_string());
        }

        let subscriptions = items[0].as_array().ok_or("subscriptions not an array")?;
        let session_id = subscriptions.iter().find_map(|entry| match entry {
            // Either [["mining.notify", "id"], ...] or the flat ["mining.notify", "id"]
            Value::Array(pair) => pair.get(1).and_then(Value::as_str).map(str::to_string),
            _ => None,
        });
        let session_id = session_id.or_else(|| {
            subscriptions
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let extranonce1_str = items[1].as_str().ok_or("extranonce1 not a string")?;
        let extranonce1 =
            hex::decode(extranonce1_str).map_err(|e| format!("extranonce1 hex: {}", e))?;

        let size = match &items[2] {
            Value::Number(n) => n.as_u64().ok_or("extranonce2 size not an unsigned integer")?,
            Value::String(s) => s
                .parse::<u64>()
                .map_err(|e| format!("extranonce2 size: {}", e))?,
            _ => return Err("extranonce2 size not a number".to_string()),
        };
        let extranonce2_size = u8::try_from(size)
            .map_err(|_| format!("extranonce2 size out of range: {}", size))?;

        Ok(Self {
            session_id,
            extranonce1,
            extranonce2_size,
        })
    }
}

/// A `mining.notify` job.
///
/// Hashes keep the byte order they arrive in; laying them out in a header is
/// the work factory's business.
#[derive(Debug, Clone, PartialEq)]
pub struct MiningJob {
    pub job_id: String,
    pub prev_hash: [u8; 32],
    /// Coinbase bytes before the extranonces
    pub coinbase1: Vec<u8>,
    /// Coinbase bytes after the extranonces
    pub coinbase2: Vec<u8>,
    pub merkle_branches: Vec<TxMerkleNode>,
    pub version: u32,
    /// Compact network target
    pub nbits: u32,
    pub ntime: u32,
    /// Earlier jobs are void
    pub clean_jobs: bool,
}

impl MiningJob {
    /// Parse the positional `mining.notify` params. Errors name the field.
    pub fn from_stratum_params(params: &[Value]) -> Result<Self, String> {
        if params.len() < 9 {
            return Err(format!("expected 9 params, got {}", params.len()));
        }

        let merkle_branches = params[4]
            .as_array()
            .ok_or("merkle_branches: not an array")?
            .iter()
            .map(|branch| -> Result<TxMerkleNode, String> {
                let text = branch.as_str().ok_or("merkle branch: not a string")?;
                let bytes = parse_hash(text).map_err(|e| format!("merkle branch {}", e))?;
                Ok(TxMerkleNode::from_byte_array(bytes))
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(Self {
            job_id: str_param(params, 0, "job_id")?.to_string(),
            prev_hash: parse_hash(str_param(params, 1, "prev_hash")?)
                .map_err(|e| format!("prev_hash {}", e))?,
            coinbase1: hex_param(params, 2, "coinbase1")?,
            coinbase2: hex_param(params, 3, "coinbase2")?,
            merkle_branches,
            version: parse_u32_hex(&params[5], "version")?,
            nbits: parse_u32_hex(&params[6], "nbits")?,
            ntime: parse_u32_hex(&params[7], "ntime")?,
            clean_jobs: params[8].as_bool().ok_or("clean_jobs: not a bool")?,
        })
    }
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, String> {
    params[index]
        .as_str()
        .ok_or_else(|| format!("{}: not a string", name))
}

fn hex_param(params: &[Value], index: usize, name: &str) -> Result<Vec<u8>, String> {
    hex::decode(str_param(params, index, name)?).map_err(|e| format!("{} hex: {}", name, e))
}

fn parse_hash(text: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(text).map_err(|e| format!("hex: {}", e))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| format!("wrong length: {}", bytes.len()))
}

fn parse_u32_hex(value: &Value, name: &str) -> Result<u32, String> {
    let s = value.as_str().ok_or_else(|| format!("{}: not a string", name))?;
    u32::from_str_radix(s, 16).map_err(|e| format!("{} hex: {}", name, e))
}

/// One share for `mining.submit`.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub username: String,
    pub job_id: String,
    pub extranonce2: Extranonce2,
    pub ntime: u32,
    pub nonce: u32,
}

impl SubmitParams {
    /// `[user, job, extranonce2, ntime, nonce]`, numbers as fixed-width hex.
    pub fn to_stratum_json(&self) -> Value {
        serde_json::json!([
            self.username,
            self.job_id,
            self.extranonce2.to_string(),
            format!("{:08x}", self.ntime),
            format!("{:08x}", self.nonce),
        ])
    }
}
