//! Transaction payload variants and calldata building
//!
//! Requests arrive at the engine as JSON; the recognized variants are a
//! plain value transfer, a contract invocation (function ABI + inputs) and a
//! contract deployment (bytecode + optional constructor ABI). Anything else
//! is rejected as an unsupported payload variant.

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{Constructor, Function, Token};
use ethers::types::{Address, Bytes, U256};
use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// A recognized transaction payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TxPayload {
    Transfer {
        to: Address,
        #[serde(default)]
        value: U256,
    },
    ContractInvoke {
        to: Address,
        function: Function,
        #[serde(default)]
        inputs: Vec<String>,
        #[serde(default)]
        value: U256,
    },
    ContractDeploy {
        bytecode: Bytes,
        #[serde(default)]
        constructor: Option<Constructor>,
        #[serde(default)]
        inputs: Vec<String>,
        #[serde(default)]
        value: U256,
    },
}

/// The materialized wire fields of a payload.
#[derive(Debug, Clone)]
pub struct BuiltPayload {
    /// None for deployments
    pub to: Option<Address>,
    pub data: Bytes,
    pub value: U256,
}

impl TxPayload {
    /// Parse an untyped request payload.
    ///
    /// A payload that is not an object carrying a recognized `type` tag is
    /// `UnsupportedPayloadVariant`; an object of a known variant whose body
    /// fails to parse is `PayloadInvalid`. Both are fatal for the request.
    pub fn from_value(value: &serde_json::Value) -> EngineResult<Self> {
        let variant = value
            .as_object()
            .and_then(|obj| obj.get("type"))
            .and_then(|tag| tag.as_str())
            .ok_or_else(|| {
                EngineError::UnsupportedPayloadVariant(summarize_value(value))
            })?;
        if !matches!(variant, "transfer" | "contract_invoke" | "contract_deploy") {
            return Err(EngineError::UnsupportedPayloadVariant(variant.to_string()));
        }
        serde_json::from_value(value.clone())
            .map_err(|err| EngineError::PayloadInvalid(err.to_string()))
    }

    pub fn value(&self) -> U256 {
        match self {
            TxPayload::Transfer { value, .. }
            | TxPayload::ContractInvoke { value, .. }
            | TxPayload::ContractDeploy { value, .. } => *value,
        }
    }

    /// Build the destination/calldata/value triple for this payload.
    ///
    /// ABI tokenization and encoding failures are payload-fatal.
    pub fn build(&self) -> EngineResult<BuiltPayload> {
        match self {
            TxPayload::Transfer { to, value } => Ok(BuiltPayload {
                to: Some(*to),
                data: Bytes::new(),
                value: *value,
            }),
            TxPayload::ContractInvoke {
                to,
                function,
                inputs,
                value,
            } => {
                let tokens = tokenize(inputs, function.inputs.iter().map(|p| &p.kind))?;
                let data = function
                    .encode_input(&tokens)
                    .map_err(|err| EngineError::PayloadInvalid(err.to_string()))?;
                Ok(BuiltPayload {
                    to: Some(*to),
                    data: data.into(),
                    value: *value,
                })
            }
            TxPayload::ContractDeploy {
                bytecode,
                constructor,
                inputs,
                value,
            } => {
                let data = match constructor {
                    None => {
                        if !inputs.is_empty() {
                            return Err(EngineError::PayloadInvalid(
                                "constructor inputs supplied without a constructor ABI"
                                    .to_string(),
                            ));
                        }
                        bytecode.to_vec()
                    }
                    Some(constructor) => {
                        let tokens =
                            tokenize(inputs, constructor.inputs.iter().map(|p| &p.kind))?;
                        constructor
                            .encode_input(bytecode.to_vec(), &tokens)
                            .map_err(|err| EngineError::PayloadInvalid(err.to_string()))?
                    }
                };
                Ok(BuiltPayload {
                    to: None,
                    data: data.into(),
                    value: *value,
                })
            }
        }
    }
}

fn tokenize<'a>(
    inputs: &[String],
    kinds: impl ExactSizeIterator<Item = &'a ethers::abi::ParamType>,
) -> EngineResult<Vec<Token>> {
    if inputs.len() != kinds.len() {
        return Err(EngineError::PayloadInvalid(format!(
            "expected {} ABI inputs, got {}",
            kinds.len(),
            inputs.len()
        )));
    }
    inputs
        .iter()
        .zip(kinds)
        .map(|(raw, kind)| {
            LenientTokenizer::tokenize(kind, raw)
                .map_err(|err| EngineError::PayloadInvalid(format!("input {raw:?}: {err}")))
        })
        .collect()
}

fn summarize_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(_) => "boolean".to_string(),
        serde_json::Value::Number(_) => "number".to_string(),
        serde_json::Value::String(_) => "string".to_string(),
        serde_json::Value::Array(_) => "array".to_string(),
        serde_json::Value::Object(_) => "object without a recognized type tag".to_string(),
    }
}
