//! Static ABI encoding of single-word values.

use alloy_core::primitives::{Address, B256, U256, keccak256};

use crate::{
    error::ChainError,
    node::{Value, ValueKind},
};

use super::Call;

/// The 4-byte function selector of `signature`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_word(value: &Value) -> B256 {
    match value {
        Value::Address(address) => address.into_word(),
        Value::Uint(value) => B256::from(value.to_be_bytes::<32>()),
        Value::Bool(value) => B256::with_last_byte(u8::from(*value)),
    }
}

/// Concatenated words, as appended to creation bytecode.
pub fn encode_args(args: &[Value]) -> Vec<u8> {
    args.iter()
        .flat_map(|arg| encode_word(arg).0)
        .collect()
}

/// Selector followed by the encoded arguments.
pub fn encode_call(call: &Call) -> Vec<u8> {
    let mut data = selector(&call.signature()).to_vec();
    data.extend(encode_args(&call.args));
    data
}

/// Decode the first return word as `kind`.
pub fn decode_word(kind: ValueKind, data: &[u8]) -> Result<Value, ChainError> {
    let word = data
        .get(..32)
        .map(B256::from_slice)
        .ok_or_else(|| ChainError::Decode(format!("expected 32 bytes, got {}", data.len())))?;

    match kind {
        ValueKind::Address => {
            if word[..12].iter().any(|byte| *byte != 0) {
                return Err(ChainError::Decode(format!("{word} is not an address")));
            }
            Ok(Value::Address(Address::from_word(word)))
        }
        ValueKind::Uint => Ok(Value::Uint(U256::from_be_bytes(word.0))),
        ValueKind::Bool => match U256::from_be_bytes(word.0) {
            value if value.is_zero() => Ok(Value::Bool(false)),
            value if value == U256::from(1) => Ok(Value::Bool(true)),
            _ => Err(ChainError::Decode(format!("{word} is not a bool"))),
        },
    }
}
