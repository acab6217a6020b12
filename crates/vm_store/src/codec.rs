//! MessagePack value codec.
//!
//! Thin wrappers around `rmp-serde` for pickling values that cross engine
//! boundaries. Only ground values travel: references are resolved against
//! the sender's store first, and a payload can never smuggle a reference
//! into the receiver's store.

use crate::error::StoreError;
use crate::store::Store;
use crate::value::Value;

/// Resolve `value` against `store` and encode it to MessagePack bytes.
///
/// # Errors
///
/// Returns [`StoreError::Unbound`] / [`StoreError::Failed`] if the value is
/// not fully determined, or [`StoreError::Encode`] if serialisation fails.
pub fn encode(store: &Store, value: &Value) -> Result<Vec<u8>, StoreError> {
    let ground = store.resolve(value)?;
    rmp_serde::to_vec(&ground).map_err(StoreError::Encode)
}

/// Decode a value from MessagePack bytes.
///
/// # Errors
///
/// Returns [`StoreError::Decode`] if deserialisation fails.
pub fn decode(bytes: &[u8]) -> Result<Value, StoreError> {
    rmp_serde::from_slice(bytes).map_err(StoreError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_resolves_bound_refs() {
        let mut store = Store::new();
        let r = store.new_var();
        store.bind(r, Value::Str("hello".to_string())).unwrap();
        let msg = Value::record("msg", vec![Value::Var(r), Value::Int(42)]);

        let bytes = encode(&store, &msg).unwrap();
        let restored = decode(&bytes).unwrap();
        assert_eq!(
            restored,
            Value::record("msg", vec![Value::Str("hello".to_string()), Value::Int(42)])
        );
    }

    #[test]
    fn test_encode_rejects_unbound() {
        let mut store = Store::new();
        let r = store.new_var();
        assert!(matches!(
            encode(&store, &Value::Var(r)),
            Err(StoreError::Unbound(_))
        ));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(matches!(decode(&[0xFF, 0xFF]), Err(StoreError::Decode(_))));
    }
}
