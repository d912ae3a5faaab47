//! Utility functions for identifiers, hashing and serialization
use super::error::ChainError;
use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn encode_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, ChainError> {
    minicbor::to_vec(value).map_err(|e| ChainError::Codec(e.to_string()))
}

pub fn decode_cbor<T>(bytes: &[u8]) -> Result<T, ChainError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| ChainError::Codec(e.to_string()))
}

/// Encodes `value` into CBOR and returns the sha256 of the encoding alongside it.
pub fn digest_cbor<T: minicbor::Encode<()>>(value: &T) -> Result<(String, Vec<u8>), ChainError> {
    let cbor = encode_cbor(value)?;
    let hash = sha256::digest(&cbor);

    Ok((hash, cbor))
}
