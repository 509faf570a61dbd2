//! Typed binary encodings for blocks and sequence functions.
//!
//! Every serializable component is written as an envelope naming its type and
//! carrying its own payload, so that a container such as
//! [`Bidirectional`](crate::Bidirectional) can decode members it knows nothing
//! about.

use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bidirectional::Bidirectional;
use crate::block::Block;
use crate::block_seq_func::BlockSeqFunc;
use crate::dense_block::DenseBlock;
use crate::errors::{Result, RnnError};
use crate::seq_func::SeqFunc;

const TYPE_PREFIX: &str = "rnnprop.";
pub const DENSE_BLOCK: &str = "rnnprop.DenseBlock";
pub const BLOCK_SEQ_FUNC: &str = "rnnprop.BlockSeqFunc";
pub const BIDIRECTIONAL: &str = "rnnprop.Bidirectional";

#[derive(Serialize, Deserialize)]
struct TypedData {
    kind: String,
    data: Vec<u8>,
}

/// A decoded component of unknown concrete type.
pub enum Component {
    Block(Rc<dyn Block>),
    SeqFunc(Box<dyn SeqFunc>),
}

impl Component {
    fn describe(&self) -> &'static str {
        match self {
            Component::Block(_) => "Block",
            Component::SeqFunc(_) => "SeqFunc",
        }
    }

    pub fn into_block(self) -> Result<Rc<dyn Block>> {
        match self {
            Component::Block(block) => Ok(block),
            other => Err(RnnError::TypeMismatch {
                expected: "Block".to_string(),
                got: other.describe().to_string(),
            }),
        }
    }

    pub fn into_seq_func(self) -> Result<Box<dyn SeqFunc>> {
        match self {
            Component::SeqFunc(f) => Ok(f),
            other => Err(RnnError::TypeMismatch {
                expected: "SeqFunc".to_string(),
                got: other.describe().to_string(),
            }),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(RnnError::serialization)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let (value, read): (T, usize) =
        bincode::serde::decode_from_slice(data, bincode::config::standard()).map_err(|e| {
            RnnError::Deserialization {
                message: e.to_string(),
            }
        })?;
    if read != data.len() {
        return Err(RnnError::Deserialization {
            message: format!("{} trailing bytes after payload", data.len() - read),
        });
    }
    Ok(value)
}

pub fn serialize_with_type(kind: &str, data: Vec<u8>) -> Result<Vec<u8>> {
    encode(&TypedData {
        kind: kind.to_string(),
        data,
    })
}

/// Decodes an envelope written by [`serialize_with_type`].
pub fn deserialize_with_type(bytes: &[u8]) -> Result<Component> {
    let typed: TypedData = decode(bytes)?;
    tracing::debug!(kind = typed.kind.as_str(), bytes = typed.data.len(), "decoding component");
    match typed.kind.as_str() {
        DENSE_BLOCK => Ok(Component::Block(Rc::new(DenseBlock::deserialize(&typed.data)?))),
        BLOCK_SEQ_FUNC => Ok(Component::SeqFunc(Box::new(BlockSeqFunc::deserialize(
            &typed.data,
        )?))),
        BIDIRECTIONAL => Ok(Component::SeqFunc(Box::new(Bidirectional::deserialize(
            &typed.data,
        )?))),
        other => Err(RnnError::UnknownType {
            kind: other.strip_prefix(TYPE_PREFIX).unwrap_or(other).to_string(),
        }),
    }
}

/// Encodes already-serialized components as one list.
pub fn serialize_slice(items: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    encode(&items)
}

pub fn deserialize_slice(bytes: &[u8]) -> Result<Vec<Component>> {
    let items: Vec<Vec<u8>> = decode(bytes)?;
    items.iter().map(|item| deserialize_with_type(item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_is_an_error() {
        let bytes = serialize_with_type("rnnprop.Mystery", vec![1, 2, 3]).unwrap();
        match deserialize_with_type(&bytes) {
            Err(RnnError::UnknownType { kind }) => assert_eq!(kind, "Mystery"),
            _ => panic!("expected UnknownType"),
        }
    }

    #[test]
    fn test_malformed_bytes_are_an_error() {
        assert!(matches!(
            deserialize_with_type(&[0xff, 0xff, 0xff]),
            Err(RnnError::Deserialization { .. })
        ));
    }

    #[test]
    fn test_block_is_not_a_seq_func() {
        let bytes = DenseBlock::new(1, 1, 1).serialize().unwrap();
        let component = deserialize_with_type(&bytes).unwrap();
        assert!(matches!(
            component.into_seq_func(),
            Err(RnnError::TypeMismatch { .. })
        ));
    }
}
