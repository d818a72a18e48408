//! Payload marshalling
//!
//! A payload is an ordered sequence of values. [`OStream`] builds one,
//! [`IStream`] takes one apart again. Type mismatches and underflows decode
//! to [`Code::InvArgs`], never to a panic.

use core_types::{Code, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Builder for outgoing payloads
///
/// Pushing never fails immediately; the first encoding error is kept and
/// reported by [`OStream::into_bytes`].
#[derive(Debug, Clone, Default)]
pub struct OStream {
    values: Vec<Value>,
    error: Option<Code>,
}

impl OStream {
    /// Creates an empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value
    pub fn push<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.values.push(v),
            Err(_) => {
                self.error.get_or_insert(Code::InvArgs);
            }
        }
        self
    }

    /// Appends another stream as one nested element
    pub fn push_stream(mut self, other: OStream) -> Self {
        if let Some(code) = other.error {
            self.error.get_or_insert(code);
        }
        self.values.push(Value::Array(other.values));
        self
    }

    /// Appends the values of another stream one by one
    pub fn append(mut self, other: OStream) -> Self {
        if let Some(code) = other.error {
            self.error.get_or_insert(code);
        }
        self.values.extend(other.values);
        self
    }

    /// Number of values pushed so far
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was pushed
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the pushed values, for nesting into a record
    pub fn into_values(self) -> Result<Vec<Value>> {
        match self.error {
            Some(code) => Err(code),
            None => Ok(self.values),
        }
    }

    /// Encodes the stream into payload bytes
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        if let Some(code) = self.error {
            return Err(code);
        }
        serde_json::to_vec(&self.values).map_err(|_| Code::InvArgs)
    }
}

/// Reader for incoming payloads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IStream {
    values: Vec<Value>,
    pos: usize,
}

impl IStream {
    /// Decodes payload bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let values: Vec<Value> = serde_json::from_slice(bytes).map_err(|_| Code::InvArgs)?;
        Ok(Self { values, pos: 0 })
    }

    /// Wraps values taken out of a record
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values, pos: 0 }
    }

    /// Takes the next value
    pub fn pop<T: DeserializeOwned>(&mut self) -> Result<T> {
        let value = self.values.get(self.pos).ok_or(Code::InvArgs)?;
        let decoded = T::deserialize(value).map_err(|_| Code::InvArgs)?;
        self.pos += 1;
        Ok(decoded)
    }

    /// Takes the next value as a raw error code
    pub fn pop_code(&mut self) -> Result<()> {
        let raw: u64 = self.pop()?;
        Code::from_raw(raw)
    }

    /// Takes the next value as a nested stream
    pub fn pop_stream(&mut self) -> Result<IStream> {
        match self.values.get(self.pos) {
            Some(Value::Array(values)) => {
                let values = values.clone();
                self.pos += 1;
                Ok(IStream { values, pos: 0 })
            }
            _ => Err(Code::InvArgs),
        }
    }

    /// Number of values not yet taken
    pub fn remaining(&self) -> usize {
        self.values.len() - self.pos
    }

    /// Returns true if every value was taken
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Starts over at the first value
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Converts the values not yet taken back into an outgoing stream
    pub fn into_ostream(self) -> OStream {
        OStream {
            values: self.values.into_iter().skip(self.pos).collect(),
            error: None,
        }
    }
}

impl From<OStream> for IStream {
    fn from(os: OStream) -> Self {
        IStream {
            values: os.values,
            pos: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::CapRange;

    #[test]
    fn test_push_pop() {
        let bytes = OStream::new()
            .push(&3u64)
            .push("123456")
            .push(&CapRange::new(5, 1))
            .into_bytes()
            .unwrap();
        let mut is = IStream::from_bytes(&bytes).unwrap();
        assert_eq!(is.remaining(), 3);
        assert_eq!(is.pop::<u64>().unwrap(), 3);
        assert_eq!(is.pop::<String>().unwrap(), "123456");
        assert_eq!(is.pop::<CapRange>().unwrap(), CapRange::new(5, 1));
        assert!(is.is_empty());
    }

    #[test]
    fn test_underflow_is_inv_args() {
        let mut is = IStream::from_bytes(b"[]").unwrap();
        assert_eq!(is.pop::<u64>(), Err(Code::InvArgs));
    }

    #[test]
    fn test_type_mismatch_does_not_advance() {
        let mut is = IStream::from_bytes(br#"["abc"]"#).unwrap();
        assert_eq!(is.pop::<u64>(), Err(Code::InvArgs));
        assert_eq!(is.pop::<String>().unwrap(), "abc");
    }

    #[test]
    fn test_garbage_is_inv_args() {
        assert_eq!(IStream::from_bytes(b"\x00\x01"), Err(Code::InvArgs));
        assert_eq!(IStream::from_bytes(br#"{"a":1}"#), Err(Code::InvArgs));
    }

    #[test]
    fn test_pop_code() {
        let mut is: IStream = OStream::new().push(&0u64).push(&19u64).into();
        assert_eq!(is.pop_code(), Ok(()));
        assert_eq!(is.pop_code(), Err(Code::RecvGone));
    }

    #[test]
    fn test_nested_stream() {
        let args = OStream::new().push("foo").push(&42u32);
        let bytes = OStream::new().push(&1u64).push_stream(args).into_bytes().unwrap();
        let mut is = IStream::from_bytes(&bytes).unwrap();
        assert_eq!(is.pop::<u64>().unwrap(), 1);
        let mut inner = is.pop_stream().unwrap();
        assert_eq!(inner.pop::<String>().unwrap(), "foo");
        assert_eq!(inner.pop::<u32>().unwrap(), 42);
        assert!(is.pop_stream().is_err());
    }

    #[test]
    fn test_rewind_and_into_ostream() {
        let mut is: IStream = OStream::new().push(&1u8).push(&2u8).into();
        assert_eq!(is.pop::<u8>().unwrap(), 1);
        let mut rest: IStream = is.clone().into_ostream().into();
        assert_eq!(rest.pop::<u8>().unwrap(), 2);
        is.rewind();
        assert_eq!(is.remaining(), 2);
    }
}
