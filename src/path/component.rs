//! A single, validated path component: non-empty, no separators, not `.`
//! or `..`. Modeled on `castore::path::component::PathComponent`.

use bstr::ByteSlice;
use bytes::Bytes;
use std::fmt::{self, Debug, Display};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathComponentError {
    #[error("invalid path component: {0:?}")]
    Invalid(Vec<u8>),
}

#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathComponent {
    inner: Bytes,
}

fn is_valid(name: &[u8]) -> bool {
    !name.is_empty() && name != b".." && name != b"." && !name.contains(&0) && !name.contains(&b'/')
}

impl PathComponent {
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl AsRef<[u8]> for PathComponent {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl TryFrom<&str> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if !is_valid(value.as_bytes()) {
            return Err(PathComponentError::Invalid(value.as_bytes().to_vec()));
        }
        Ok(Self {
            inner: Bytes::copy_from_slice(value.as_bytes()),
        })
    }
}

impl TryFrom<Bytes> for PathComponent {
    type Error = PathComponentError;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        if !is_valid(&value) {
            return Err(PathComponentError::Invalid(value.to_vec()));
        }
        Ok(Self { inner: value })
    }
}

impl Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.inner.as_bstr(), f)
    }
}

impl Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.inner.as_bstr(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_name() {
        assert!(PathComponent::try_from("hello.txt").is_ok());
    }

    #[test]
    fn rejects_dot_and_dotdot() {
        assert!(PathComponent::try_from(".").is_err());
        assert!(PathComponent::try_from("..").is_err());
    }

    #[test]
    fn rejects_separator_and_empty() {
        assert!(PathComponent::try_from("a/b").is_err());
        assert!(PathComponent::try_from("").is_err());
    }
}
