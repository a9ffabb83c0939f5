//! Conversion between [`User`] and the store's generic attribute representation.
//!
//! Decoding is a total mapping from each field to the attribute kind it expects.
//! The three string fields are required; `Age` and `Active` fall back to `0` and
//! `false` when absent or of the wrong kind.

use std::collections::HashMap;

use thiserror::Error;

use crate::models::User;

pub const USER_ID: &str = "UserID";
pub const NAME: &str = "Name";
pub const EMAIL: &str = "Email";
pub const AGE: &str = "Age";
pub const ACTIVE: &str = "Active";

/// A single attribute value in the store's wire format
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    S(String),
    /// Numbers travel as decimal text
    N(String),
    B(Vec<u8>),
    Bool(bool),
    Null,
    L(Vec<AttributeValue>),
    M(HashMap<String, AttributeValue>),
    Ss(Vec<String>),
    Ns(Vec<String>),
    Bs(Vec<Vec<u8>>),
}

impl AttributeValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Bool(_) => "BOOL",
            Self::Null => "NULL",
            Self::L(_) => "L",
            Self::M(_) => "M",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
            Self::Bs(_) => "BS",
        }
    }

    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<&str> {
        match self {
            Self::N(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// An item: attribute name to value
pub type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("missing required attribute {0}")]
    MissingAttribute(&'static str),

    #[error("attribute {attribute} has type {found}, expected {expected}")]
    WrongType {
        attribute: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

/// Primary key item for a user id
pub fn key(user_id: &str) -> Item {
    HashMap::from([(USER_ID.to_string(), AttributeValue::S(user_id.to_string()))])
}

pub fn encode(user: &User) -> Item {
    HashMap::from([
        (USER_ID.to_string(), AttributeValue::S(user.user_id.clone())),
        (NAME.to_string(), AttributeValue::S(user.name.clone())),
        (EMAIL.to_string(), AttributeValue::S(user.email.clone())),
        (AGE.to_string(), AttributeValue::N(user.age.to_string())),
        (ACTIVE.to_string(), AttributeValue::Bool(user.active)),
    ])
}

pub fn decode(item: &Item) -> Result<User, CodecError> {
    Ok(User {
        user_id: required_string(item, USER_ID)?,
        name: required_string(item, NAME)?,
        email: required_string(item, EMAIL)?,
        age: lenient_age(item),
        active: lenient_active(item),
    })
}

fn required_string(item: &Item, attribute: &'static str) -> Result<String, CodecError> {
    match item.get(attribute) {
        Some(AttributeValue::S(value)) => Ok(value.clone()),
        Some(other) => Err(CodecError::WrongType {
            attribute,
            expected: "S",
            found: other.type_name(),
        }),
        None => Err(CodecError::MissingAttribute(attribute)),
    }
}

fn lenient_age(item: &Item) -> i64 {
    match item.get(AGE) {
        Some(AttributeValue::N(text)) => parse_integer(text).unwrap_or_else(|| {
            tracing::warn!(attribute = AGE, value = %text, "unparseable number, defaulting to 0");
            0
        }),
        Some(other) => {
            tracing::warn!(
                attribute = AGE,
                found = other.type_name(),
                "unexpected attribute type, defaulting to 0"
            );
            0
        }
        None => {
            tracing::warn!(attribute = AGE, "attribute missing, defaulting to 0");
            0
        }
    }
}

fn lenient_active(item: &Item) -> bool {
    match item.get(ACTIVE) {
        Some(AttributeValue::Bool(value)) => *value,
        Some(other) => {
            tracing::warn!(
                attribute = ACTIVE,
                found = other.type_name(),
                "unexpected attribute type, defaulting to false"
            );
            false
        }
        None => {
            tracing::warn!(attribute = ACTIVE, "attribute missing, defaulting to false");
            false
        }
    }
}

/// Leading integer of the text: `31.9` and `1e3` read as 31 and 1. No digits
/// or an out-of-range value yields `None`.
fn parse_integer(text: &str) -> Option<i64> {
    let text = text.trim();
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let digits = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    if digits == 0 {
        return None;
    }
    let end = text.len() - unsigned.len() + digits;
    text[..end].parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> User {
        User::new("user123", "John Doe", "john@example.com", 30, true)
    }

    #[test]
    fn test_decode_inverts_encode() {
        let users = [
            sample(),
            User::new("u-0", "", "", 0, false),
            User::new("u-neg", "Ünïcødé", "x@y", -42, true),
            User::new("u-max", "Max", "max@example.com", i64::MAX, false),
        ];
        for user in users {
            assert_eq!(decode(&encode(&user)).unwrap(), user);
        }
    }

    #[test]
    fn test_encode_uses_wire_types() {
        let item = encode(&sample());
        assert_eq!(item.len(), 5);
        assert_eq!(item[USER_ID], AttributeValue::S("user123".into()));
        assert_eq!(item[AGE], AttributeValue::N("30".into()));
        assert_eq!(item[ACTIVE], AttributeValue::Bool(true));
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let mut item = encode(&sample());
        item.remove(AGE);
        item.remove(ACTIVE);
        let user = decode(&item).unwrap();
        assert_eq!(user.age, 0);
        assert!(!user.active);
        assert_eq!(user.name, "John Doe");
    }

    #[test]
    fn test_mistyped_optional_fields_default() {
        let mut item = encode(&sample());
        item.insert(AGE.into(), AttributeValue::S("thirty".into()));
        item.insert(ACTIVE.into(), AttributeValue::N("1".into()));
        let user = decode(&item).unwrap();
        assert_eq!(user.age, 0);
        assert!(!user.active);
    }

    #[test]
    fn test_fractional_age_truncates() {
        let mut item = encode(&sample());
        item.insert(AGE.into(), AttributeValue::N("31.9".into()));
        assert_eq!(decode(&item).unwrap().age, 31);

        item.insert(AGE.into(), AttributeValue::N("not-a-number".into()));
        assert_eq!(decode(&item).unwrap().age, 0);
    }

    #[test]
    fn test_age_reads_only_the_leading_integer() {
        let cases = [
            ("1e3", 1),
            ("1e30", 1),
            ("-7.5", -7),
            ("+12", 12),
            ("99999999999999999999", 0),
            ("-", 0),
            (".5", 0),
        ];
        for (text, expected) in cases {
            let mut item = encode(&sample());
            item.insert(AGE.into(), AttributeValue::N(text.into()));
            assert_eq!(decode(&item).unwrap().age, expected, "age text {text:?}");
        }
    }

    #[test]
    fn test_required_string_violations() {
        let mut item = encode(&sample());
        item.remove(NAME);
        assert_eq!(decode(&item), Err(CodecError::MissingAttribute(NAME)));

        let mut item = encode(&sample());
        item.insert(EMAIL.into(), AttributeValue::Bool(true));
        assert_eq!(
            decode(&item),
            Err(CodecError::WrongType {
                attribute: EMAIL,
                expected: "S",
                found: "BOOL",
            })
        );
    }

    #[test]
    fn test_key_has_only_partition_key() {
        let key = key("user123");
        assert_eq!(key.len(), 1);
        assert_eq!(key[USER_ID].as_s(), Some("user123"));
    }
}
