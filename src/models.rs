use serde::{Deserialize, Serialize};

/// A user record as stored in the users table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub age: i64,
    pub active: bool,
}

impl User {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
        age: i64,
        active: bool,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            email: email.into(),
            age,
            active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_serializes_with_snake_case_fields() {
        let user = User::new("user123", "John Doe", "john@example.com", 30, true);
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["user_id"], "user123");
        assert_eq!(json["age"], 30);
        assert_eq!(json["active"], true);
    }
}
