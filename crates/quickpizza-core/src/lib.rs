use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod config;
pub mod context;
pub mod credentials;
pub mod faults;
pub mod retention;

pub use config::{CatalogConfig, DEFAULT_CONNECTION_STRING};
pub use context::{CancelHandle, Cancellation, Context};
pub use credentials::{Argon2Credentials, CredentialError, CredentialHelper};
pub use faults::{checkpoints, ArmedCheckpoints, FaultInjector, InjectedFault, NoFaults};
pub use retention::{BoundedTable, RetentionPolicy, RowStamp};

pub const USER_TOKEN_LENGTH: usize = 16;
pub const MAX_NAME_LENGTH: usize = 32;
pub const RESERVED_USERNAME: &str = "default";
pub const MIN_RATING_STARS: u8 = 1;
pub const MAX_RATING_STARS: u8 = 5;

/// Ingredient categories present in the seeded reference data.
pub const INGREDIENT_TYPES: [&str; 4] = ["olive_oil", "tomato", "mozzarella", "topping"];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("username field is empty")]
    EmptyUsername,
    #[error("username field is too long")]
    UsernameTooLong,
    #[error("username field is invalid")]
    ReservedUsername,
    #[error("password is empty")]
    EmptyPassword,
    #[error("rating stars must be between 1 and 5, got {0}")]
    StarsOutOfRange(u8),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PizzaId(pub i64);

impl Display for PizzaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration candidate. The plaintext password lives only here and is
/// consumed by the recorder before anything touches storage.
#[derive(Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub password: String,
}

impl NewUser {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    /// Check the candidate against the registration rules, first failure wins.
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] in rule order: empty username,
    /// username too long, reserved username, empty password.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        if self.username.len() > MAX_NAME_LENGTH {
            return Err(ValidationError::UsernameTooLong);
        }
        if self.username == RESERVED_USERNAME {
            return Err(ValidationError::ReservedUsername);
        }
        if self.password.is_empty() {
            return Err(ValidationError::EmptyPassword);
        }
        Ok(())
    }
}

impl std::fmt::Debug for NewUser {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub token: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dough {
    pub id: i64,
    pub name: String,
    pub calories_per_slice: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Ingredient {
    pub id: i64,
    pub name: String,
    pub calories_per_slice: i64,
    pub vegetarian: bool,
    #[serde(rename = "type")]
    pub ingredient_type: String,
}

/// A recommendation about to be recorded. Only the ids of `dough` and
/// `ingredients` are written; the rest is carried for the caller's benefit.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewPizza {
    pub name: String,
    pub dough: Dough,
    pub ingredients: Vec<Ingredient>,
    pub tool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Pizza {
    pub id: PizzaId,
    pub name: String,
    pub dough: Dough,
    pub ingredients: Vec<Ingredient>,
    pub tool: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Pizza {
    #[must_use]
    pub fn total_calories_per_slice(&self) -> i64 {
        self.dough.calories_per_slice
            + self.ingredients.iter().map(|ingredient| ingredient.calories_per_slice).sum::<i64>()
    }

    #[must_use]
    pub fn is_vegetarian(&self) -> bool {
        self.ingredients.iter().all(|ingredient| ingredient.vegetarian)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewRating {
    pub stars: u8,
    pub pizza_id: PizzaId,
}

impl NewRating {
    /// # Errors
    /// Returns [`ValidationError::StarsOutOfRange`] unless stars is within 1..=5.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if (MIN_RATING_STARS..=MAX_RATING_STARS).contains(&self.stars) {
            Ok(())
        } else {
            Err(ValidationError::StarsOutOfRange(self.stars))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Rating {
    pub id: i64,
    pub stars: u8,
    pub pizza_id: PizzaId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_rejected(candidate: &NewUser, expected: &ValidationError) {
        match candidate.validate() {
            Ok(()) => panic!("expected {expected:?} for {candidate:?}"),
            Err(err) => assert_eq!(&err, expected),
        }
    }

    #[test]
    fn validate_accepts_regular_candidate() {
        assert_eq!(NewUser::new("margherita", "s3cret").validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_empty_username() {
        assert_rejected(&NewUser::new("", "s3cret"), &ValidationError::EmptyUsername);
    }

    #[test]
    fn validate_rejects_username_over_limit() {
        let at_limit = "a".repeat(MAX_NAME_LENGTH);
        assert_eq!(NewUser::new(at_limit, "s3cret").validate(), Ok(()));

        let over_limit = "a".repeat(MAX_NAME_LENGTH + 1);
        assert_rejected(&NewUser::new(over_limit, "s3cret"), &ValidationError::UsernameTooLong);
    }

    #[test]
    fn validate_rejects_reserved_username() {
        assert_rejected(&NewUser::new("default", "s3cret"), &ValidationError::ReservedUsername);
        assert_eq!(NewUser::new("Default", "s3cret").validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_empty_password() {
        assert_rejected(&NewUser::new("margherita", ""), &ValidationError::EmptyPassword);
    }

    #[test]
    fn validate_reports_first_failing_rule() {
        assert_rejected(&NewUser::new("", ""), &ValidationError::EmptyUsername);
        assert_rejected(&NewUser::new("default", ""), &ValidationError::ReservedUsername);
    }

    #[test]
    fn new_user_debug_output_hides_password() {
        let rendered = format!("{:?}", NewUser::new("margherita", "hunter2"));
        assert!(rendered.contains("margherita"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn serialized_user_omits_token_and_digest() {
        let user = User {
            id: UserId(7),
            username: "margherita".to_string(),
            token: "abcdefghijklmnop".to_string(),
            password_hash: "$argon2id$v=19$...".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = match serde_json::to_value(&user) {
            Ok(json) => json,
            Err(err) => panic!("failed to serialize user: {err}"),
        };
        assert_eq!(json.get("id").and_then(serde_json::Value::as_i64), Some(7));
        assert!(json.get("token").is_none());
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn rating_stars_must_be_in_range() {
        let pizza_id = PizzaId(1);
        assert_eq!(NewRating { stars: 1, pizza_id }.validate(), Ok(()));
        assert_eq!(NewRating { stars: 5, pizza_id }.validate(), Ok(()));
        assert_eq!(
            NewRating { stars: 0, pizza_id }.validate(),
            Err(ValidationError::StarsOutOfRange(0))
        );
        assert_eq!(
            NewRating { stars: 6, pizza_id }.validate(),
            Err(ValidationError::StarsOutOfRange(6))
        );
    }

    #[test]
    fn pizza_summaries_fold_over_ingredients() {
        let pizza = Pizza {
            id: PizzaId(1),
            name: "Garden".to_string(),
            dough: Dough { id: 1, name: "Thin".to_string(), calories_per_slice: 150 },
            ingredients: vec![
                Ingredient {
                    id: 1,
                    name: "Tomato".to_string(),
                    calories_per_slice: 10,
                    vegetarian: true,
                    ingredient_type: "tomato".to_string(),
                },
                Ingredient {
                    id: 2,
                    name: "Basil".to_string(),
                    calories_per_slice: 1,
                    vegetarian: true,
                    ingredient_type: "topping".to_string(),
                },
            ],
            tool: "Knife".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(pizza.total_calories_per_slice(), 161);
        assert!(pizza.is_vegetarian());
    }
}
