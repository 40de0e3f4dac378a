use serde::{Deserialize, Serialize};

use crate::retention::{BoundedTable, RetentionPolicy};

pub const DEFAULT_CONNECTION_STRING: &str = ":memory:";

pub const ENV_CONNECTION_STRING: &str = "QUICKPIZZA_DB";
pub const ENV_FIXED_PIZZAS: &str = "QUICKPIZZA_DB_FIXED_PIZZAS";
pub const ENV_FIXED_USERS: &str = "QUICKPIZZA_DB_FIXED_USERS";
pub const ENV_FIXED_RATINGS: &str = "QUICKPIZZA_DB_FIXED_RATINGS";
pub const ENV_MAX_PIZZAS: &str = "QUICKPIZZA_DB_MAX_PIZZAS";
pub const ENV_MAX_USERS: &str = "QUICKPIZZA_DB_MAX_USERS";
pub const ENV_MAX_RATINGS: &str = "QUICKPIZZA_DB_MAX_RATINGS";

const DEFAULT_FIXED_PIZZAS: i64 = 100;
const DEFAULT_FIXED_USERS: i64 = 10;
const DEFAULT_FIXED_RATINGS: i64 = 10;
const DEFAULT_MAX_PIZZAS: i64 = 5000;
const DEFAULT_MAX_USERS: i64 = 5000;
const DEFAULT_MAX_RATINGS: i64 = 10000;

/// Startup parameters of the catalog, read once.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CatalogConfig {
    pub connection_string: String,
    pub users: RetentionPolicy,
    pub pizzas: RetentionPolicy,
    pub ratings: RetentionPolicy,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            connection_string: DEFAULT_CONNECTION_STRING.to_string(),
            users: RetentionPolicy::new(DEFAULT_FIXED_USERS, DEFAULT_MAX_USERS),
            pizzas: RetentionPolicy::new(DEFAULT_FIXED_PIZZAS, DEFAULT_MAX_PIZZAS),
            ratings: RetentionPolicy::new(DEFAULT_FIXED_RATINGS, DEFAULT_MAX_RATINGS),
        }
    }
}

impl CatalogConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key/value source. Missing or non-numeric values fall back
    /// to their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let int = |name: &str, default: i64| {
            lookup(name).and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(default)
        };

        Self {
            connection_string: lookup(ENV_CONNECTION_STRING)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONNECTION_STRING.to_string()),
            users: RetentionPolicy::new(
                int(ENV_FIXED_USERS, DEFAULT_FIXED_USERS),
                int(ENV_MAX_USERS, DEFAULT_MAX_USERS),
            ),
            pizzas: RetentionPolicy::new(
                int(ENV_FIXED_PIZZAS, DEFAULT_FIXED_PIZZAS),
                int(ENV_MAX_PIZZAS, DEFAULT_MAX_PIZZAS),
            ),
            ratings: RetentionPolicy::new(
                int(ENV_FIXED_RATINGS, DEFAULT_FIXED_RATINGS),
                int(ENV_MAX_RATINGS, DEFAULT_MAX_RATINGS),
            ),
        }
    }

    #[must_use]
    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = connection_string.into();
        self
    }

    #[must_use]
    pub fn policy(&self, table: BoundedTable) -> RetentionPolicy {
        match table {
            BoundedTable::Users => self.users,
            BoundedTable::Pizzas => self.pizzas,
            BoundedTable::Ratings => self.ratings,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, table: BoundedTable, policy: RetentionPolicy) -> Self {
        match table {
            BoundedTable::Users => self.users = policy,
            BoundedTable::Pizzas => self.pizzas = policy,
            BoundedTable::Ratings => self.ratings = policy,
        }
        self
    }
}
