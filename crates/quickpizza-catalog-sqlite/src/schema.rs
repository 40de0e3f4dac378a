use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;

use crate::{format_timestamp, CatalogError};

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  token TEXT NOT NULL UNIQUE,
  password_hash TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS doughs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  calories_per_slice INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ingredients (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  calories_per_slice INTEGER NOT NULL,
  vegetarian INTEGER NOT NULL CHECK (vegetarian IN (0, 1)),
  type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tools (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pizzas (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  dough_id INTEGER NOT NULL,
  tool TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (dough_id) REFERENCES doughs(id)
);

CREATE TABLE IF NOT EXISTS pizza_ingredients (
  pizza_id INTEGER NOT NULL,
  ingredient_id INTEGER NOT NULL,
  PRIMARY KEY (pizza_id, ingredient_id),
  FOREIGN KEY (pizza_id) REFERENCES pizzas(id) ON DELETE CASCADE,
  FOREIGN KEY (ingredient_id) REFERENCES ingredients(id)
);

CREATE TABLE IF NOT EXISTS ratings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  stars INTEGER NOT NULL CHECK (stars BETWEEN 1 AND 5),
  pizza_id INTEGER NOT NULL,
  user_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (pizza_id) REFERENCES pizzas(id) ON DELETE CASCADE,
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_users_recency ON users(created_at, id);
CREATE INDEX IF NOT EXISTS idx_pizzas_recency ON pizzas(created_at, id);
CREATE INDEX IF NOT EXISTS idx_ratings_recency ON ratings(created_at, id);
CREATE INDEX IF NOT EXISTS idx_ratings_user ON ratings(user_id);
CREATE INDEX IF NOT EXISTS idx_ingredients_type ON ingredients(type);
CREATE INDEX IF NOT EXISTS idx_pizza_ingredients_ingredient ON pizza_ingredients(ingredient_id);
";

const MIGRATION_002_SEED_SQL: &str = r"
INSERT INTO doughs(name, calories_per_slice) VALUES
  ('Thin', 150),
  ('Thick', 200),
  ('Sourdough', 175),
  ('Whole Wheat', 170),
  ('Gluten Free', 150);

INSERT INTO ingredients(name, calories_per_slice, vegetarian, type) VALUES
  ('Extra-virgin olive oil', 40, 1, 'olive_oil'),
  ('Garlic oil', 40, 1, 'olive_oil'),
  ('Chili oil', 40, 1, 'olive_oil'),
  ('Tomato sauce', 20, 1, 'tomato'),
  ('Crushed San Marzano', 25, 1, 'tomato'),
  ('Cherry tomatoes', 15, 1, 'tomato'),
  ('Mozzarella', 70, 1, 'mozzarella'),
  ('Buffalo mozzarella', 80, 1, 'mozzarella'),
  ('Vegan mozzarella', 60, 1, 'mozzarella'),
  ('Pepperoni', 120, 0, 'topping'),
  ('Prosciutto', 90, 0, 'topping'),
  ('Anchovies', 40, 0, 'topping'),
  ('Mushrooms', 10, 1, 'topping'),
  ('Basil', 1, 1, 'topping'),
  ('Olives', 25, 1, 'topping'),
  ('Red onion', 10, 1, 'topping'),
  ('Pineapple', 20, 1, 'topping');

INSERT INTO tools(name) VALUES
  ('Knife'),
  ('Pizza cutter'),
  ('Scissors'),
  ('Mezzaluna');
";

const MIGRATIONS: [(i64, &str); 2] = [(1, MIGRATION_001_SQL), (2, MIGRATION_002_SEED_SQL)];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus, CatalogError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

/// Apply every pending forward migration, each in its own transaction.
/// Returns the versions that were applied.
pub(crate) fn migrate(conn: &mut Connection) -> Result<Vec<i64>, CatalogError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

    let current = current_schema_version(conn)?;
    if current > LATEST_SCHEMA_VERSION {
        return Err(CatalogError::UnsupportedSchema {
            found: current,
            expected: LATEST_SCHEMA_VERSION,
        });
    }

    let mut applied = Vec::new();
    for (version, sql) in MIGRATIONS {
        if version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, format_timestamp(OffsetDateTime::now_utc())?],
        )?;
        tx.commit()?;

        info!(version, "applied catalog migration");
        applied.push(version);
    }

    Ok(applied)
}

fn current_schema_version(conn: &Connection) -> Result<i64, CatalogError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}
