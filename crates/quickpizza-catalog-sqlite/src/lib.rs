use std::sync::{Arc, Mutex};

use quickpizza_core::{
    checkpoints, Argon2Credentials, BoundedTable, Cancellation, CatalogConfig,
    Context, CredentialError, CredentialHelper, Dough, FaultInjector, Ingredient, InjectedFault,
    NewPizza, NewRating, NewUser, NoFaults, Pizza, PizzaId, Rating, RetentionPolicy, User, UserId,
    ValidationError,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

mod executor;
mod schema;

pub use executor::CatalogExecutor;
pub use schema::{SchemaStatus, LATEST_SCHEMA_VERSION};

// Fixed-width UTC so that lexical order of the stored text is chronological.
const TIMESTAMP_FORMAT: &str =
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z";

// VM steps between cancellation polls while a statement runs.
const PROGRESS_POLL_STEPS: i32 = 1_000;

const PIZZA_COLUMNS: &str =
    "p.id, p.name, p.tool, p.created_at, d.id, d.name, d.calories_per_slice";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Injected(#[from] InjectedFault),
    #[error(transparent)]
    Cancelled(#[from] Cancellation),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt catalog data: {0}")]
    Corrupt(String),
    #[error("unsupported schema version {found}; expected {expected}")]
    UnsupportedSchema { found: i64, expected: i64 },
    #[error("catalog connection lock poisoned")]
    LockPoisoned,
    #[error("catalog executor has shut down")]
    ExecutorClosed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableCounts {
    pub users: i64,
    pub pizzas: i64,
    pub pizza_ingredients: i64,
    pub ratings: i64,
}

pub struct SqliteCatalog {
    conn: Mutex<Connection>,
    config: CatalogConfig,
    credentials: Arc<dyn CredentialHelper>,
    faults: Arc<dyn FaultInjector>,
}

impl std::fmt::Debug for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCatalog").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SqliteCatalog {
    /// Open the database named by `config.connection_string` and configure
    /// runtime pragmas. The schema is left untouched; see [`Self::connect`].
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(config: CatalogConfig) -> Result<Self, CatalogError> {
        let conn = open_connection(&config.connection_string)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            config,
            credentials: Arc::new(Argon2Credentials::new()),
            faults: Arc::new(NoFaults),
        })
    }

    /// Open, migrate to the latest schema, and log the retention parameters.
    ///
    /// # Errors
    /// Returns an error when opening or migrating the database fails.
    pub fn connect(config: CatalogConfig) -> Result<Self, CatalogError> {
        let catalog = Self::open(config)?;
        info!("running migrations");
        let applied = catalog.migrate()?;
        info!(count = applied.len(), "applied migrations");
        info!(
            fixed_pizzas = catalog.config.pizzas.fixed,
            fixed_users = catalog.config.users.fixed,
            fixed_ratings = catalog.config.ratings.fixed,
            max_pizzas = catalog.config.pizzas.maximum,
            max_users = catalog.config.users.maximum,
            max_ratings = catalog.config.ratings.maximum,
            "catalog parameters"
        );
        Ok(catalog)
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialHelper>) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_fault_injector(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    #[must_use]
    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, CatalogError> {
        let conn = self.conn.lock().map_err(|_| CatalogError::LockPoisoned)?;
        schema::schema_status(&conn)
    }

    /// Apply all forward migrations and return the versions applied.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&self) -> Result<Vec<i64>, CatalogError> {
        let mut conn = self.conn.lock().map_err(|_| CatalogError::LockPoisoned)?;
        schema::migrate(&mut conn)
    }

    /// List ingredients of one type, e.g. `topping`.
    ///
    /// # Errors
    /// Returns the injected fault when `get-ingredients` is armed, otherwise
    /// cancellation or storage errors.
    pub fn get_ingredients(
        &self,
        ctx: &Context,
        ingredient_type: &str,
    ) -> Result<Vec<Ingredient>, CatalogError> {
        ctx.check()?;
        self.faults.check(ctx, checkpoints::GET_INGREDIENTS)?;

        self.with_connection(ctx, "get_ingredients", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, calories_per_slice, vegetarian, type
                 FROM ingredients
                 WHERE type = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![ingredient_type], ingredient_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn get_doughs(&self, ctx: &Context) -> Result<Vec<Dough>, CatalogError> {
        self.with_connection(ctx, "get_doughs", |conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, calories_per_slice FROM doughs ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| {
                Ok(Dough { id: row.get(0)?, name: row.get(1)?, calories_per_slice: row.get(2)? })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Distinct tool names in first-seen order.
    ///
    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn get_tools(&self, ctx: &Context) -> Result<Vec<String>, CatalogError> {
        self.with_connection(ctx, "get_tools", |conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM tools GROUP BY name ORDER BY MIN(id) ASC")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// The `limit` most recently recorded pizzas, newest first, with dough and
    /// ingredients loaded.
    ///
    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn get_history(&self, ctx: &Context, limit: u32) -> Result<Vec<Pizza>, CatalogError> {
        self.with_connection(ctx, "get_history", |conn| {
            let tx = conn.transaction()?;
            let heads = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {PIZZA_COLUMNS}
                     FROM pizzas p
                     JOIN doughs d ON d.id = p.dough_id
                     ORDER BY p.created_at DESC, p.id DESC
                     LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit], pizza_head_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut history = Vec::with_capacity(heads.len());
            for head in heads {
                ctx.check()?;
                let ingredients = load_pizza_ingredients(&tx, head.id)?;
                history.push(head.into_pizza(ingredients));
            }
            tx.commit()?;
            Ok(history)
        })
    }

    /// One recorded pizza by id. A missing id is `Ok(None)`.
    ///
    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn get_recommendation(
        &self,
        ctx: &Context,
        id: PizzaId,
    ) -> Result<Option<Pizza>, CatalogError> {
        self.with_connection(ctx, "get_recommendation", |conn| {
            let tx = conn.transaction()?;
            let head = tx
                .query_row(
                    &format!(
                        "SELECT {PIZZA_COLUMNS}
                         FROM pizzas p
                         JOIN doughs d ON d.id = p.dough_id
                         WHERE p.id = ?1"
                    ),
                    params![id.0],
                    pizza_head_from_row,
                )
                .optional()?;

            let pizza = match head {
                Some(head) => {
                    let ingredients = load_pizza_ingredients(&tx, head.id)?;
                    Some(head.into_pizza(ingredients))
                }
                None => None,
            };
            tx.commit()?;
            Ok(pizza)
        })
    }

    /// Validate, digest, and persist a new user, then trim the users table.
    ///
    /// # Errors
    /// Returns validation, digest, cancellation, or storage errors. No row is
    /// left behind on any failure.
    pub fn record_user(&self, ctx: &Context, candidate: NewUser) -> Result<User, CatalogError> {
        ctx.check()?;
        candidate.validate()?;

        let password_hash = self.credentials.digest(&candidate.password)?;
        let token = self.credentials.generate_token();
        let policy = self.config.users;
        let NewUser { username, .. } = candidate;

        self.with_connection(ctx, "record_user", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let created_at = OffsetDateTime::now_utc();
            tx.execute(
                "INSERT INTO users(username, token, password_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![username, token, password_hash, format_timestamp(created_at)?],
            )?;
            let id = UserId(tx.last_insert_rowid());

            ctx.check()?;
            enforce_table_size_limits(&tx, BoundedTable::Users, policy)?;
            ctx.check()?;
            tx.commit()?;

            Ok(User { id, username, token, password_hash, created_at })
        })
    }

    /// Look a user up by credentials. Unknown usernames and wrong passwords
    /// both come back as `Ok(None)`.
    ///
    /// # Errors
    /// Returns cancellation or storage errors only.
    pub fn login_user(
        &self,
        ctx: &Context,
        username: &str,
        password: &str,
    ) -> Result<Option<User>, CatalogError> {
        let user = self.with_connection(ctx, "login_user", |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, token, password_hash, created_at
                     FROM users WHERE username = ?1",
                    params![username],
                    user_from_row,
                )
                .optional()?)
        })?;

        Ok(user.filter(|user| self.credentials.verify(password, &user.password_hash)))
    }

    /// Resolve a session token to its user.
    ///
    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn authenticate_token(
        &self,
        ctx: &Context,
        token: &str,
    ) -> Result<Option<User>, CatalogError> {
        if token.is_empty() {
            ctx.check()?;
            return Ok(None);
        }

        self.with_connection(ctx, "authenticate_token", |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, username, token, password_hash, created_at
                     FROM users WHERE token = ?1",
                    params![token],
                    user_from_row,
                )
                .optional()?)
        })
    }

    /// Persist a recommendation with its ingredient links, then trim the
    /// pizzas table. The `record-recommendation` check point is consulted
    /// before anything is written.
    ///
    /// # Errors
    /// Returns the injected fault, cancellation, or storage errors (for example
    /// an unknown dough or ingredient id). No row is left behind on failure.
    pub fn record_recommendation(
        &self,
        ctx: &Context,
        pizza: NewPizza,
    ) -> Result<Pizza, CatalogError> {
        ctx.check()?;
        self.faults.check(ctx, checkpoints::RECORD_RECOMMENDATION)?;

        let policy = self.config.pizzas;
        let dough_id = pizza.dough.id;

        self.with_connection(ctx, "record_recommendation", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let created_at = OffsetDateTime::now_utc();
            tx.execute(
                "INSERT INTO pizzas(name, dough_id, tool, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![pizza.name, dough_id, pizza.tool, format_timestamp(created_at)?],
            )?;
            let id = PizzaId(tx.last_insert_rowid());

            {
                let mut link = tx.prepare(
                    "INSERT INTO pizza_ingredients(pizza_id, ingredient_id) VALUES (?1, ?2)",
                )?;
                for ingredient in &pizza.ingredients {
                    link.execute(params![id.0, ingredient.id])?;
                }
            }

            ctx.check()?;
            enforce_table_size_limits(&tx, BoundedTable::Pizzas, policy)?;
            ctx.check()?;
            tx.commit()?;

            let NewPizza { name, dough, ingredients, tool } = pizza;
            Ok(Pizza { id, name, dough, ingredients, tool, created_at })
        })
    }

    /// Persist a rating by `user_id`, then trim the ratings table.
    ///
    /// # Errors
    /// Returns validation, cancellation, or storage errors.
    pub fn record_rating(
        &self,
        ctx: &Context,
        user_id: UserId,
        rating: NewRating,
    ) -> Result<Rating, CatalogError> {
        ctx.check()?;
        rating.validate()?;
        let policy = self.config.ratings;

        self.with_connection(ctx, "record_rating", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let created_at = OffsetDateTime::now_utc();
            tx.execute(
                "INSERT INTO ratings(stars, pizza_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![rating.stars, rating.pizza_id.0, user_id.0, format_timestamp(created_at)?],
            )?;
            let id = tx.last_insert_rowid();

            ctx.check()?;
            enforce_table_size_limits(&tx, BoundedTable::Ratings, policy)?;
            ctx.check()?;
            tx.commit()?;

            Ok(Rating { id, stars: rating.stars, pizza_id: rating.pizza_id, user_id, created_at })
        })
    }

    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn get_ratings(&self, ctx: &Context, user_id: UserId) -> Result<Vec<Rating>, CatalogError> {
        self.with_connection(ctx, "get_ratings", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, stars, pizza_id, user_id, created_at
                 FROM ratings
                 WHERE user_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![user_id.0], |row| {
                Ok(Rating {
                    id: row.get(0)?,
                    stars: row.get(1)?,
                    pizza_id: PizzaId(row.get(2)?),
                    user_id: UserId(row.get(3)?),
                    created_at: timestamp_column(row, 4)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// Apply the configured retention policy to one table in its own
    /// transaction. Returns the number of rows deleted.
    ///
    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn enforce_limits(
        &self,
        ctx: &Context,
        table: BoundedTable,
    ) -> Result<usize, CatalogError> {
        let policy = self.config.policy(table);
        self.with_connection(ctx, "enforce_limits", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let deleted = enforce_table_size_limits(&tx, table, policy)?;
            tx.commit()?;
            Ok(deleted)
        })
    }

    /// # Errors
    /// Returns cancellation or storage errors.
    pub fn table_counts(&self, ctx: &Context) -> Result<TableCounts, CatalogError> {
        self.with_connection(ctx, "table_counts", |conn| {
            Ok(conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM users),
                    (SELECT COUNT(*) FROM pizzas),
                    (SELECT COUNT(*) FROM pizza_ingredients),
                    (SELECT COUNT(*) FROM ratings)",
                [],
                |row| {
                    Ok(TableCounts {
                        users: row.get(0)?,
                        pizzas: row.get(1)?,
                        pizza_ingredients: row.get(2)?,
                        ratings: row.get(3)?,
                    })
                },
            )?)
        })
    }

    /// Run `op` on the connection while watching `ctx`. A statement still
    /// running when the context is done is interrupted and its transaction
    /// rolls back; that interrupt is reported as [`CatalogError::Cancelled`].
    /// Any other storage failure is returned as is.
    fn with_connection<T, F>(
        &self,
        ctx: &Context,
        operation: &str,
        op: F,
    ) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CatalogError>,
    {
        ctx.check()?;
        let mut conn = self.conn.lock().map_err(|_| CatalogError::LockPoisoned)?;
        ctx.check()?;

        let watched = ctx.clone();
        conn.progress_handler(PROGRESS_POLL_STEPS, Some(move || watched.is_done()));
        let result = op(&mut *conn);
        conn.progress_handler(PROGRESS_POLL_STEPS, None::<fn() -> bool>);

        match result {
            Err(CatalogError::Storage(err)) if is_interrupt(&err) => match ctx.err() {
                Some(reason) => {
                    warn!(operation, %reason, "catalog operation interrupted");
                    Err(CatalogError::Cancelled(reason))
                }
                None => Err(CatalogError::Storage(err)),
            },
            Err(CatalogError::Cancelled(reason)) => {
                warn!(operation, %reason, "catalog operation cancelled");
                Err(CatalogError::Cancelled(reason))
            }
            other => other,
        }
    }
}

fn is_interrupt(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::OperationInterrupted
    )
}

/// Delete every row of `table` that is neither among the `maximum` most recent
/// rows nor protected by `id <= fixed`, in a single statement. A non-positive
/// `maximum` leaves the table alone.
///
/// Runs on whatever transaction `conn` belongs to, so callers can pair it with
/// the insert that made the table grow.
///
/// # Errors
/// Returns the underlying `SQLite` error when the delete fails.
pub fn enforce_table_size_limits(
    conn: &Connection,
    table: BoundedTable,
    policy: RetentionPolicy,
) -> Result<usize, rusqlite::Error> {
    if !policy.is_enforced() {
        return Ok(0);
    }

    let name = table.as_str();
    let deleted = conn.execute(
        &format!(
            "DELETE FROM {name}
             WHERE id > ?1
               AND id NOT IN (
                 SELECT id FROM {name} ORDER BY created_at DESC, id DESC LIMIT ?2
               )"
        ),
        params![policy.fixed, policy.maximum],
    )?;

    debug!(
        table = name,
        deleted,
        fixed = policy.fixed,
        maximum = policy.maximum,
        "enforced table size limits"
    );
    Ok(deleted)
}

struct PizzaHead {
    id: PizzaId,
    name: String,
    tool: String,
    created_at: OffsetDateTime,
    dough: Dough,
}

impl PizzaHead {
    fn into_pizza(self, ingredients: Vec<Ingredient>) -> Pizza {
        Pizza {
            id: self.id,
            name: self.name,
            dough: self.dough,
            ingredients,
            tool: self.tool,
            created_at: self.created_at,
        }
    }
}

fn open_connection(connection_string: &str) -> Result<Connection, rusqlite::Error> {
    let target = connection_string.strip_prefix("sqlite://").unwrap_or(connection_string);
    if target.is_empty() || target == ":memory:" {
        return Connection::open_in_memory();
    }
    Connection::open(target)
}

fn pizza_head_from_row(row: &Row<'_>) -> rusqlite::Result<PizzaHead> {
    Ok(PizzaHead {
        id: PizzaId(row.get(0)?),
        name: row.get(1)?,
        tool: row.get(2)?,
        created_at: timestamp_column(row, 3)?,
        dough: Dough { id: row.get(4)?, name: row.get(5)?, calories_per_slice: row.get(6)? },
    })
}

fn ingredient_from_row(row: &Row<'_>) -> rusqlite::Result<Ingredient> {
    Ok(Ingredient {
        id: row.get(0)?,
        name: row.get(1)?,
        calories_per_slice: row.get(2)?,
        vegetarian: row.get(3)?,
        ingredient_type: row.get(4)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId(row.get(0)?),
        username: row.get(1)?,
        token: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
    })
}

fn load_pizza_ingredients(
    conn: &Connection,
    pizza_id: PizzaId,
) -> rusqlite::Result<Vec<Ingredient>> {
    let mut stmt = conn.prepare_cached(
        "SELECT i.id, i.name, i.calories_per_slice, i.vegetarian, i.type
         FROM pizza_ingredients pi
         JOIN ingredients i ON i.id = pi.ingredient_id
         WHERE pi.pizza_id = ?1
         ORDER BY pi.rowid ASC",
    )?;
    let rows = stmt.query_map(params![pizza_id.0], ingredient_from_row)?;
    rows.collect()
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    OffsetDateTime::parse(&raw, &Rfc3339).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

pub(crate) fn format_timestamp(value: OffsetDateTime) -> Result<String, CatalogError> {
    let format = time::format_description::parse(TIMESTAMP_FORMAT)
        .map_err(|err| CatalogError::Corrupt(format!("invalid timestamp format: {err}")))?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| CatalogError::Corrupt(format!("failed to format timestamp: {err}")))
}
