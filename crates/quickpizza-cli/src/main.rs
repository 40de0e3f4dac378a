use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quickpizza_catalog_sqlite::SqliteCatalog;
use quickpizza_core::{
    ArmedCheckpoints, BoundedTable, CatalogConfig, Context, NewPizza, NewRating, NewUser, PizzaId,
    User, INGREDIENT_TYPES,
};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "qpc.v1";

#[derive(Debug, Parser)]
#[command(name = "qpc")]
#[command(about = "QuickPizza catalog CLI")]
struct Cli {
    /// Connection string, e.g. `sqlite:///var/lib/qpc.db` or `:memory:`.
    #[arg(long, env = "QUICKPIZZA_DB")]
    db: Option<String>,

    /// Abandon the command once this many milliseconds have passed.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Arm a fault injection check point, e.g. `get-ingredients`.
    #[arg(long = "inject-fault", value_name = "POINT")]
    inject_fault: Vec<String>,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    Pizza {
        #[command(subcommand)]
        command: PizzaCommand,
    },
    Rating {
        #[command(subcommand)]
        command: RatingCommand,
    },
    Ingredients(IngredientsArgs),
    Doughs,
    Tools,
    Prune(PruneArgs),
    Counts,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    Register(CredentialArgs),
    Login(CredentialArgs),
    Whoami(TokenArgs),
}

#[derive(Debug, Args)]
struct CredentialArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
}

#[derive(Debug, Args)]
struct TokenArgs {
    #[arg(long)]
    token: String,
}

#[derive(Debug, Subcommand)]
enum PizzaCommand {
    Record(RecordPizzaArgs),
    Show(ShowPizzaArgs),
    History(HistoryArgs),
}

#[derive(Debug, Args)]
struct RecordPizzaArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    dough_id: i64,
    #[arg(long = "ingredient", value_name = "ID")]
    ingredient_ids: Vec<i64>,
    #[arg(long)]
    tool: String,
}

#[derive(Debug, Args)]
struct ShowPizzaArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[arg(long, default_value_t = 10)]
    limit: u32,
}

#[derive(Debug, Subcommand)]
enum RatingCommand {
    Add(AddRatingArgs),
    List(TokenArgs),
}

#[derive(Debug, Args)]
struct AddRatingArgs {
    #[arg(long)]
    token: String,
    #[arg(long)]
    pizza_id: i64,
    #[arg(long)]
    stars: u8,
}

#[derive(Debug, Args)]
struct IngredientsArgs {
    #[arg(long = "type", value_name = "TYPE")]
    ingredient_type: String,
}

#[derive(Debug, Args)]
struct PruneArgs {
    /// Table to trim; every bounded table when omitted.
    #[arg(long, value_enum)]
    table: Option<TableArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TableArg {
    Users,
    Pizzas,
    Ratings,
}

impl From<TableArg> for BoundedTable {
    fn from(value: TableArg) -> Self {
        match value {
            TableArg::Users => Self::Users,
            TableArg::Pizzas => Self::Pizzas,
            TableArg::Ratings => Self::Ratings,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let mut config = CatalogConfig::from_env();
    if let Some(db) = cli.db.as_deref() {
        config = config.with_connection_string(db);
    }
    let ctx = match cli.timeout_ms {
        Some(millis) => Context::with_timeout(Duration::from_millis(millis)),
        None => Context::background(),
    };
    debug!(connection_string = %config.connection_string, "starting qpc");

    let Cli { command, inject_fault, .. } = cli;
    let catalog = || connect(config.clone(), &inject_fault);

    match command {
        Command::Db { command } => run_db(&command, &SqliteCatalog::open(config.clone())?),
        Command::User { command } => run_user(command, &catalog()?, &ctx),
        Command::Pizza { command } => run_pizza(command, &catalog()?, &ctx),
        Command::Rating { command } => run_rating(command, &catalog()?, &ctx),
        Command::Ingredients(args) => {
            let ingredients = catalog()?.get_ingredients(&ctx, &args.ingredient_type)?;
            emit_json(serde_json::json!({ "ingredients": ingredients }))
        }
        Command::Doughs => emit_json(serde_json::json!({ "doughs": catalog()?.get_doughs(&ctx)? })),
        Command::Tools => emit_json(serde_json::json!({ "tools": catalog()?.get_tools(&ctx)? })),
        Command::Prune(args) => run_prune(&args, &catalog()?, &ctx),
        Command::Counts => emit_json(serde_json::to_value(catalog()?.table_counts(&ctx)?)?),
    }
}

fn connect(config: CatalogConfig, faults: &[String]) -> Result<SqliteCatalog> {
    let catalog = SqliteCatalog::connect(config).context("failed to open catalog")?;
    if faults.is_empty() {
        return Ok(catalog);
    }

    let hook = Arc::new(ArmedCheckpoints::new());
    for point in faults {
        info!(point = %point, "arming fault injection check point");
        hook.arm(point.as_str(), format!("injected fault at {point}"));
    }
    Ok(catalog.with_fault_injector(hook))
}

fn run_db(command: &DbCommand, catalog: &SqliteCatalog) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(catalog),
        DbCommand::Migrate(args) => run_db_migrate(args, catalog),
    }
}

fn run_db_schema_version(catalog: &SqliteCatalog) -> Result<()> {
    let status = catalog.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, catalog: &SqliteCatalog) -> Result<()> {
    let before = catalog.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    let applied = catalog.migrate()?;
    let after = catalog.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": applied,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn user_json(user: &User) -> Value {
    serde_json::json!({
        "user": user,
        "token": user.token
    })
}

fn run_user(command: UserCommand, catalog: &SqliteCatalog, ctx: &Context) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let user = catalog.record_user(ctx, NewUser::new(args.username, args.password))?;
            emit_json(user_json(&user))
        }
        UserCommand::Login(args) => {
            match catalog.login_user(ctx, &args.username, &args.password)? {
                Some(user) => {
                    let mut payload = user_json(&user);
                    payload["authenticated"] = Value::Bool(true);
                    emit_json(payload)
                }
                None => emit_json(serde_json::json!({ "authenticated": false })),
            }
        }
        UserCommand::Whoami(args) => {
            let user = require_user(catalog, ctx, &args.token)?;
            emit_json(serde_json::json!({ "user": user }))
        }
    }
}

fn require_user(catalog: &SqliteCatalog, ctx: &Context, token: &str) -> Result<User> {
    catalog.authenticate_token(ctx, token)?.ok_or_else(|| anyhow!("unknown or expired token"))
}

fn run_pizza(command: PizzaCommand, catalog: &SqliteCatalog, ctx: &Context) -> Result<()> {
    match command {
        PizzaCommand::Record(args) => {
            let pizza = resolve_pizza(catalog, ctx, args)?;
            let recorded = catalog.record_recommendation(ctx, pizza)?;
            emit_json(serde_json::json!({
                "pizza": recorded,
                "calories_per_slice": recorded.total_calories_per_slice(),
                "vegetarian": recorded.is_vegetarian()
            }))
        }
        PizzaCommand::Show(args) => match catalog.get_recommendation(ctx, PizzaId(args.id))? {
            Some(pizza) => emit_json(serde_json::json!({ "pizza": pizza })),
            None => Err(anyhow!("pizza {} not found", args.id)),
        },
        PizzaCommand::History(args) => {
            let pizzas = catalog.get_history(ctx, args.limit)?;
            emit_json(serde_json::json!({ "pizzas": pizzas }))
        }
    }
}

fn resolve_pizza(
    catalog: &SqliteCatalog,
    ctx: &Context,
    args: RecordPizzaArgs,
) -> Result<NewPizza> {
    let dough = catalog
        .get_doughs(ctx)?
        .into_iter()
        .find(|dough| dough.id == args.dough_id)
        .ok_or_else(|| anyhow!("unknown dough id {}", args.dough_id))?;

    let tools = catalog.get_tools(ctx)?;
    if !tools.contains(&args.tool) {
        return Err(anyhow!("unknown tool {:?}; expected one of {tools:?}", args.tool));
    }

    let mut known = Vec::new();
    for ingredient_type in INGREDIENT_TYPES {
        known.extend(catalog.get_ingredients(ctx, ingredient_type)?);
    }
    let ingredients = args
        .ingredient_ids
        .iter()
        .map(|id| {
            known
                .iter()
                .find(|ingredient| ingredient.id == *id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown ingredient id {id}"))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(NewPizza { name: args.name, dough, ingredients, tool: args.tool })
}

fn run_rating(command: RatingCommand, catalog: &SqliteCatalog, ctx: &Context) -> Result<()> {
    match command {
        RatingCommand::Add(args) => {
            let user = require_user(catalog, ctx, &args.token)?;
            let rating = catalog.record_rating(
                ctx,
                user.id,
                NewRating { stars: args.stars, pizza_id: PizzaId(args.pizza_id) },
            )?;
            emit_json(serde_json::json!({ "rating": rating }))
        }
        RatingCommand::List(args) => {
            let user = require_user(catalog, ctx, &args.token)?;
            let ratings = catalog.get_ratings(ctx, user.id)?;
            emit_json(serde_json::json!({ "ratings": ratings }))
        }
    }
}

fn run_prune(args: &PruneArgs, catalog: &SqliteCatalog, ctx: &Context) -> Result<()> {
    let tables = match args.table {
        Some(table) => vec![BoundedTable::from(table)],
        None => BoundedTable::ALL.to_vec(),
    };

    let mut deleted = serde_json::Map::new();
    for table in tables {
        let count = catalog.enforce_limits(ctx, table)?;
        deleted.insert(table.as_str().to_string(), Value::from(count));
    }
    emit_json(serde_json::json!({ "deleted": deleted }))
}
