use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{prefix}-{}", ulid::Ulid::new()));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_qpc<I, S>(envs: &[(&str, &str)], args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(env!("CARGO_BIN_EXE_qpc"));
    command.env_remove("QUICKPIZZA_DB").env_remove("RUST_LOG");
    for (key, value) in envs {
        command.env(key, value);
    }
    command
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute qpc binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json_with_env<I, S>(envs: &[(&str, &str)], args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_qpc(envs, args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "qpc command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    run_json_with_env(&[], args)
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_qpc(&[], args);
    assert!(
        !output.status.success(),
        "qpc command unexpectedly succeeded:\nstdout:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

#[test]
fn db_commands_report_and_apply_migrations() {
    let sandbox = unique_temp_dir("quickpizza-cli-db");
    let db = sandbox.join("catalog.sqlite3");

    let before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "qpc.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(as_array(&dry_run, "would_apply_versions").len(), 2);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);
    assert_eq!(migrate.get("up_to_date"), Some(&Value::Bool(true)));

    let again = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert!(as_array(&again, "applied_versions").is_empty());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn user_register_login_and_whoami() {
    let sandbox = unique_temp_dir("quickpizza-cli-users");
    let db = sandbox.join("catalog.sqlite3");
    let db = path_str(&db);

    let registered =
        run_json(["--db", db, "user", "register", "--username", "ana", "--password", "pw"]);
    let token = as_str(&registered, "token").to_string();
    assert_eq!(token.len(), 16);
    let user = registered.get("user").unwrap_or_else(|| panic!("missing user: {registered}"));
    assert!(user.get("password_hash").is_none());
    assert!(user.get("token").is_none());

    let login = run_json(["--db", db, "user", "login", "--username", "ana", "--password", "pw"]);
    assert_eq!(login.get("authenticated"), Some(&Value::Bool(true)));
    assert_eq!(as_str(&login, "token"), token);

    let rejected =
        run_json(["--db", db, "user", "login", "--username", "ana", "--password", "nope"]);
    assert_eq!(rejected.get("authenticated"), Some(&Value::Bool(false)));

    let whoami = run_json(["--db", db, "user", "whoami", "--token", token.as_str()]);
    let whoami_user = whoami.get("user").unwrap_or_else(|| panic!("missing user: {whoami}"));
    assert_eq!(as_str(whoami_user, "username"), "ana");

    let stderr = run_failure([
        "--db", db, "user", "register", "--username", "default", "--password", "pw",
    ]);
    assert!(stderr.contains("username field is invalid"), "stderr was: {stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn database_location_can_come_from_environment() {
    let sandbox = unique_temp_dir("quickpizza-cli-env-db");
    let db = sandbox.join("catalog.sqlite3");
    let envs = [("QUICKPIZZA_DB", path_str(&db))];

    run_json_with_env(&envs, ["user", "register", "--username", "env", "--password", "pw"]);
    assert!(db.exists(), "catalog file was not created at {}", db.display());

    let login = run_json([
        "--db",
        path_str(&db),
        "user",
        "login",
        "--username",
        "env",
        "--password",
        "pw",
    ]);
    assert_eq!(login.get("authenticated"), Some(&Value::Bool(true)));

    let schema = run_json_with_env(&envs, ["db", "schema-version"]);
    assert_eq!(as_i64(&schema, "current_version"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn reference_data_is_listed() {
    let doughs = run_json(["doughs"]);
    assert_eq!(as_array(&doughs, "doughs").len(), 5);

    let tools = run_json(["tools"]);
    assert_eq!(as_array(&tools, "tools").len(), 4);

    let toppings = run_json(["ingredients", "--type", "topping"]);
    for ingredient in as_array(&toppings, "ingredients") {
        assert_eq!(as_str(ingredient, "type"), "topping");
    }
}

#[test]
fn pizza_record_show_history_and_rating() {
    let sandbox = unique_temp_dir("quickpizza-cli-pizza");
    let db = sandbox.join("catalog.sqlite3");
    let db = path_str(&db);

    let recorded = run_json([
        "--db",
        db,
        "pizza",
        "record",
        "--name",
        "Marinara",
        "--dough-id",
        "1",
        "--ingredient",
        "4",
        "--ingredient",
        "1",
        "--tool",
        "Knife",
    ]);
    let pizza = recorded.get("pizza").unwrap_or_else(|| panic!("missing pizza: {recorded}"));
    let pizza_id = as_i64(pizza, "id");
    assert_eq!(as_array(pizza, "ingredients").len(), 2);
    assert_eq!(recorded.get("vegetarian"), Some(&Value::Bool(true)));

    let shown = run_json(["--db", db, "pizza", "show", "--id", &pizza_id.to_string()]);
    let shown_pizza = shown.get("pizza").unwrap_or_else(|| panic!("missing pizza: {shown}"));
    assert_eq!(as_str(shown_pizza, "name"), "Marinara");

    let history = run_json(["--db", db, "pizza", "history", "--limit", "5"]);
    assert_eq!(as_array(&history, "pizzas").len(), 1);

    let stderr = run_failure(["--db", db, "pizza", "show", "--id", "9999"]);
    assert!(stderr.contains("pizza 9999 not found"), "stderr was: {stderr}");

    let registered =
        run_json(["--db", db, "user", "register", "--username", "critic", "--password", "pw"]);
    let token = as_str(&registered, "token").to_string();
    let rating = run_json([
        "--db",
        db,
        "rating",
        "add",
        "--token",
        token.as_str(),
        "--pizza-id",
        &pizza_id.to_string(),
        "--stars",
        "5",
    ]);
    assert_eq!(rating.get("rating").map(|rating| as_i64(rating, "stars")), Some(5));

    let ratings = run_json(["--db", db, "rating", "list", "--token", token.as_str()]);
    assert_eq!(as_array(&ratings, "ratings").len(), 1);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn users_table_is_bounded_by_environment_limits() {
    let sandbox = unique_temp_dir("quickpizza-cli-bounded");
    let db = sandbox.join("catalog.sqlite3");
    let db = path_str(&db);
    let envs = [("QUICKPIZZA_DB_FIXED_USERS", "1"), ("QUICKPIZZA_DB_MAX_USERS", "2")];

    for name in ["first", "second", "third", "fourth"] {
        run_json_with_env(
            &envs,
            ["--db", db, "user", "register", "--username", name, "--password", "pw"],
        );
    }

    let counts = run_json_with_env(&envs, ["--db", db, "counts"]);
    assert_eq!(as_i64(&counts, "users"), 3);

    let first = run_json_with_env(
        &envs,
        ["--db", db, "user", "login", "--username", "first", "--password", "pw"],
    );
    assert_eq!(first.get("authenticated"), Some(&Value::Bool(true)));
    let second = run_json_with_env(
        &envs,
        ["--db", db, "user", "login", "--username", "second", "--password", "pw"],
    );
    assert_eq!(second.get("authenticated"), Some(&Value::Bool(false)));

    let tighter = [("QUICKPIZZA_DB_FIXED_USERS", "0"), ("QUICKPIZZA_DB_MAX_USERS", "1")];
    let pruned = run_json_with_env(&tighter, ["--db", db, "prune", "--table", "users"]);
    let deleted = pruned.get("deleted").unwrap_or_else(|| panic!("missing deleted: {pruned}"));
    assert_eq!(as_i64(deleted, "users"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn armed_check_point_fails_the_command() {
    let stderr =
        run_failure(["--inject-fault", "get-ingredients", "ingredients", "--type", "tomato"]);
    assert!(stderr.contains("injected fault at get-ingredients"), "stderr was: {stderr}");

    let unaffected = run_json(["--inject-fault", "get-ingredients", "doughs"]);
    assert_eq!(as_array(&unaffected, "doughs").len(), 5);
}
