use sqlsession::config::{load_config, SessionConfig};
use sqlsession::core::db::query::{Params, Value};
use sqlsession::core::Result;
use sqlsession::session::{ExecuteOptions, Session};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: sqlsession [--config FILE] [--db PATH] [--dict] [--commit] [--debug] SQL [PARAM...]";

/// Parsed command line
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config: Option<String>,
    database: Option<String>,
    as_dict: bool,
    commit: bool,
    debug: bool,
    sql: String,
    params: Vec<Value>,
}

fn parse_args(args: &[String]) -> std::result::Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut rest = args.iter();
    let mut sql = None;

    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" => cli.config = Some(rest.next().ok_or("--config needs a file")?.clone()),
            "--db" => cli.database = Some(rest.next().ok_or("--db needs a path")?.clone()),
            "--dict" => cli.as_dict = true,
            "--commit" => cli.commit = true,
            "--debug" => cli.debug = true,
            flag if flag.starts_with("--") && sql.is_none() => return Err(format!("unknown option {}", flag)),
            _ if sql.is_none() => sql = Some(arg.clone()),
            _ => cli.params.push(parse_param(arg)),
        }
    }

    cli.sql = sql.ok_or_else(|| USAGE.to_string())?;
    Ok(cli)
}

/// Integers and reals are bound as numbers, `null` as NULL, anything else as text.
fn parse_param(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        Value::Null
    } else if let Ok(i) = raw.parse::<i64>() {
        Value::Integer(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Real(f)
    } else {
        Value::from(raw)
    }
}

fn run(cli: CliArgs) -> Result<String> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SessionConfig::default(),
    };
    if let Some(db) = cli.database {
        config.database.name = db;
    }

    let mut session = Session::open(config)?;
    let options = ExecuteOptions {
        as_dict: cli.as_dict,
        debug: cli.debug,
        ..ExecuteOptions::default()
    };
    let params = if cli.params.is_empty() {
        Params::None
    } else {
        Params::Positional(cli.params)
    };
    let output = session.execute(&cli.sql, params, &options)?;
    if cli.commit {
        session.commit()?;
    }
    session.close();
    Ok(serde_json::to_string(&output)?)
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{}", msg);
            return ExitCode::from(2);
        }
    };

    info!(sql = %cli.sql, "running statement");
    match run(cli) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
