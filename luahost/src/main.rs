use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use luahost_core::{closure, closure1, from_table, Lua, Ref, Scope, Table};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Print the chunk's returned table as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a lua script file
    Run { script: PathBuf },
    /// Evaluate an inline chunk of lua code
    Eval { code: String },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let lua = Lua::new();
    register_host_api(&lua);

    match cli.command {
        Cmd::Run { script } => {
            let code = fs::read_to_string(&script)
                .with_context(|| format!("failed to read {}", script.display()))?;
            let name = script
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "<script>".into());
            run_chunk(&lua, &name, &code, cli.json)?;
        }
        Cmd::Eval { code } => run_chunk(&lua, "<eval>", &code, cli.json)?,
    }
    Ok(())
}

fn register_host_api(lua: &Lua) {
    lua.set(
        Scope::Global,
        "host_log",
        closure1(|_, msg: Ref<String>| log::info!("{msg}")),
    );
    lua.set(
        Scope::Global,
        "host_clock",
        closure(|_| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        }),
    );
}

fn run_chunk(lua: &Lua, name: &str, code: &str, json: bool) -> Result<()> {
    if json {
        let ret: Option<Ref<Table>> = lua
            .execute_named_string(name, code)
            .with_context(|| format!("error running {name}"))?;
        let ret = ret.context("chunk did not return a table")?;
        let value: serde_json::Value = from_table(&ret)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        lua.execute_named_string::<()>(name, code)
            .with_context(|| format!("error running {name}"))?;
    }
    Ok(())
}
