//! Emits the PostgreSQL schema for one actor name: a `commands`, `events`,
//! `id_map`, `links` and `snapshots` table, namespaced by the actor name so
//! every actor type gets its own set.
//!
//! ```text
//! sourcerer-schema player
//! sourcerer-schema player --output ./migrations
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

const TEMPLATE: &str = include_str!("../sql/create_actor_schema.sql");

/// Generates the PostgreSQL tables a `sourcerer` actor needs to persist
/// commands, events, id mappings, parent/child links and snapshots.
#[derive(Parser, Debug)]
#[command(name = "sourcerer-schema", version, about)]
struct Args {
    /// The actor's type name, e.g. "Player". Lower-cased to build table
    /// names (`player_commands`, `player_events`, ...).
    actor_name: String,

    /// Directory to write `<actor_name>.sql` into. Prints to stdout when
    /// omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn render(actor_name: &str) -> String {
    let table_name = actor_name.to_lowercase();
    TEMPLATE.replace("{{actor_name}}", &table_name)
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.actor_name.trim().is_empty() {
        eprintln!("error: actor name must not be empty");
        return ExitCode::FAILURE;
    }

    let schema = render(&args.actor_name);

    match args.output {
        Some(dir) => {
            let path = dir.join(format!("{}.sql", args.actor_name.to_lowercase()));
            if let Err(err) = fs::create_dir_all(&dir) {
                eprintln!("error: could not create {}: {err}", dir.display());
                return ExitCode::FAILURE;
            }
            if let Err(err) = fs::write(&path, schema) {
                eprintln!("error: could not write {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
            println!("wrote {}", path.display());
        }
        None => print!("{schema}"),
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_lowercased_actor_name_everywhere() {
        let rendered = render("Player");
        assert!(rendered.contains("player_commands"));
        assert!(rendered.contains("player_events"));
        assert!(rendered.contains("player_id_map"));
        assert!(rendered.contains("player_links"));
        assert!(rendered.contains("player_snapshots"));
        assert!(!rendered.contains("{{actor_name}}"));
    }
}
