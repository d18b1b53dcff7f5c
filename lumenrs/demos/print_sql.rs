use std::{env, fs, path::PathBuf, str::FromStr};

use lumen::{DbType, QueryCompiler, QueryRequest, SourceRegistry};

fn usage() {
    eprintln!("Usage: print_sql <sources_dir> <request_json> [postgresql|mysql|mssql]");
    eprintln!("Example: cargo run --example print_sql -- demos/sources demos/requests/revenue_by_region.json mssql");
}

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let sources_dir = PathBuf::from(args.remove(0));
    let request_path = PathBuf::from(args.remove(0));
    let db_type = match args.first() {
        Some(name) => DbType::from_str(name)?,
        None => DbType::Postgresql,
    };

    let registry = SourceRegistry::load_from_dir(sources_dir)?;
    let request: QueryRequest = serde_json::from_str(&fs::read_to_string(request_path)?)?;
    let source = registry
        .get_source(&request.source)
        .ok_or_else(|| anyhow::anyhow!("unknown source {}", request.source))?;

    let compiled = QueryCompiler::default().compile(source, &request, db_type.dialect())?;
    println!("{}", compiled.sql);
    for calc in &compiled.plan.calculated {
        println!("-- computed after fetch: {} = {}", calc.key, calc.expression);
    }
    Ok(())
}
