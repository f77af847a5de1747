use super::helpers::print_json;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::Path;
use vmh_common::config::{ConfigWarning, HarnessConfig, LoadedConfig, Severity, validate_config as validate};

/// Unchecked: both commands report validation problems themselves.
fn load(path: Option<&Path>) -> Result<LoadedConfig> {
    HarnessConfig::load_unchecked(path).map_err(|err| {
        let code = err.code().code_string();
        anyhow::Error::new(err).context(format!("[{code}] cannot load configuration"))
    })
}

#[derive(Serialize)]
struct ConfigShow<'a> {
    path: Option<String>,
    config: &'a HarnessConfig,
    sources: &'a [vmh_common::config::ConfigValueSource],
    warnings: &'a [ConfigWarning],
}

pub fn show_config(path: Option<&Path>, json: bool) -> Result<()> {
    let loaded = load(path)?;
    let warnings = validate(&loaded.config);

    if json {
        return print_json(&ConfigShow {
            path: loaded.path.as_ref().map(|p| p.display().to_string()),
            config: &loaded.config,
            sources: &loaded.sources,
            warnings: &warnings,
        });
    }

    match &loaded.path {
        Some(p) => println!("# file: {}", p.display()),
        None => println!("# file: none (defaults)"),
    }
    let width = loaded.sources.iter().map(|s| s.key.len()).max().unwrap_or(0);
    for row in &loaded.sources {
        let origin = match &row.env_var {
            Some(var) => format!("{} ({var})", row.source),
            None => row.source.to_string(),
        };
        println!("{:<width$}  {:<24}  {origin}", row.key, row.value);
    }
    println!();
    print!(
        "{}",
        toml::to_string_pretty(&loaded.config).context("cannot render configuration as TOML")?
    );
    for warning in &warnings {
        eprintln!("{warning}");
    }
    Ok(())
}

pub fn validate_config(path: Option<&Path>, json: bool) -> Result<()> {
    let loaded = load(path)?;
    let warnings = validate(&loaded.config);
    if json {
        print_json(&warnings)?;
    } else if warnings.is_empty() {
        println!("configuration ok");
    } else {
        for warning in &warnings {
            println!("{warning}");
        }
    }
    let errors = warnings.iter().filter(|w| w.severity == Severity::Error).count();
    if errors > 0 {
        bail!("{errors} configuration error(s)");
    }
    Ok(())
}
