#![deny(
    anonymous_parameters,
    deprecated_in_future,
    explicit_outlives_requirements,
    keyword_idents,
    macro_use_extern_crate,
    non_ascii_idents,
    path_statements,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_allocation,
    unused_import_braces,
    unused_imports,
    unused_must_use,
    unused_mut,
    while_true,
)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;

mod cli;
mod commands;
mod config;
mod consts;
mod dispatcher;
mod joblog;
mod lifespan;
mod provider;
mod storage;
mod store;
mod util;
mod workflow;

use crate::config::*;
use crate::util::progress::ProgressBars;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    debug!("Debugging enabled");

    let cli = cli::cli();
    let cli = cli.get_matches();

    let mut config = ::config::Config::default();
    let config_file = cli
        .value_of("config")
        .map(PathBuf::from)
        .or_else(|| {
            let default = PathBuf::from("kiln.toml");
            default.is_file().then_some(default)
        });
    if let Some(file) = config_file {
        config
            .merge(::config::File::from(file.clone()))
            .with_context(|| anyhow!("Loading configuration from {}", file.display()))?;
    }
    config
        .merge(::config::Environment::with_prefix("KILN"))
        .context("Overlaying KILN_* environment variables")?;

    let config: Arc<Configuration> = Arc::new(
        config
            .try_into::<NotValidatedConfiguration>()
            .context("Deserializing configuration")?
            .validate()
            .context("Validating configuration")?,
    );

    let hide_bars = cli.is_present("hide_bars") || crate::util::stdout_is_pipe();
    let progressbars = ProgressBars::setup(
        config.progress_format().clone(),
        config.spinner_format().clone(),
        hide_bars,
    );

    match cli.subcommand() {
        Some(("generate-completions", matches)) => generate_completions(matches),
        Some(("serve", _)) => crate::commands::serve(config).await?,
        Some(("dispatch-once", _)) => crate::commands::dispatch_once(config).await?,
        Some(("job", matches)) => crate::commands::job(matches, config.clone()).await?,
        Some(("experiment", matches)) => crate::commands::experiment(matches, &config).await?,
        Some(("provider", matches)) => crate::commands::provider(matches, &config).await?,
        Some(("workflow", matches)) => crate::commands::workflow(matches, &config).await?,
        Some(("store", matches)) => {
            crate::commands::store(matches, &config, progressbars).await?
        }
        Some((other, _)) => return Err(anyhow!("Unknown subcommand: {}", other)),
        None => return Err(anyhow!("No subcommand")),
    }

    Ok(())
}

fn generate_completions(matches: &clap::ArgMatches) {
    use clap_complete::generate;
    use clap_complete::shells::{Bash, Elvish, Fish, Zsh};

    let mut app = cli::cli();
    let appname = "kiln";
    let mut stdout = std::io::stdout();
    match matches.value_of("shell") {
        Some("bash") => generate(Bash, &mut app, appname, &mut stdout),
        Some("elvish") => generate(Elvish, &mut app, appname, &mut stdout),
        Some("fish") => generate(Fish, &mut app, appname, &mut stdout),
        Some("zsh") => generate(Zsh, &mut app, appname, &mut stdout),
        _ => generate(Bash, &mut app, appname, &mut stdout),
    }
}
