// SPDX-FileCopyrightText: © 2024 Technical University of Munich, Chair of Connected Mobility
// SPDX-License-Identifier: MIT

use clap::Parser;

#[derive(Debug, clap::Parser)]
#[command(long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
    #[arg(short, long, default_value_t = String::from("deploy.toml"))]
    config_file: String,
    #[arg(short, long, default_value_t = String::from(""))]
    template: String,
    /// Name of the operator, used in the logs.
    #[arg(long, default_value_t = String::from("operator"))]
    subject: String,
    /// Print the version number and quit.
    #[arg(long, default_value_t = false)]
    version: bool,
}

#[derive(Debug, clap::Args)]
struct FunctionArgs {
    #[arg(long)]
    tenant: String,
    #[arg(long)]
    boundary: String,
    #[arg(long)]
    function: String,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Create or update a function from a JSON specification file.
    Put {
        #[command(flatten)]
        function: FunctionArgs,
        spec_file: String,
        /// Wait for an asynchronous build for this long, 0 to not wait.
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },
    Get {
        #[command(flatten)]
        function: FunctionArgs,
    },
    Wait {
        #[command(flatten)]
        function: FunctionArgs,
        build_id: String,
        #[arg(long, default_value_t = 30000)]
        timeout_ms: u64,
    },
    Delete {
        #[command(flatten)]
        function: FunctionArgs,
    },
    List {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        boundary: Option<String>,
        /// One of: only, exclude.
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        count: Option<usize>,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Show the status of a build, without waiting.
    Build {
        #[command(flatten)]
        function: FunctionArgs,
        build_id: String,
    },
}

fn read_conf_from_file(filename: &str) -> anyhow::Result<edgeless_deploy::EdgelessDeploySettings> {
    Ok(toml::from_str::<edgeless_deploy::EdgelessDeploySettings>(&std::fs::read_to_string(filename)?)?)
}

fn identity(args: &FunctionArgs) -> anyhow::Result<edgeless_deploy::identity::FunctionIdentity> {
    Ok(edgeless_deploy::identity::FunctionIdentity::new(&args.tenant, &args.boundary, &args.function)?)
}

fn cron_filter(value: &Option<String>) -> anyhow::Result<Option<edgeless_deploy::listing::CronFilter>> {
    match value.as_deref() {
        None => Ok(None),
        Some("only") => Ok(Some(edgeless_deploy::listing::CronFilter::Only)),
        Some("exclude") => Ok(Some(edgeless_deploy::listing::CronFilter::Exclude)),
        Some(value) => anyhow::bail!("invalid cron filter: {}", value),
    }
}

// Print the status code together with the error returned by the pipeline.
fn report(err: edgeless_deploy::error::PipelineError) -> anyhow::Error {
    anyhow::anyhow!("{} {}", err.status_code(), err)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    if args.version {
        println!(
            "{}.{}.{}{}{}",
            env!("CARGO_PKG_VERSION_MAJOR"),
            env!("CARGO_PKG_VERSION_MINOR"),
            env!("CARGO_PKG_VERSION_PATCH"),
            if env!("CARGO_PKG_VERSION_PRE").is_empty() { "" } else { "-" },
            env!("CARGO_PKG_VERSION_PRE")
        );
        return Ok(());
    }

    // Create a template configuration and exit.
    if !args.template.is_empty() {
        edgeless_deploy::create_template(&args.template, edgeless_deploy::edgeless_deploy_default_conf().as_str())?;
        return Ok(());
    }

    let command = match args.command {
        Some(command) => command,
        None => anyhow::bail!("no command given, see --help"),
    };

    let conf = read_conf_from_file(&args.config_file)?;
    if matches!(conf.store.kind, edgeless_deploy::StoreKind::Memory) {
        log::warn!("in-memory artifact store: nothing survives this command");
    }
    let artifact_store = edgeless_deploy::artifact_store(&conf.store).await?;
    let (deploy, build_task) = edgeless_deploy::edgeless_deploy_init(&conf, artifact_store, std::sync::Arc::new(edgeless_deploy::authz::AllowAll {}));
    let _build_task = tokio::spawn(build_task);

    let actor = |tenant_id: &str| edgeless_deploy::authz::Actor {
        subject: args.subject.clone(),
        tenant_id: tenant_id.to_string(),
        read_only: false,
    };

    match command {
        Commands::Put { function, spec_file, wait_ms } => {
            let id = identity(&function)?;
            let specification = edgeless_deploy::specification::Specification::from_json(&std::fs::read_to_string(&spec_file)?).map_err(report)?;
            let outcome = deploy
                .orchestrator
                .create_or_update(&id, &specification, &actor(&function.tenant))
                .await
                .map_err(report)?;
            match outcome {
                edgeless_deploy::orchestrator::DeployOutcome::Deployed { version, location } => {
                    println!("200 version {} at {}", version, location)
                }
                edgeless_deploy::orchestrator::DeployOutcome::Unchanged { version, location } => {
                    println!("204 unchanged version {} at {}", version, location)
                }
                edgeless_deploy::orchestrator::DeployOutcome::Accepted { build_id, location } => {
                    println!("201 build {} for {}", build_id, location);
                    if wait_ms > 0 {
                        let deployment = deploy
                            .orchestrator
                            .wait_for_function_build(&id, &build_id, std::time::Duration::from_millis(wait_ms), &actor(&function.tenant))
                            .await
                            .map_err(report)?;
                        println!("200 version {} at {}", deployment.version, deployment.location);
                    }
                }
            }
        }
        Commands::Get { function } => {
            let record = deploy
                .orchestrator
                .get_function(&identity(&function)?, &actor(&function.tenant))
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Wait {
            function,
            build_id,
            timeout_ms,
        } => {
            let deployment = deploy
                .orchestrator
                .wait_for_function_build(
                    &identity(&function)?,
                    &build_id,
                    std::time::Duration::from_millis(timeout_ms),
                    &actor(&function.tenant),
                )
                .await
                .map_err(report)?;
            println!("200 version {} at {}", deployment.version, deployment.location);
        }
        Commands::Delete { function } => {
            deploy
                .orchestrator
                .delete_function(&identity(&function)?, &actor(&function.tenant))
                .await
                .map_err(report)?;
            println!("204");
        }
        Commands::List {
            tenant,
            boundary,
            cron,
            count,
            cursor,
        } => {
            let response = deploy
                .listing
                .list(
                    &tenant,
                    boundary.as_deref(),
                    edgeless_deploy::listing::ListRequest {
                        cron_filter: cron_filter(&cron)?,
                        count,
                        cursor,
                    },
                )
                .await
                .map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Build { function, build_id } => {
            match deploy
                .orchestrator
                .get_build(&identity(&function)?, &build_id, &actor(&function.tenant))
                .await
                .map_err(report)?
            {
                edgeless_deploy::orchestrator::BuildState::Pending { progress } => {
                    println!("201 pending {:.0}%", progress * 100.0)
                }
                edgeless_deploy::orchestrator::BuildState::Completed(deployment) => {
                    println!("200 version {} at {}", deployment.version, deployment.location)
                }
            }
        }
    }

    Ok(())
}
