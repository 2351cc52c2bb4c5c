//
// Copyright (c) 2020-2022 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use clap::crate_authors;
use clap::crate_version;
use clap::Arg;
use clap::Command;

fn org_arg() -> Arg<'static> {
    Arg::new("org")
        .required(false)
        .long("org")
        .takes_value(true)
        .value_name("ORG_ID")
        .help("Scope the workspace to an organization")
}

pub fn cli() -> Command<'static> {
    Command::new("kiln")
        .author(crate_authors!())
        .version(crate_version!())
        .about("ML experiment orchestration: job scheduling, compute providers and workspace state")
        .subcommand_required(true)
        .arg_required_else_help(true)

        .arg(Arg::new("hide_bars")
            .required(false)
            .long("hide-bars")
            .takes_value(false)
            .help("Hide all progress bars")
        )

        .arg(Arg::new("config")
            .required(false)
            .long("config")
            .takes_value(true)
            .value_name("FILE")
            .help("Path to the configuration file (defaults to ./kiln.toml if present)")
        )

        .subcommand(Command::new("generate-completions")
            .about("Generate and print commandline completions")
            .arg(Arg::new("shell")
                .possible_values(["bash", "elvish", "fish", "zsh"])
                .default_value("bash")
                .required(false)
                .help("Shell to generate completions for")
            )
        )

        .subcommand(Command::new("serve")
            .about("Run the dispatcher loop: poll running jobs and drain the queue")
            .arg(org_arg())
        )

        .subcommand(Command::new("dispatch-once")
            .about("Drain at most one job from the queue, then exit")
        )

        .subcommand(Command::new("job")
            .about("Inspect and manage jobs")
            .subcommand_required(true)
            .subcommand(Command::new("list")
                .about("List jobs of an experiment")
                .arg(org_arg())
                .arg(Arg::new("experiment")
                    .required(true)
                    .long("experiment")
                    .short('e')
                    .takes_value(true)
                    .value_name("EXPERIMENT")
                    .help("Experiment to list jobs for")
                )
                .arg(Arg::new("type")
                    .required(false)
                    .long("type")
                    .takes_value(true)
                    .value_name("TYPE")
                    .help("Filter by job type (TRAIN, EVAL, GENERATE, ...)")
                )
                .arg(Arg::new("status")
                    .required(false)
                    .long("status")
                    .takes_value(true)
                    .value_name("STATUS")
                    .help("Filter by job status (QUEUED, RUNNING, COMPLETE, ...)")
                )
            )
            .subcommand(Command::new("submit")
                .about("Create a job and queue it for the dispatcher")
                .arg(org_arg())
                .arg(Arg::new("experiment")
                    .required(true)
                    .long("experiment")
                    .short('e')
                    .takes_value(true)
                    .value_name("EXPERIMENT")
                    .help("Experiment the job belongs to")
                )
                .arg(Arg::new("type")
                    .required(true)
                    .long("type")
                    .takes_value(true)
                    .value_name("TYPE")
                    .help("Job type (TRAIN, EVAL, GENERATE, EXPORT, DIFFUSION, TASK)")
                )
                .arg(Arg::new("job_data")
                    .required(false)
                    .long("job-data")
                    .takes_value(true)
                    .value_name("JSON|@FILE")
                    .help("Job data as inline JSON or @path to a JSON file")
                )
            )
            .subcommand(Command::new("show")
                .about("Print a job document")
                .arg(org_arg())
                .arg(Arg::new("job_id").required(true).takes_value(true))
            )
            .subcommand(Command::new("stop")
                .about("Stop a job: set the stop flag and terminate its local run")
                .arg(org_arg())
                .arg(Arg::new("job_id").required(true).takes_value(true))
            )
            .subcommand(Command::new("delete")
                .about("Mark a job DELETED")
                .arg(org_arg())
                .arg(Arg::new("job_id").required(true).takes_value(true))
            )
            .subcommand(Command::new("logs")
                .about("Print or follow a job's log")
                .arg(org_arg())
                .arg(Arg::new("job_id").required(true).takes_value(true))
                .arg(Arg::new("tail")
                    .required(false)
                    .long("tail")
                    .short('n')
                    .takes_value(true)
                    .value_name("LINES")
                    .help("Only the last N lines")
                )
                .arg(Arg::new("follow")
                    .required(false)
                    .long("follow")
                    .short('f')
                    .takes_value(false)
                    .help("Keep the log open and stream new lines")
                )
                .arg(Arg::new("provider")
                    .required(false)
                    .long("provider")
                    .takes_value(false)
                    .help("Fetch the logs from the compute provider the job ran on")
                )
            )
            .subcommand(Command::new("artifacts")
                .about("List the artifact files of a job")
                .arg(org_arg())
                .arg(Arg::new("job_id").required(true).takes_value(true))
            )
        )

        .subcommand(Command::new("experiment")
            .about("Inspect and manage experiments")
            .subcommand_required(true)
            .subcommand(Command::new("list")
                .about("List experiments")
                .arg(org_arg())
            )
            .subcommand(Command::new("create")
                .about("Create an experiment")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
            )
            .subcommand(Command::new("delete")
                .about("Delete an experiment and all of its jobs")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
                .arg(Arg::new("yes")
                    .required(false)
                    .long("yes")
                    .takes_value(false)
                    .help("Skip the confirmation prompt")
                )
            )
            .subcommand(Command::new("rebuild-index")
                .about("Rebuild the experiment's jobs.json index synchronously")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
            )
        )

        .subcommand(Command::new("provider")
            .about("Inspect compute providers")
            .subcommand_required(true)
            .subcommand(Command::new("list")
                .about("List configured providers and their liveness")
                .arg(org_arg())
            )
            .subcommand(Command::new("check")
                .about("Probe one provider")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
            )
            .subcommand(Command::new("status")
                .about("Cluster status on a provider")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
                .arg(Arg::new("cluster").required(true).takes_value(true))
            )
            .subcommand(Command::new("resources")
                .about("Cluster resources on a provider")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
                .arg(Arg::new("cluster").required(true).takes_value(true))
            )
            .subcommand(Command::new("clusters")
                .about("Detailed cluster and node listing for a provider")
                .arg(org_arg())
                .arg(Arg::new("name").required(true).takes_value(true))
            )
        )

        .subcommand(Command::new("workflow")
            .about("Run and inspect workflows")
            .subcommand_required(true)
            .subcommand(Command::new("create")
                .about("Create a workflow from a node graph definition")
                .arg(org_arg())
                .arg(Arg::new("workflow_id").required(true).takes_value(true))
                .arg(Arg::new("name")
                    .required(false)
                    .long("name")
                    .takes_value(true)
                    .value_name("NAME")
                    .help("Human-readable workflow name (defaults to the id)")
                )
                .arg(Arg::new("experiment")
                    .required(true)
                    .long("experiment")
                    .short('e')
                    .takes_value(true)
                    .value_name("EXPERIMENT")
                )
                .arg(Arg::new("nodes")
                    .required(true)
                    .long("nodes")
                    .takes_value(true)
                    .value_name("JSON|@FILE")
                    .help("Node graph as inline JSON or @path to a JSON file")
                )
            )
            .subcommand(Command::new("run")
                .about("Start a run of a workflow")
                .arg(org_arg())
                .arg(Arg::new("workflow_id").required(true).takes_value(true))
                .arg(Arg::new("experiment")
                    .required(true)
                    .long("experiment")
                    .short('e')
                    .takes_value(true)
                    .value_name("EXPERIMENT")
                )
            )
            .subcommand(Command::new("advance")
                .about("Advance a workflow run by one engine step")
                .arg(org_arg())
                .arg(Arg::new("run_id").required(true).takes_value(true))
            )
            .subcommand(Command::new("cancel")
                .about("Cancel a workflow run and stop its active jobs")
                .arg(org_arg())
                .arg(Arg::new("run_id").required(true).takes_value(true))
                .arg(Arg::new("experiment")
                    .required(true)
                    .long("experiment")
                    .short('e')
                    .takes_value(true)
                    .value_name("EXPERIMENT")
                )
            )
            .subcommand(Command::new("show")
                .about("Print a workflow run document")
                .arg(org_arg())
                .arg(Arg::new("run_id").required(true).takes_value(true))
            )
        )

        .subcommand(Command::new("store")
            .about("Workspace store maintenance")
            .subcommand_required(true)
            .subcommand(Command::new("migrate")
                .about("Collapse legacy snapshot documents to single index.json files")
                .arg(org_arg())
            )
        )
}
