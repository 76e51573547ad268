use std::env;
use std::sync::Arc;

use dispatchflow::api::models::JobView;
use dispatchflow::config::Config;
use dispatchflow::db;
use dispatchflow::intake::{Intake, ThreadRequest};
use dispatchflow::jobs::{JobStatus, JobsRepo};
use dispatchflow::scripts::ScriptRegistry;
use uuid::Uuid;

const USAGE: &str = "dispatchctl <command>\n\
     Commands:\n\
     - migrate\n\
     - open <issue> <script> <subject> [--pr]\n\
     - reply <issue> <author> <body...>\n\
     - reset <job_id> [--orphaned]\n\
     - status <job_id>\n\
     - queue-status\n\
     - scripts\n\
     \n\
     --orphaned fails a job left RUNNING by a stopped worker before\n\
     requeueing it. Only use it while no worker is running.\n\
     \n\
     Reads the same DISPATCH_* environment as the worker.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprint!("{USAGE}");
        std::process::exit(2);
    }

    let cfg = Config::from_env()?;
    let registry = Arc::new(ScriptRegistry::load(cfg.script_registry_path.as_deref())?);

    if args[1] == "scripts" {
        for name in registry.names() {
            if let Some(info) = registry.get(name) {
                let params: Vec<&str> = info.arguments.iter().map(|a| a.param.as_str()).collect();
                println!("{name:<28} {:?} [{}] {}", info.output, params.join(", "), info.description);
            }
        }
        return Ok(());
    }

    let pool = db::make_pool(&cfg.database_url).await?;
    let jobs = JobsRepo::with_policy(pool.clone(), cfg.contention_policy());
    let intake = Intake::new(jobs.clone(), registry.clone(), cfg.bot_name.clone());

    match args[1].as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "open" => {
            let (Some(issue), Some(script), Some(subject)) = (args.get(2), args.get(3), args.get(4))
            else {
                anyhow::bail!("usage: dispatchctl open <issue> <script> <subject> [--pr]");
            };
            let req = ThreadRequest {
                issue_number: issue.parse()?,
                script_name: script.clone(),
                subject: subject.clone(),
                create_pull_request: args.iter().skip(5).any(|a| a == "--pr"),
            };
            print_json(&intake.open_thread(&req).await?)?;
        }
        "reply" => {
            let (Some(issue), Some(author)) = (args.get(2), args.get(3)) else {
                anyhow::bail!("usage: dispatchctl reply <issue> <author> <body...>");
            };
            let body = args[4..].join(" ");
            print_json(&intake.comment(issue.parse()?, author, &body, None).await?)?;
        }
        "reset" => {
            let job_id = job_id_arg(&args, "reset")?;
            if args.iter().skip(3).any(|a| a == "--orphaned") {
                jobs.fail_orphaned(job_id).await?;
            }
            let job = jobs
                .get_job(job_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {job_id} not found"))?;
            jobs.reset(job_id, job.issue().restarted()).await?;
            println!("job {job_id} is PENDING again");
        }
        "status" => {
            let job_id = job_id_arg(&args, "status")?;
            match jobs.get_job(job_id).await? {
                Some(job) => print_json(&JobView::from(&job))?,
                None => anyhow::bail!("job {job_id} not found"),
            }
        }
        "queue-status" => {
            println!("queue_size={}", jobs.count().await?);
            for status in JobStatus::ALL {
                let ids = jobs.ids_by_status(status).await?;
                println!("{:<9} {}", status.as_str(), ids.len());
                for id in ids {
                    println!("  {id}");
                }
            }
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn job_id_arg(args: &[String], command: &str) -> anyhow::Result<Uuid> {
    let raw = args
        .get(2)
        .ok_or_else(|| anyhow::anyhow!("usage: dispatchctl {command} <job_id>"))?;
    Ok(raw.parse()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
