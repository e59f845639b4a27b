use chrono::{DateTime, Utc};
use processflow::config::Config;
use processflow::db;
use processflow::processes::{
    AsynchronousProcess, ClientDispatcher, ClientProcess, Operation, PgJobQueue, PgProcessRepo,
    ProcessRepository,
};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use std::env;
use std::sync::Arc;
use uuid::Uuid;

const DISPATCH_USAGE: &str = "dispatch <resource_type> [operation] [resource_id]";

const USAGE: &str = "pflowctl <command>\n\
     Commands:\n\
     - show <process_id>\n\
     - list [resource_type]\n\
     - dispatch <resource_type> [create|update|delete] [resource_id]\n\
     \n\
     Uses DATABASE_URL and the PFLOW_* settings.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    processflow::telemetry::init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let cfg = Config::from_env()?;
    let pool = db::make_pool(&cfg.database_url).await?;

    match command.as_str() {
        "show" => {
            let id: Uuid = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: pflowctl show <process_id>"))?
                .parse()?;
            show(&pool, id).await?;
        }
        "list" => list(&pool, &cfg.api_name, args.get(2).map(String::as_str)).await?,
        "dispatch" => {
            let resource_type = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: pflowctl {}", DISPATCH_USAGE))?;
            let operation: Operation = match args.get(3) {
                Some(op) => op.parse()?,
                None => Operation::Create,
            };
            dispatch(&pool, &cfg, resource_type, operation, args.get(4).map(String::as_str))
                .await?;
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn print_process(p: &ClientProcess) {
    println!(
        "PROCESS: id={} api={} type={} resource_id={} status={} attempts={} tries={} \
         timeout={} timeout_at={} completed_at={} location={}",
        p.id(),
        p.api(),
        p.resource_type(),
        p.resource_id().unwrap_or("-"),
        p.status().as_str(),
        p.attempts(),
        p.tries().map_or_else(|| "-".to_string(), |t| t.to_string()),
        p.timeout().map_or_else(|| "-".to_string(), |t| format!("{t}s")),
        p.timeout_at().map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
        p.completed_at().map_or_else(|| "-".to_string(), |t| t.to_rfc3339()),
        p.location().unwrap_or_else(|| "-".to_string()),
    );
}

async fn show(pool: &PgPool, id: Uuid) -> anyhow::Result<()> {
    let process = PgProcessRepo::new(pool.clone()).find(id).await?;
    print_process(&process);

    #[derive(FromRow)]
    struct JobRow {
        id: Uuid,
        queue: String,
        job_type: String,
        status: String,
        run_at: DateTime<Utc>,
        locked_by: Option<String>,
        updated_at: DateTime<Utc>,
    }

    let jobs: Vec<JobRow> = sqlx::query_as(
        r#"
        SELECT id, queue, job_type, status, run_at, locked_by, updated_at
        FROM process_jobs
        WHERE client_process_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    for j in jobs {
        println!(
            "{} | job {} | queue={} type={} status={} run_at={} locked_by={}",
            j.updated_at.to_rfc3339(),
            j.id,
            j.queue,
            j.job_type,
            j.status,
            j.run_at.to_rfc3339(),
            j.locked_by.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

async fn list(pool: &PgPool, api: &str, resource_type: Option<&str>) -> anyhow::Result<()> {
    let processes = match resource_type {
        Some(rt) => PgProcessRepo::new(pool.clone()).list(api, rt, 50).await?,
        None => {
            sqlx::query_as::<_, ClientProcess>(
                r#"
                SELECT * FROM client_processes
                WHERE api = $1
                ORDER BY created_at DESC
                LIMIT 50
                "#,
            )
            .bind(api)
            .fetch_all(pool)
            .await?
        }
    };

    if processes.is_empty() {
        println!("no processes");
    }
    for p in &processes {
        print_process(p);
    }
    Ok(())
}

async fn dispatch(
    pool: &PgPool,
    cfg: &Config,
    resource_type: &str,
    operation: Operation,
    resource_id: Option<&str>,
) -> anyhow::Result<()> {
    if operation != Operation::Create && resource_id.is_none() {
        anyhow::bail!("{operation} needs a resource_id");
    }

    let dispatcher = ClientDispatcher::new(
        Arc::new(PgProcessRepo::new(pool.clone())),
        Arc::new(PgJobQueue::new(pool.clone())),
        Arc::new(cfg.registry()?),
        cfg.api_name.clone(),
        cfg.queue.clone(),
    );

    let mut data = json!({ "type": resource_type });
    if let Some(id) = resource_id {
        data["id"] = json!(id);
    }

    let process = dispatcher
        .dispatch(resource_type, resource_id, operation, json!({ "data": data }))
        .await?;

    println!("+ dispatched {}:{} process={}", resource_type, operation, process.id());
    print_process(&process);
    Ok(())
}
