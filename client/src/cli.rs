use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    AckResponse, BlockedList, ErrorBody, HealthResponse, StatsSnapshot, StopResponse, WorkerInfo,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para operar el coordinador")]
struct Cli {
    /// URL base del coordinador
    #[arg(long, env = "COORDINATOR_URL", default_value = "http://localhost:8080", global = true)]
    coordinator: String,

    /// Secreto compartido del coordinador
    #[arg(long, env = "COORDINATOR_TOKEN", global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lista los workers registrados
    Workers,
    /// Muestra las estadísticas agregadas
    Stats,
    /// Encola una tarea para un worker (pisa la que tuviera pendiente)
    Enqueue {
        #[arg(value_name = "WORKER")]
        worker: String,
        #[arg(value_name = "TAREA")]
        task: String,
        #[arg(value_name = "SEGUNDOS")]
        duration: u64,
        /// Etiqueta opaca que acompaña a la tarea
        #[arg(long)]
        resource: Option<String>,
    },
    /// Pide a todos los workers (o a uno) que paren
    Stop {
        #[arg(long)]
        worker: Option<String>,
    },
    /// Bloquea un worker y lo saca del registro
    Block {
        #[arg(value_name = "WORKER")]
        worker: String,
    },
    /// Quita un worker de la lista de bloqueados
    Unblock {
        #[arg(value_name = "WORKER")]
        worker: String,
    },
    /// Lista los workers bloqueados
    Blocked,
    /// Chequea que el coordinador esté vivo
    Health,
}

struct Api {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl Api {
    fn get(&self, path: &str) -> RequestBuilder {
        let req = self.client.get(format!("{}{}", self.base_url, path));
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("error {}: {}", status, body.error),
        Err(_) => bail!("error {}", status),
    }
}

fn print_worker(w: &WorkerInfo) {
    println!("Worker {}", w.worker_id);
    println!("  registrado     : {}", w.registered_at);
    println!(
        "  last_seen      : {} s ago ({})",
        w.last_seen_secs_ago,
        if w.online { "online" } else { "offline" }
    );
    println!(
        "  pendiente      : comando={}, stop={}",
        w.has_pending_command, w.stop_pending
    );
    println!(
        "  tareas         : completadas={}, units={}",
        w.tasks_completed, w.units_reported
    );
    match w.cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
    println!();
}

fn print_stats(s: &StatsSnapshot) {
    println!("Stats:");
    println!(
        "  workers        : registrados={}, online={}, bloqueados={}",
        s.workers_registered, s.workers_online, s.workers_blocked
    );
    println!(
        "  throughput     : actual={}/s, pico={}/s",
        s.current_throughput, s.peak_throughput
    );
    println!(
        "  por minuto     : último={}, pico={}",
        s.units_last_minute, s.peak_units_per_minute
    );
    println!(
        "  totales        : units={}, reportes={}, tareas={}, stops={}",
        s.total_units, s.total_reports, s.tasks_issued, s.stops_issued
    );
    match s.mean_latency_ms {
        Some(ms) => println!("  latencia media : {:.1} ms", ms),
        None => println!("  latencia media : (sin datos)"),
    }
    for (task, n) in &s.by_task_type {
        println!("  tarea {:<10}: {}", task, n);
    }
    for (resource, n) in &s.by_resource {
        println!("  recurso {:<8}: {}", resource, n);
    }
    println!("  uptime         : {} s", s.uptime_secs);
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let api = Api {
        client: Client::new(),
        base_url: cli.coordinator.trim_end_matches('/').to_string(),
        token: cli.token,
    };

    match cli.command {
        Commands::Workers => {
            let workers: Vec<WorkerInfo> = parse(api.get("/workers").send().await?).await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in &workers {
                print_worker(w);
            }
        }

        Commands::Stats => {
            let stats: StatsSnapshot = parse(api.get("/stats").send().await?).await?;
            print_stats(&stats);
        }

        Commands::Enqueue {
            worker,
            task,
            duration,
            resource,
        } => {
            let duration = duration.to_string();
            let mut query = vec![
                ("worker", worker.as_str()),
                ("task", task.as_str()),
                ("duration", duration.as_str()),
            ];
            if let Some(r) = resource.as_deref() {
                query.push(("resource", r));
            }
            let ack: AckResponse = parse(api.get("/enqueue").query(&query).send().await?).await?;
            println!("{}", ack.message);
        }

        Commands::Stop { worker: Some(worker) } => {
            let ack: AckResponse =
                parse(api.get("/stop-worker").query(&[("worker", &worker)]).send().await?).await?;
            println!("{}", ack.message);
        }

        Commands::Stop { worker: None } => {
            let resp: StopResponse = parse(api.get("/stop").send().await?).await?;
            println!("Stop encolado para {} workers", resp.workers);
        }

        Commands::Block { worker } => {
            let ack: AckResponse =
                parse(api.get("/block").query(&[("worker", &worker)]).send().await?).await?;
            println!("{}", ack.message);
        }

        Commands::Unblock { worker } => {
            let ack: AckResponse =
                parse(api.get("/unblock").query(&[("worker", &worker)]).send().await?).await?;
            println!("{}", ack.message);
        }

        Commands::Blocked => {
            let list: BlockedList = parse(api.get("/blocked").send().await?).await?;
            if list.blocked.is_empty() {
                println!("No hay workers bloqueados.");
            }
            for w in list.blocked {
                println!("  - {}", w);
            }
        }

        Commands::Health => {
            let health: HealthResponse = parse(api.get("/health").send().await?).await?;
            println!("{} (uptime {} s)", health.status, health.uptime_secs);
        }
    }

    Ok(())
}
