use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Operator CLI for the STF cell twin.
#[derive(Parser)]
#[command(name = "stf", version, about = "🏭 STF cell twin - warehouse cell control")]
struct Cli {
    /// Twin edge host
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,
    /// Twin edge port
    #[arg(long, global = true, default_value_t = 8000)]
    port: u16,
    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store a new cookie in the warehouse
    Store {
        /// Cookie flavor (CHOCO, VANILLA, STRAWBERRY)
        #[arg(long, default_value = "CHOCO")]
        flavor: String,
        /// Target slot (A1..C3); first empty slot when omitted
        #[arg(long)]
        slot: Option<String>,
    },
    /// Retrieve the cookie from a slot
    Retrieve {
        /// Slot to empty (A1..C3)
        slot: String,
    },
    /// Bake a RAW_DOUGH cookie
    Process {
        /// Source slot; auto-selects the lowest RAW_DOUGH slot when omitted
        #[arg(long)]
        slot: Option<String>,
        /// Flavor filter for auto-selection
        #[arg(long)]
        flavor: Option<String>,
    },
    /// Show slot occupancy
    Inventory,
    /// Show device snapshots
    Hardware,
    /// Show recent queue rows
    Commands,
    /// Show recent alerts
    Alerts,
    /// Queue a RESET (highest priority; also resumes after an emergency)
    Reset,
    /// Broadcast an emergency stop
    EmergencyStop,
    /// Liveness and dependency check
    Health,
    /// Poll live state at an interval
    Monitor {
        /// Refresh interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        refresh: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client {
        host: cli.host.clone(),
        port: cli.port,
        json: cli.json,
    };

    match cli.command {
        Command::Store { flavor, slot } => {
            let body = serde_json::json!({"flavor": flavor, "slot": slot});
            let (status, value) = client.post("/order/store", Some(body)).await?;
            client.print_order("STORE", status, &value);
        }
        Command::Retrieve { slot } => {
            let body = serde_json::json!({"slot": slot});
            let (status, value) = client.post("/order/retrieve", Some(body)).await?;
            client.print_order("RETRIEVE", status, &value);
        }
        Command::Process { slot, flavor } => {
            let body = serde_json::json!({"slot": slot, "flavor": flavor});
            let (status, value) = client.post("/order/process", Some(body)).await?;
            client.print_order("PROCESS", status, &value);
        }
        Command::Inventory => {
            let (_, value) = client.get("/inventory").await?;
            if client.json {
                println!("{value}");
            } else {
                print_inventory(&value);
            }
        }
        Command::Hardware => {
            let (_, value) = client.get("/hardware/states").await?;
            if client.json {
                println!("{value}");
            } else {
                print_hardware(&value);
            }
        }
        Command::Commands => {
            let (_, value) = client.get("/commands").await?;
            if client.json {
                println!("{value}");
            } else {
                print_commands(&value);
            }
        }
        Command::Alerts => {
            let (_, value) = client.get("/alerts").await?;
            if client.json {
                println!("{value}");
            } else {
                print_alerts(&value);
            }
        }
        Command::Reset => {
            let (status, value) = client.post("/maintenance/reset", None).await?;
            client.print_order("RESET", status, &value);
        }
        Command::EmergencyStop => {
            let (status, _) = client.post("/maintenance/emergency-stop", None).await?;
            if status == 200 {
                println!("{} {}", "🛑".red(), "emergency stop broadcast".bright_red().bold());
            } else {
                println!("{} emergency stop failed (HTTP {status})", "❌".red());
            }
        }
        Command::Health => {
            let (_, value) = client.get("/health").await?;
            if client.json {
                println!("{value}");
            } else {
                let ok = value["ok"].as_bool().unwrap_or(false);
                let badge = if ok { "OK".bright_green() } else { "DEGRADED".bright_red() };
                println!("{badge}  store={} bus={} emergency={}",
                    value["deps"]["store"], value["deps"]["bus"], value["emergency"]);
            }
        }
        Command::Monitor { refresh } => {
            println!("{}", "📡 monitoring cell state (Ctrl+C to stop)".bright_blue().bold());
            loop {
                let (_, hw) = client.get("/hardware/states").await?;
                print_monitor_line(&hw);
                tokio::time::sleep(Duration::from_millis(refresh)).await;
            }
        }
    }

    Ok(())
}

struct Client {
    host: String,
    port: u16,
    json: bool,
}

impl Client {
    async fn get(&self, path: &str) -> Result<(u16, Value), Box<dyn std::error::Error>> {
        self.request("GET", path, None).await
    }

    async fn post(
        &self,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), Box<dyn std::error::Error>> {
        self.request("POST", path, body).await
    }

    /// Minimal HTTP/1.1 exchange over a fresh connection, the same way the
    /// simulator's line protocol client works.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = match TcpStream::connect(&addr).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{} cannot reach the twin at {}", "❌".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} start it with: {}", "💡".yellow(), "stf-server".bright_cyan());
                }
                return Err(e.into());
            }
        };

        let payload = body.map(|b| b.to_string()).unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
            self.host,
            payload.len(),
        );
        stream.write_all(request.as_bytes()).await?;

        let mut raw = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw)).await??;
        let text = String::from_utf8_lossy(&raw);

        let status: u16 = text
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body_text = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b)
            .unwrap_or_default();
        let value = parse_http_body(body_text);
        Ok((status, value))
    }

    fn print_order(&self, action: &str, status: u16, value: &Value) {
        if self.json {
            println!("{value}");
            return;
        }
        if (200..300).contains(&status) {
            let id = value["command_id"].as_i64().unwrap_or(0);
            let slot = value["slot"].as_str().unwrap_or("-");
            println!(
                "{} {} queued as command {} {}",
                "✅".green(),
                action.bright_white().bold(),
                id.to_string().bright_cyan(),
                format!("(slot {slot})").dimmed()
            );
        } else {
            let detail = value["detail"].as_str().unwrap_or("request rejected");
            println!("{} {} failed: {}", "❌".red(), action.bright_white(), detail.bright_red());
        }
    }
}

/// Tolerate chunked transfer encoding: grab the JSON between the first
/// brace/bracket and the last.
fn parse_http_body(body: &str) -> Value {
    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if e >= s => {
            serde_json::from_str(&body[s..=e]).unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

fn print_inventory(value: &Value) {
    println!("{}", "📦 Inventory".bright_blue().bold());
    let Some(slots) = value.as_array() else { return };
    for slot in slots {
        let name = slot["slot"].as_str().unwrap_or("?");
        match slot["cookie_status"].as_str() {
            Some(status) => {
                let flavor = slot["cookie_flavor"].as_str().unwrap_or("?");
                let status_str = match status {
                    "RAW_DOUGH" => status.yellow(),
                    "BAKED" => status.bright_green(),
                    _ => status.normal(),
                };
                println!("  {} {} {}", name.bright_white(), flavor.bright_cyan(), status_str);
            }
            None => println!("  {} {}", name.bright_white(), "empty".dimmed()),
        }
    }
}

fn print_hardware(value: &Value) {
    println!("{}", "🔧 Hardware".bright_blue().bold());
    let Some(devices) = value.as_array() else { return };
    for dev in devices {
        let id = dev["device"].as_str().unwrap_or("?");
        let status = dev["status"].as_str().unwrap_or("?");
        let pos = &dev["position"];
        let status_str = match status {
            "IDLE" => status.bright_green(),
            "MOVING" => status.bright_yellow(),
            "EMERGENCY" | "ERROR" => status.bright_red(),
            _ => status.normal(),
        };
        println!(
            "  {:<9} {:<10} at ({:>6.1}, {:>6.1}, {:>6.1})  {:>7.2} W",
            id.bright_white(),
            status_str,
            pos[0].as_f64().unwrap_or(0.0),
            pos[1].as_f64().unwrap_or(0.0),
            pos[2].as_f64().unwrap_or(0.0),
            dev["total_power_watts"].as_f64().unwrap_or(0.0),
        );
    }
}

fn print_commands(value: &Value) {
    println!("{}", "🗂  Commands".bright_blue().bold());
    let Some(rows) = value.as_array() else { return };
    for row in rows {
        let status = row["status"].as_str().unwrap_or("?");
        let status_str = match status {
            "COMPLETED" => status.bright_green(),
            "FAILED" => status.bright_red(),
            "IN_PROGRESS" => status.bright_yellow(),
            _ => status.normal(),
        };
        println!(
            "  #{:<5} {:<14} {:<12} {}",
            row["id"].as_i64().unwrap_or(0),
            row["kind"].as_str().unwrap_or("?"),
            status_str,
            row["result"].as_str().unwrap_or("").dimmed(),
        );
    }
}

fn print_alerts(value: &Value) {
    println!("{}", "⚠️  Alerts".bright_blue().bold());
    let Some(rows) = value.as_array() else { return };
    for row in rows {
        let severity = row["severity"].as_str().unwrap_or("?");
        let sev_str = match severity {
            "CRITICAL" => severity.bright_red().bold(),
            "HIGH" => severity.bright_red(),
            "MEDIUM" => severity.bright_yellow(),
            _ => severity.normal(),
        };
        println!(
            "  {:<9} {:<16} {}",
            sev_str,
            row["alert_type"].as_str().unwrap_or("?"),
            row["message"].as_str().unwrap_or(""),
        );
    }
}

fn print_monitor_line(hw: &Value) {
    let Some(devices) = hw.as_array() else { return };
    let mut parts = Vec::new();
    for dev in devices {
        let id = dev["device"].as_str().unwrap_or("?");
        let status = dev["status"].as_str().unwrap_or("?");
        let badge = match status {
            "IDLE" => status.green(),
            "MOVING" => status.yellow(),
            _ => status.red(),
        };
        parts.push(format!("{id}:{badge}"));
    }
    println!("{}", parts.join("  "));
}
