use clap::{App, AppSettings, Arg, SubCommand};
use colored::*;
use hvbmu::supervisor::{Command, CommandType};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvbmu-ctl")
        .version("0.1.0")
        .about("Supervisory client for the HV battery monitor")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("Check the monitor is responsive"))
        .subcommand(SubCommand::with_name("status").about("Show safety flags and contactor state"))
        .subcommand(
            SubCommand::with_name("enable")
                .about("Request or withdraw HV")
                .arg(
                    Arg::with_name("state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let json = matches.value_of("format") == Some("json");

    let command_type = match matches.subcommand() {
        ("ping", _) => CommandType::Ping,
        ("status", _) => CommandType::Status,
        ("enable", Some(sub)) => CommandType::SetEnable {
            on: sub.value_of("state") == Some("on"),
        },
        _ => return Ok(()),
    };

    let response = send_command(host, port, &Command { id: 1, command_type }).await?;
    if json {
        println!("{}", response);
    } else {
        print_response(&response)?;
    }
    Ok(())
}

async fn send_command(host: &str, port: u16, command: &Command) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect((host, port)).await.map_err(|e| {
        eprintln!("{} Failed to connect to {}:{}", "error:".red().bold(), host, port);
        if e.kind() == std::io::ErrorKind::ConnectionRefused {
            eprintln!("  start the simulator with {}", "hvbmu-sim".bright_cyan());
        }
        e
    })?;
    let mut line = serde_json::to_string(command)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    let n = tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut response)).await??;
    if n == 0 {
        return Err("monitor closed the connection".into());
    }
    Ok(response.trim_end().to_owned())
}

fn print_response(response: &str) -> Result<(), Box<dyn std::error::Error>> {
    let parsed: serde_json::Value = serde_json::from_str(response)?;
    let status = parsed["status"].as_str().unwrap_or("Unknown");
    match status {
        "Acknowledged" => println!("{}", "ACK".bright_green().bold()),
        other => println!("{} {}", other.bright_red().bold(), parsed["message"].as_str().unwrap_or("")),
    }
    if let Some(message) = parsed["message"].as_str().filter(|_| status == "Acknowledged") {
        println!("{}", message);
    }

    let report = &parsed["report"];
    if report.is_null() {
        return Ok(());
    }
    let on_off = |v: &serde_json::Value| {
        if v.as_bool() == Some(true) {
            "ON".bright_green()
        } else {
            "OFF".dimmed()
        }
    };
    println!("{:<12} {}", "Enable:".bright_white(), on_off(&report["enable"]));
    let contactor = report["contactor"].as_str().unwrap_or("?");
    let contactor = if contactor == "Closed" {
        contactor.bright_yellow().bold()
    } else {
        contactor.normal()
    };
    println!("{:<12} {}", "Contactor:".bright_white(), contactor);
    if report["inhibited"].as_bool() == Some(true) {
        println!("{:<12} {}", "Inhibited:".bright_white(), "YES".red().bold());
    }
    if let Some(flags) = report["safety"].as_object() {
        for (metric, ok) in flags {
            let state = if ok.as_bool() == Some(true) {
                "ok".green()
            } else {
                "NOT OK".red().bold()
            };
            println!("  {:<10} {}", metric, state);
        }
    }
    Ok(())
}
