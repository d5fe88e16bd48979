//! Supervisory command interface.
//!
//! One JSON command per line in, one JSON response per line out. The
//! supervisor owns the HV enable signal; everything else it can only read.

use crate::status::{StatusRegistry, StatusReport};
use crate::telemetry::now_ms;
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

pub const MAX_COMMAND_SIZE: usize = 512;
pub const MAX_RESPONSE_SIZE: usize = 1024;

pub type CommandBuffer = ArrayString<MAX_COMMAND_SIZE>;
pub type ResponseBuffer = ArrayString<MAX_RESPONSE_SIZE>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    /// Request (or withdraw the request for) HV.
    SetEnable { on: bool },
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Acknowledged,
    NegativeAck,
    InvalidCommand,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub report: Option<StatusReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message exceeds buffer size")]
    MessageTooLarge,
    #[error("Serialization failed")]
    SerializationError,
    #[error("Invalid command")]
    InvalidCommand,
}

#[derive(Debug)]
pub struct CommandHandler {
    registry: Arc<StatusRegistry>,
    command_buffer: CommandBuffer,
    response_buffer: ResponseBuffer,
    commands_handled: u32,
}

impl CommandHandler {
    pub fn new(registry: Arc<StatusRegistry>) -> Self {
        Self {
            registry,
            command_buffer: ArrayString::new(),
            response_buffer: ArrayString::new(),
            commands_handled: 0,
        }
    }

    pub fn commands_handled(&self) -> u32 {
        self.commands_handled
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<Command, SupervisorError> {
        self.command_buffer.clear();
        self.command_buffer
            .try_push_str(json_str.trim())
            .map_err(|_| SupervisorError::MessageTooLarge)?;
        serde_json::from_str::<Command>(&self.command_buffer).map_err(|_| SupervisorError::InvalidJson)
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), SupervisorError> {
        if command.id == 0 {
            return Err(SupervisorError::InvalidCommand);
        }
        Ok(())
    }

    pub fn create_response(
        &self,
        id: u32,
        status: ResponseStatus,
        message: Option<&str>,
        report: Option<StatusReport>,
    ) -> CommandResponse {
        CommandResponse {
            id,
            timestamp: now_ms(),
            status,
            message: message.map(str::to_owned),
            report,
        }
    }

    pub fn execute(&mut self, command: Command) -> CommandResponse {
        self.commands_handled = self.commands_handled.wrapping_add(1);
        match command.command_type {
            CommandType::Ping => {
                self.create_response(command.id, ResponseStatus::Acknowledged, Some("pong"), None)
            }
            CommandType::SetEnable { on: true } if self.registry.is_inhibited() => {
                warn!(id = command.id, "HV enable refused, controller inhibited");
                self.create_response(
                    command.id,
                    ResponseStatus::NegativeAck,
                    Some("HV inhibited after contactor controller failure"),
                    Some(self.registry.report()),
                )
            }
            CommandType::SetEnable { on } => {
                info!(id = command.id, on, "Supervisor set HV enable");
                self.registry.set_enable(on);
                self.create_response(command.id, ResponseStatus::Acknowledged, None, Some(self.registry.report()))
            }
            CommandType::Status => {
                self.create_response(command.id, ResponseStatus::Acknowledged, None, Some(self.registry.report()))
            }
        }
    }

    pub fn serialize_response(&mut self, response: &CommandResponse) -> Result<&str, SupervisorError> {
        self.response_buffer.clear();
        let json_str = serde_json::to_string(response).map_err(|_| SupervisorError::SerializationError)?;
        self.response_buffer
            .try_push_str(&json_str)
            .map_err(|_| SupervisorError::MessageTooLarge)?;
        Ok(self.response_buffer.as_str())
    }

    /// Parse, run and answer one line. Malformed input gets an
    /// `InvalidCommand` response rather than an error.
    pub fn handle_line(&mut self, line: &str) -> Result<&str, SupervisorError> {
        let parsed = self.parse_command(line);
        let response = match parsed {
            Ok(command) => match self.validate_command(&command) {
                Ok(()) => self.execute(command),
                Err(e) => self.create_response(command.id, ResponseStatus::InvalidCommand, Some(&e.to_string()), None),
            },
            Err(e) => {
                warn!(error = %e, "Rejected supervisory command");
                self.create_response(0, ResponseStatus::InvalidCommand, Some(&e.to_string()), None)
            }
        };
        self.serialize_response(&response)
    }
}

/// Accept supervisory connections until the task is aborted. Each client
/// gets its own [`CommandHandler`] over the shared registry.
pub async fn serve(listener: TcpListener, registry: Arc<StatusRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!(%addr, "Supervisor connected");
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        warn!(%addr, error = %e, "Supervisor connection error");
                    }
                    info!(%addr, "Supervisor disconnected");
                });
            }
            Err(e) => error!(error = %e, "Failed to accept connection"),
        }
    }
}

/// Answer one line per command until the peer hangs up.
pub async fn handle_connection(stream: TcpStream, registry: Arc<StatusRegistry>) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut handler = CommandHandler::new(registry);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let response = match handler.handle_line(&line) {
            Ok(json) => json.to_owned(),
            Err(e) => {
                error!(error = %e, "Failed to build supervisory response");
                continue;
            }
        };
        writer.write_all(response.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}
