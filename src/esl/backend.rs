//! [`PlaybackBackend`] over the FreeSWITCH event socket.
//!
//! Each command checks a connection out of a small idle pool, or opens a new
//! one when the pool is empty, and returns it after a clean reply. No lock is
//! held while a command is on the wire, so a slow reply for one call never
//! holds up commands for another. A command abandoned mid-reply (attempt
//! timeout) drops its socket rather than leaving an unread reply behind.

use crate::config::{EslConfig, ForkConfig};
use crate::esl::connection::EslConnection;
use crate::esl::protocol::{EslError, EslMessage};
use crate::playback::backend::{BackendFuture, PlaybackBackend, PlaybackError};
use crate::playback::executor::PlaybackMechanism;
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Idle connections kept for reuse; extra ones are closed on return.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// One outbound ESL request.
#[derive(Debug, Clone, PartialEq)]
pub enum EslCommand {
    Api(String),
    Execute { app: String, arg: String },
}

/// Start command for each playback mechanism.
pub fn play_command(mechanism: PlaybackMechanism, session_id: &str, file_path: &str) -> EslCommand {
    match mechanism {
        PlaybackMechanism::Broadcast => {
            EslCommand::Api(format!("uuid_broadcast {} {} aleg", session_id, file_path))
        }
        PlaybackMechanism::Displace => {
            EslCommand::Api(format!("uuid_displace {} start {} 0 mux", session_id, file_path))
        }
        PlaybackMechanism::Playback => EslCommand::Execute {
            app: "playback".to_string(),
            arg: file_path.to_string(),
        },
    }
}

/// Release command, for mechanisms that leave something attached to the channel.
pub fn finish_command(mechanism: PlaybackMechanism, session_id: &str, file_path: &str) -> Option<EslCommand> {
    match mechanism {
        PlaybackMechanism::Displace => Some(EslCommand::Api(format!(
            "uuid_displace {} stop {}",
            session_id, file_path
        ))),
        PlaybackMechanism::Broadcast | PlaybackMechanism::Playback => None,
    }
}

/// `uuid_setvar` commands for the fork module's `STREAM_*` channel variables.
pub fn fork_variable_commands(fork: &ForkConfig, session_id: &str) -> Vec<EslCommand> {
    [
        ("STREAM_BUFFER_SIZE", fork.buffer_size.to_string()),
        ("STREAM_HEART_BEAT", fork.heart_beat_secs.to_string()),
        ("STREAM_SUPPRESS_LOG", fork.suppress_log.to_string()),
        ("STREAM_MESSAGE_DEFLATE", fork.message_deflate.to_string()),
    ]
    .into_iter()
    .map(|(name, value)| EslCommand::Api(format!("uuid_setvar {} {} {}", session_id, name, value)))
    .collect()
}

pub fn fork_start_command(fork: &ForkConfig, session_id: &str) -> EslCommand {
    let metadata = json!({
        "client_type": "freeswitch",
        "call_id": session_id,
        "audio_config": {
            "audioDataType": "raw",
            "sampleRate": fork.sample_rate,
            "channels": 1,
            "bitDepth": 16
        }
    });
    EslCommand::Api(format!(
        "uuid_audio_fork {} start {} {} {} {}",
        session_id, fork.ws_url, fork.mix_type, fork.sample_rate, metadata
    ))
}

pub struct EslBackend {
    config: EslConfig,
    idle: Mutex<Vec<EslConnection<TcpStream>>>,
}

impl EslBackend {
    pub fn new(config: EslConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> Result<EslConnection<TcpStream>, PlaybackError> {
        let pooled = self.idle.lock().pop();
        match pooled {
            Some(connection) => Ok(connection),
            None => {
                debug!("No idle ESL connection, opening another");
                EslConnection::connect(&self.config.host, self.config.port, &self.config.password)
                    .await
                    .map_err(connection_error)
            }
        }
    }

    fn release(&self, connection: EslConnection<TcpStream>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(connection);
        }
    }

    async fn run(&self, session_id: &str, command: EslCommand) -> Result<(), PlaybackError> {
        let mut connection = self.checkout().await?;

        let result: Result<EslMessage, EslError> = match &command {
            EslCommand::Api(api) => connection.api(api).await,
            EslCommand::Execute { app, arg } => connection.execute(session_id, app, arg).await,
        };

        match result {
            Ok(reply) => {
                self.release(connection);
                if reply.is_error_reply() {
                    Err(PlaybackError::Rejected(reply.reply_text().to_string()))
                } else {
                    Ok(())
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "ESL command failed, dropping connection");
                Err(connection_error(err))
            }
        }
    }
}

fn connection_error(err: EslError) -> PlaybackError {
    PlaybackError::Connection(err.to_string())
}

impl PlaybackBackend for EslBackend {
    fn name(&self) -> &str {
        "freeswitch-esl"
    }

    fn play_file<'a>(
        &'a self,
        mechanism: PlaybackMechanism,
        session_id: &'a str,
        file_path: &'a str,
        _sample_rate: Option<u32>,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.run(session_id, play_command(mechanism, session_id, file_path))
                .await
        })
    }

    fn finish_playback<'a>(
        &'a self,
        mechanism: PlaybackMechanism,
        session_id: &'a str,
        file_path: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            match finish_command(mechanism, session_id, file_path) {
                Some(command) => self.run(session_id, command).await,
                None => Ok(()),
            }
        })
    }

    fn stop_playback<'a>(&'a self, session_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.run(session_id, EslCommand::Api(format!("uuid_break {} all", session_id)))
                .await
        })
    }

    fn start_audio_fork<'a>(&'a self, session_id: &'a str, fork: &'a ForkConfig) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            for command in fork_variable_commands(fork, session_id) {
                if let Err(err) = self.run(session_id, command).await {
                    warn!(session_id = %session_id, error = %err, "Failed to set fork channel variable");
                }
            }
            self.run(session_id, fork_start_command(fork, session_id))
                .await?;
            info!(session_id = %session_id, ws_url = %fork.ws_url, "Audio fork started");
            Ok(())
        })
    }

    fn stop_audio_fork<'a>(&'a self, session_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.run(session_id, EslCommand::Api(format!("uuid_audio_fork {} stop", session_id)))
                .await
        })
    }
}
