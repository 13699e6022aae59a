use std::path::PathBuf;

use chorus_core::rtc::{IceServerConfig, RtcSettings, DEFAULT_STUN_URL};
use clap::{Args, Parser};

use crate::error::CliError;
use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "chorus",
    about = "Join a full-mesh audio conference through a signaling relay",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "CHORUS_SIGNALING_URL",
        default_value = "ws://127.0.0.1:8080/ws",
        help = "Signaling relay endpoint (http(s) URLs are rewritten to ws(s))"
    )]
    pub signaling_url: String,

    #[arg(long, env = "CHORUS_NAME", help = "Display name shown to other participants")]
    pub name: String,

    #[command(flatten)]
    pub ice: IceArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct IceArgs {
    #[arg(
        long = "stun",
        env = "CHORUS_STUN_URLS",
        value_delimiter = ',',
        default_value = DEFAULT_STUN_URL,
        value_name = "URL",
        help = "STUN servers, comma separated"
    )]
    pub stun: Vec<String>,

    #[arg(long = "turn-url", env = "CHORUS_TURN_URL", value_name = "URL")]
    pub turn_url: Option<String>,

    #[arg(long = "turn-username", env = "CHORUS_TURN_USERNAME")]
    pub turn_username: Option<String>,

    #[arg(long = "turn-credential", env = "CHORUS_TURN_CREDENTIAL", hide_env_values = true)]
    pub turn_credential: Option<String>,
}

impl IceArgs {
    pub fn to_settings(&self) -> Result<RtcSettings, CliError> {
        let mut servers: Vec<IceServerConfig> = self
            .stun
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(IceServerConfig::stun)
            .collect();

        match (&self.turn_url, &self.turn_username, &self.turn_credential) {
            (Some(url), Some(username), Some(credential))
                if !username.is_empty() && !credential.is_empty() =>
            {
                servers.push(IceServerConfig::turn(url, username, credential));
            }
            (Some(url), _, _) => {
                return Err(CliError::MissingTurnCredentials { url: url.clone() });
            }
            (None, None, None) => {}
            (None, _, _) => return Err(CliError::OrphanTurnCredentials),
        }

        Ok(RtcSettings::new(servers))
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CHORUS_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CHORUS_LOG_FILE",
        help = "Write logs to this file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn display_name(&self) -> Result<String, CliError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(CliError::EmptyName);
        }
        Ok(name.to_string())
    }
}
