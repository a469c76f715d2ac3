use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;
use log::info;

use crate::cli::Args;
use crate::error::RelayError;
use crate::llm::{ LlmConfig, LlmType };

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: String,
    pub key_path: String,
}

/// Process-wide relay settings, validated once at startup and read-only
/// afterwards.
#[derive(Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    pub llm: LlmConfig,
    pub rate_limit_per_second: NonZeroU32,
    pub tls: Option<TlsPaths>,
}

impl RelayConfig {
    pub fn from_args(args: &Args) -> Result<Self, RelayError> {
        let llm_type: LlmType = args.chat_llm_type
            .parse()
            .map_err(|e| RelayError::Config(format!("{}", e)))?;

        let api_key = Some(args.chat_api_key.trim().to_string()).filter(|k| !k.is_empty());
        if llm_type.requires_api_key() && api_key.is_none() {
            return Err(
                RelayError::Config(
                    format!("CHAT_API_KEY must be set for the {} provider", llm_type)
                )
            );
        }

        let addr = args.server_addr
            .parse::<SocketAddr>()
            .map_err(|e| RelayError::Config(format!("invalid SERVER_ADDR '{}': {}", args.server_addr, e)))?;

        let rate_limit_per_second = NonZeroU32::new(args.rate_limit_per_second).ok_or_else(||
            RelayError::Config("RATE_LIMIT_PER_SECOND must be greater than zero".into())
        )?;

        let tls = if args.enable_tls {
            match (&args.tls_cert_path, &args.tls_key_path) {
                (Some(cert_path), Some(key_path)) =>
                    Some(TlsPaths { cert_path: cert_path.clone(), key_path: key_path.clone() }),
                (Some(_), None) | (None, Some(_)) => {
                    return Err(
                        RelayError::Config(
                            "Both --tls-cert-path and --tls-key-path must be provided to enable TLS.".into()
                        )
                    );
                }
                (None, None) => {
                    return Err(RelayError::Config("TLS enabled without cert/key".into()));
                }
            }
        } else {
            None
        };

        Ok(Self {
            addr,
            llm: LlmConfig {
                llm_type,
                api_key,
                completion_model: args.chat_model.clone().filter(|m| !m.trim().is_empty()),
                base_url: args.chat_base_url.clone().filter(|u| !u.trim().is_empty()),
                connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            },
            rate_limit_per_second,
            tls,
        })
    }

    pub fn log_summary(&self) {
        info!("--- Core Configuration ---");
        info!("Server Address: {}", self.addr);
        info!("Chat LLM Type: {}", self.llm.llm_type);
        info!("Chat Model: {}", self.llm.completion_model.as_deref().unwrap_or("adapter default"));
        info!("Chat Base URL: {}", self.llm.base_url.as_deref().unwrap_or("adapter default"));
        info!("API Key Configured: {}", self.llm.api_key.is_some());
        info!("Rate Limit: {}/s", self.rate_limit_per_second);
        info!("TLS Enabled: {}", self.tls.is_some());
        info!("-------------------------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["chat-relay"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn gemini_without_key_fails_fast() {
        let a = args(&["--chat-llm-type", "gemini", "--chat-api-key", ""]);
        assert!(matches!(RelayConfig::from_args(&a), Err(RelayError::Config(_))));
    }

    #[test]
    fn ollama_needs_no_key() {
        let a = args(&["--chat-llm-type", "ollama", "--chat-api-key", ""]);
        let config = RelayConfig::from_args(&a).unwrap();
        assert_eq!(config.llm.llm_type, LlmType::Ollama);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn key_and_model_are_carried() {
        let a = args(&["--chat-api-key", " secret ", "--chat-model", "gemini-pro", "--server-addr", "0.0.0.0:8080"]);
        let config = RelayConfig::from_args(&a).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("secret"));
        assert_eq!(config.llm.completion_model.as_deref(), Some("gemini-pro"));
        assert_eq!(config.addr.port(), 8080);
    }

    #[test]
    fn tls_requires_both_paths() {
        let a = args(&["--chat-api-key", "k", "--enable-tls", "--tls-cert-path", "cert.pem"]);
        assert!(RelayConfig::from_args(&a).is_err());
    }

    #[test]
    fn zero_rate_limit_rejected() {
        let a = args(&["--chat-api-key", "k", "--rate-limit-per-second", "0"]);
        assert!(RelayConfig::from_args(&a).is_err());
    }
}
