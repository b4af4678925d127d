//! Settings for the gateway and chat flows.
//!
//! Values are read once through a [`ConfigProvider`] and then handed to the
//! clients explicitly. Nothing else in the crate reads the environment.

use std::collections::HashMap;

use hyper::Uri;
use secrecy::SecretString;

use crate::Error;

pub const GATEWAY_URL: &str = "API_MANAGEMENT_GATEWAY_URL";
pub const DEPLOYMENT_NAME: &str = "DEPLOYMENT_NAME";
pub const SUBSCRIPTION_KEY: &str = "APIM_SUBSCRIPTION_KEY";
pub const API_VERSION: &str = "API_VERSION";
pub const TOKEN_MODEL: &str = "MODEL_FOR_TOKENS";
pub const STREAM_RESPONSE: &str = "STREAM_RESPONSE";
pub const DEBUG_AUTHORIZATION: &str = "APIM_DEBUG_AUTHORIZATION";
pub const TRACE_PATH: &str = "APIM_TRACE_PATH";

pub const DEFAULT_API_VERSION: &str = "2024-09-01-preview";
pub const DEFAULT_TOKEN_MODEL: &str = "gpt-4o-mini-2024-07-18";
pub const DEFAULT_TRACE_PATH: &str = "/diagnostics/traces";

/// Source of raw configuration values.
pub trait ConfigProvider {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvProvider;

impl ConfigProvider for EnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigProvider for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

fn optional(provider: &impl ConfigProvider, key: &str) -> Option<String> {
    provider
        .get(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required(provider: &impl ConfigProvider, key: &str) -> Result<String, Error> {
    optional(provider, key)
        .ok_or_else(|| Error::Configuration(format!("missing {key} environment variable")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Configuration(format!(
            "{key} must be a boolean, got `{other}`"
        ))),
    }
}

/// Connection settings shared by the chat and trace flows.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    base_url: String,
    subscription_key: SecretString,
    debug_authorization: Option<SecretString>,
    trace_path: String,
}

impl GatewayConfig {
    pub fn load(provider: &impl ConfigProvider) -> Result<Self, Error> {
        let base_url = required(provider, GATEWAY_URL)?;
        validate_base_url(&base_url)?;
        let subscription_key = SecretString::new(required(provider, SUBSCRIPTION_KEY)?);
        let debug_authorization = optional(provider, DEBUG_AUTHORIZATION).map(SecretString::new);

        let mut trace_path =
            optional(provider, TRACE_PATH).unwrap_or_else(|| DEFAULT_TRACE_PATH.to_owned());
        if !trace_path.starts_with('/') {
            trace_path.insert(0, '/');
        }

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            subscription_key,
            debug_authorization,
            trace_path: trace_path.trim_end_matches('/').to_owned(),
        })
    }

    /// Gateway URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn subscription_key(&self) -> &SecretString {
        &self.subscription_key
    }

    pub fn debug_authorization(&self) -> Option<&SecretString> {
        self.debug_authorization.as_ref()
    }

    pub fn trace_path(&self) -> &str {
        &self.trace_path
    }
}

fn validate_base_url(url: &str) -> Result<(), Error> {
    let uri: Uri = url
        .parse()
        .map_err(|e| Error::Configuration(format!("{GATEWAY_URL} is not a valid URL: {e}")))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => {
            return Err(Error::Configuration(format!(
                "{GATEWAY_URL} must use http or https, got `{url}`"
            )))
        }
    }
    if uri.host().is_none() {
        return Err(Error::Configuration(format!(
            "{GATEWAY_URL} has no host: `{url}`"
        )));
    }
    Ok(())
}

/// Everything the chat flow needs.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub gateway: GatewayConfig,
    pub deployment: String,
    pub api_version: String,
    pub token_model: String,
    pub stream: bool,
}

impl ChatConfig {
    pub fn load(provider: &impl ConfigProvider) -> Result<Self, Error> {
        let gateway = GatewayConfig::load(provider)?;
        let deployment = required(provider, DEPLOYMENT_NAME)?;
        let api_version =
            optional(provider, API_VERSION).unwrap_or_else(|| DEFAULT_API_VERSION.to_owned());
        let token_model =
            optional(provider, TOKEN_MODEL).unwrap_or_else(|| DEFAULT_TOKEN_MODEL.to_owned());
        let stream = match optional(provider, STREAM_RESPONSE) {
            Some(value) => parse_flag(STREAM_RESPONSE, &value)?,
            None => true,
        };

        Ok(Self {
            gateway,
            deployment,
            api_version,
            token_model,
            stream,
        })
    }
}
